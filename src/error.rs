//! Structured error taxonomy for the parts of the engine that callers need to
//! match on (DAG mutation and parallel-task launch). Everything downstream of
//! task execution is represented as event data rather than a `Result`, since
//! the scheduler records those outcomes and keeps running (see SPEC_FULL §A.2).

use thiserror::Error;

pub type ConduitResult<T> = Result<T, ConduitError>;

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("a node with id \"{id}\" already exists in pipeline \"{pipeline_id}\"")]
    DuplicateId { pipeline_id: String, id: String },

    #[error("invalid id \"{id}\": should only contain lowercase letters, numbers and \"_\"")]
    InvalidId { id: String },

    #[error("node \"{id}\" not found in pipeline \"{pipeline_id}\"")]
    NodeNotFound { pipeline_id: String, id: String },

    #[error("adding node \"{id}\" would create a cycle")]
    CyclicDependency { id: String },

    #[error("launching parallel task \"{id}\" failed: {source}")]
    ParallelLaunchFailure { id: String, source: anyhow::Error },
}
