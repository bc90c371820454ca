//! Error type shared by every governance component.
//!
//! Budget trips are not errors (they are [`AgentAction::Abort`] /
//! [`ToolDecision::Skip`] signals) and drain failures never surface here:
//! they are counted and reported in a [`FlushReport`].
//!
//! [`AgentAction::Abort`]: crate::pipeline::AgentAction::Abort
//! [`ToolDecision::Skip`]: crate::pipeline::ToolDecision::Skip
//! [`FlushReport`]: crate::queue::FlushReport

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GovernError {
    /// The queue is at capacity and configured to reject new writes.
    #[error("mutation queue full: capacity {capacity}")]
    QueueFull { capacity: usize },

    /// An external collaborator callback (`store`, `summarize`, persistence)
    /// failed. Propagated out of the hook that triggered it.
    #[error("collaborator '{name}' failed: {message}")]
    Collaborator { name: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GovernError {
    pub fn collaborator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type GovernResult<T> = Result<T, GovernError>;
