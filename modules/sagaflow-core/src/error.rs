use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SagaError>;

/// Failure travelling through the task tree.
///
/// Cloneable because one failure can reach several waiters at once: the
/// parent of an aborted task, every task joining it, and the completion
/// handle.
#[derive(Debug, Clone, Error)]
pub enum SagaError {
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    #[error("invalid effect: {0}")]
    InvalidEffect(String),

    #[error("saga awaited a future that is not an effect; wrap it in `call`")]
    ForeignAwait,

    #[error("deferred work needs a tokio LocalSet")]
    NoLocalSet,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SagaError {
    /// Build a failure from any displayable message.
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        SagaError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        SagaError::InvalidEffect(reason.into())
    }
}

impl From<anyhow::Error> for SagaError {
    fn from(err: anyhow::Error) -> Self {
        SagaError::Failed(Arc::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel buffer overflow (limit {limit})")]
    Overflow { limit: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}
