//! Error types for stagequeue.

use thiserror::Error;

use crate::model::{MessageId, Stage};

#[derive(Debug, Error)]
pub enum Error {
    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// The conditional update's precondition did not hold: the message was
    /// already moved, released, or is owned by someone else.
    #[error("stale transition for message {id}: {from} -> {to}")]
    StaleTransition { id: MessageId, from: Stage, to: Stage },

    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("stage handler failed for message {id} at {stage}: {reason}")]
    HandlerFailure {
        id: MessageId,
        stage: Stage,
        reason: String,
    },

    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("queue store unreachable for {cycles} consecutive cycles")]
    StoreUnreachable { cycles: u32 },

    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transport-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::StoreUnavailable(e.to_string()),
            other => Error::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
