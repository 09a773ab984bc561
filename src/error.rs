//! Error types for the coordination layer.
//!
//! [`Error`] is the crate-wide error. Broker-level variants
//! ([`Error::BrokerUnavailable`], [`Error::PublishTimeout`]) are meant to
//! propagate to the process owner; [`Error::UnknownAction`] is per task and is
//! logged and dropped by the worker side. Pipeline stage failures never reach
//! this type on the happy path: they are folded into the task's result payload.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::memo::MemoError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the addressing scheme, broker gateway, sides and pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// The broker connection is closed or could not be established.
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable {
        /// What went wrong with the connection
        reason: String,
    },

    /// No acknowledgement for a publish within the allotted time.
    #[error("publish to queue '{queue}' timed out after {timeout:?}")]
    PublishTimeout {
        /// Routing key of the message
        queue: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// A task named an action the worker has no handler for.
    #[error("unknown action '{action_id}' for task {task_uid}")]
    UnknownAction {
        /// The action id carried by the task
        action_id: String,
        /// The task that was dropped
        task_uid: String,
    },

    /// A queue was re-declared with different parameters.
    #[error("queue '{queue}' already declared with different parameters")]
    QueueConflict {
        /// The conflicting queue
        queue: String,
    },

    /// An exchange was re-declared with a different kind.
    #[error("exchange '{exchange}' already declared with different parameters")]
    ExchangeConflict {
        /// The conflicting exchange
        exchange: String,
    },

    /// Subscribe or bind against a queue that was never declared.
    #[error("queue '{queue}' is not declared")]
    UnknownQueue {
        /// The missing queue
        queue: String,
    },

    /// Publish or bind against an exchange that was never declared.
    #[error("exchange '{exchange}' is not declared")]
    UnknownExchange {
        /// The missing exchange
        exchange: String,
    },

    /// An identifier does not satisfy the addressing rules.
    #[error("invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        /// Which identifier ("action id", "agent id", ...)
        kind: &'static str,
        /// The rejected value
        value: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A progress value outside `[0, 100]` or not finite.
    #[error("progress {value} is outside [0, 100]")]
    InvalidProgress {
        /// The rejected value
        value: f64,
    },

    /// A pipeline stage failed after exhausting its attempts.
    #[error("stage '{stage}' failed: {message}")]
    PipelineStage {
        /// Stage name (raw, improved, mapped)
        stage: &'static str,
        /// Rendered cause chain
        message: String,
    },

    /// Startup or configuration problem; fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Memo store failure.
    #[error(transparent)]
    Memo(#[from] MemoError),

    /// Message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for [`Error::BrokerUnavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures of the broker infrastructure itself.
    ///
    /// These are not papered over by the sides; the process owner decides
    /// whether to restart.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::PublishTimeout { .. }
        )
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("TOML parse error: {err}"))
    }
}
