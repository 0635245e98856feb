//! # Executor Error Taxonomy
//!
//! Every executor failure falls into one of two families:
//!
//! - **Recoverable**: captured into the task's journal entry as an
//!   `ERROR <Kind>::<message>` status string. The task's pipeline stops, the
//!   task is excluded from the run's success list, and sibling tasks are
//!   unaffected.
//! - **Fatal**: escapes `scheduler::execute` entirely so the operator can
//!   debug. Programming errors and missing mandatory parameters belong here.
//!
//! The `<Kind>` labels are stable: `report::status_histogram` buckets journal
//! entries by them, and replay runs rely on the `ERROR ` prefix to decide
//! whether an executor needs to run again.

use thiserror::Error;

/// Failure raised by an executor run.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Domain/validation failure signalled by executor code.
    ///
    /// The message lands verbatim in the journal after `ERROR RuntimeError::`.
    #[error("{0}")]
    Runtime(String),

    /// Any HTTP-layer failure: connector, disconnect, OS-level socket,
    /// payload, or response-body error.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// The task's pipeline deadline elapsed while this executor was running.
    #[error("task deadline elapsed")]
    Timeout,

    /// The run was cancelled while this executor was in flight.
    #[error("run cancelled")]
    Cancelled,

    /// Anything the engine should not swallow. Propagates out of `execute`.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ExecError {
    /// Shorthand for a recoverable domain failure.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// The stable kind label used in journal status strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Runtime(_) => "RuntimeError",
            Self::Transport(_) => "ClientError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::Fatal(_) => "FatalError",
        }
    }

    /// Whether this failure is captured into the journal (vs. propagated).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// `<Kind>::<message>`, the detail part of a journal error status.
    pub fn status_detail(&self) -> String {
        format!("{}::{}", self.kind(), self)
    }

    /// The full journal status string, `ERROR <Kind>::<message>`.
    pub fn status_label(&self) -> String {
        format!("ERROR {}", self.status_detail())
    }
}
