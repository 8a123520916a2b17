//! Pipeline error taxonomy.
//!
//! Configuration and start failures are fatal and surface synchronously to
//! the control caller. Mid-stream append failures degrade the affected sink
//! only; drain timeouts are logged and recovered. See the coordinator for
//! the propagation rules.

use thiserror::Error;

use crate::types::SinkTarget;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid output path or unsupported codec parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A sink could not open its output session; the whole session fails.
    #[error("sink '{target}' failed to start: {reason}")]
    EncoderStart { target: SinkTarget, reason: String },

    /// A sink rejected a sample after starting; that sink alone degrades.
    #[error("append to sink '{target}' failed: {reason}")]
    Append { target: SinkTarget, reason: String },

    /// The stop drain barrier expired with work still outstanding.
    #[error("drain timed out with {pending} append(s) outstanding")]
    DrainTimeout { pending: u64 },

    /// A sink failed to close its container.
    #[error("sink '{target}' failed to finalize: {reason}")]
    Finalize { target: SinkTarget, reason: String },

    /// Storage or memory shortfall detected before writing begins.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// An operation arrived while the session was in an incompatible state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("muxing error: {0}")]
    Muxing(String),

    /// The sink was cancelled before finalizing (start-failure cleanup).
    #[error("sink '{0}' was cancelled")]
    Cancelled(SinkTarget),

    /// The coordinator worker is gone; no further commands can be served.
    #[error("coordinator is shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for errors that terminate the whole session rather than a
    /// single sink.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::EncoderStart { .. }
                | PipelineError::InsufficientResources(_)
                | PipelineError::Shutdown
        )
    }
}
