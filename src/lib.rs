//! dualcam: the capture-to-disk pipeline of a dual-camera recorder.
//!
//! Two live video streams (front and back camera) plus one audio stream go
//! in; three independent, time-synchronized MP4 files come out: front
//! only, back only, and a composite of both with shared audio.
//!
//! The crate is the coordination and synchronization engine between
//! hardware producers and the encoders: it routes asynchronously-arriving
//! samples, composites the two video streams, feeds three concurrent
//! encoder sinks without data races, and shuts the whole thing down so
//! that no output ends on a frozen or truncated frame. Hardware capture,
//! UI and media-library ingestion live outside; producers deliver frames
//! through [`router::IngestRouter`] and the host drives the session with
//! [`RecordingPipeline`].
//!
//! # Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use dualcam::{NullLibrary, OutputPaths, RecordingPipeline, SessionConfig, StreamId};
//!
//! let pipeline = RecordingPipeline::new(Arc::new(NullLibrary));
//! let config = SessionConfig::new(OutputPaths::in_dir("/tmp", "take1"), 1280, 720, 30.0);
//! let router = pipeline.configure(config).await?;
//!
//! // From the camera callbacks:
//! router.on_video_frame(StreamId::Front, frame);
//!
//! // When the user stops recording:
//! let outcome = pipeline.stop().await?;
//! ```

pub mod compositor;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod pipeline;
pub mod publish;
pub mod router;
pub mod sink;
pub mod timing;
pub mod types;

// Testing utilities - synthetic data for offline testing
pub mod testing;

// Re-exports for convenience
pub use compositor::{CompositorConfig, FrameCompositor};
pub use config::{
    AudioParams, CompositeLayout, Orientation, OutputPaths, RecordingQuality, SessionConfig,
};
pub use coordinator::{EncodingCoordinator, SessionState, SinkFailure, StopOutcome};
pub use errors::PipelineError;
pub use pipeline::RecordingPipeline;
pub use publish::{MediaLibrary, NullLibrary, PublishError};
pub use router::{IngestRouter, RouterStats};
pub use sink::SinkStats;
pub use timing::{PtsClock, SyncClock};
pub use types::{AudioChunk, SinkTarget, StreamId, VideoFrame};

/// Initialize logging for the recording pipeline
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "dualcam=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_metadata() {
        assert_eq!(NAME, "dualcam");
        assert!(!VERSION.is_empty());
        assert!(!DESCRIPTION.is_empty());
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
