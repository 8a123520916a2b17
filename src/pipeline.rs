//! Top-level control surface: wires the compositor, coordinator and router
//! together for the capture manager.
//!
//! Typical flow: `configure` a session, hand the returned router to the
//! hardware producers, let the first video frame start the recording, and
//! `stop` to get the three finalized files.

use std::sync::{Arc, RwLock};

use crate::compositor::FrameCompositor;
use crate::config::SessionConfig;
use crate::coordinator::{EncodingCoordinator, SessionState, StopOutcome};
use crate::errors::PipelineError;
use crate::publish::MediaLibrary;
use crate::router::IngestRouter;

pub struct RecordingPipeline {
    coordinator: EncodingCoordinator,
    compositor: Arc<FrameCompositor>,
    router: RwLock<Option<Arc<IngestRouter>>>,
}

impl RecordingPipeline {
    /// Requires a running tokio runtime.
    pub fn new(library: Arc<dyn MediaLibrary>) -> Self {
        let compositor = Arc::new(FrameCompositor::new());
        let coordinator = EncodingCoordinator::spawn(Arc::clone(&compositor), library);
        Self {
            coordinator,
            compositor,
            router: RwLock::new(None),
        }
    }

    /// Configures a new session and returns the ingestion entry point to
    /// hand to the hardware producers. Replaces any prior, not-yet-writing
    /// session.
    pub async fn configure(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<IngestRouter>, PipelineError> {
        let min_interval = config.min_frame_interval();
        self.coordinator.configure(config).await?;

        let router = Arc::new(IngestRouter::new(
            self.coordinator.clone(),
            Arc::clone(&self.compositor),
            min_interval,
        ));
        *self.router.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&router));
        Ok(router)
    }

    /// The current session's router, if one is configured.
    pub fn router(&self) -> Option<Arc<IngestRouter>> {
        self.router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Explicit start. Ordinarily unnecessary: the first accepted video
    /// frame starts the session at its own timestamp.
    pub async fn start_writing(&self, first_pts: f64) -> Result<(), PipelineError> {
        self.coordinator.start_writing(first_pts).await
    }

    /// Stops the session and returns the terminal per-target report.
    pub async fn stop(&self) -> Result<StopOutcome, PipelineError> {
        self.coordinator.stop_writing().await
    }

    pub fn state(&self) -> SessionState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &EncodingCoordinator {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputPaths;
    use crate::publish::NullLibrary;

    #[test]
    fn test_failed_configure_leaves_no_router() {
        tokio_test::block_on(async {
            let pipeline = RecordingPipeline::new(Arc::new(NullLibrary));
            let config = SessionConfig::new(
                OutputPaths::in_dir("/no/such/directory", "take"),
                64,
                64,
                30.0,
            );
            assert!(pipeline.configure(config).await.is_err());
            assert!(pipeline.router().is_none());
            assert_eq!(pipeline.state(), SessionState::Unconfigured);
        });
    }

    #[test]
    fn test_configure_hands_out_a_router() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let pipeline = RecordingPipeline::new(Arc::new(NullLibrary));
            let config = SessionConfig::new(OutputPaths::in_dir(dir.path(), "take"), 64, 64, 30.0);
            let router = pipeline.configure(config).await.unwrap();
            assert_eq!(pipeline.state(), SessionState::Ready);
            assert!(Arc::ptr_eq(&router, &pipeline.router().unwrap()));
        });
    }
}
