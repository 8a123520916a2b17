//! Hand-off of finished recordings to the host's media library.
//!
//! The pipeline treats persistence as a black box: every successfully
//! finalized output is offered exactly once, after its container is
//! closed. A publish failure is the host's problem to retry; the file
//! stays on disk and the session outcome is unaffected.

use thiserror::Error;

use crate::sink::SinkStats;

#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// The persistence boundary implemented by the embedding application.
pub trait MediaLibrary: Send + Sync {
    fn publish(&self, output: &SinkStats) -> Result<(), PublishError>;
}

/// Keeps the files where the sinks wrote them; for hosts that collect
/// paths from the stop outcome instead.
pub struct NullLibrary;

impl MediaLibrary for NullLibrary {
    fn publish(&self, output: &SinkStats) -> Result<(), PublishError> {
        log::debug!("leaving '{}' in place", output.path.display());
        Ok(())
    }
}
