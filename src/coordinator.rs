//! Encoding coordinator: the single serialized owner of the three sinks.
//!
//! All sink mutation (configure, start, append, stop) funnels through one
//! worker task consuming a single-consumer command queue, so encoder state
//! transitions are linearizable and the underlying writers are never
//! touched concurrently. Producers and the control surface talk to the
//! worker exclusively through the cloneable [`EncodingCoordinator`] handle.
//!
//! The worker tracks every append it forwards to a sink thread in a shared
//! pending counter; `stop_writing` blocks on that counter (bounded) before
//! any container is finalized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::compositor::{CompositorConfig, FrameCompositor};
use crate::config::SessionConfig;
use crate::errors::PipelineError;
use crate::publish::MediaLibrary;
use crate::sink::{EncoderSink, SinkStats};
use crate::timing::SyncClock;
use crate::types::{AudioChunk, SinkTarget, VideoFrame};

/// Bound on the stop drain barrier. Past this, finalization proceeds with
/// whatever was actually written.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting out the drain barrier.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Bytes written to each output directory by the pre-start storage probe.
const STORAGE_PROBE_BYTES: usize = 64 * 1024;

/// Lifecycle of the single active recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unconfigured,
    Configuring,
    Ready,
    Writing,
    Draining,
    Finalizing,
    Finished,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configuring => "configuring",
            SessionState::Ready => "ready",
            SessionState::Writing => "writing",
            SessionState::Draining => "draining",
            SessionState::Finalizing => "finalizing",
            SessionState::Finished => "finished",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sink that did not make it to a playable file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkFailure {
    pub target: SinkTarget,
    pub reason: String,
}

/// Terminal report of a recording session.
///
/// Partial success is preserved: every finalized output is listed (and has
/// been handed to the persistence layer) even when other targets failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub session_id: Uuid,
    /// Wall-clock instant writing began; shared by all three outputs so
    /// external tools can re-align them.
    pub started_at: DateTime<Utc>,
    /// Synchronization cutoff: min of the last accepted pts per stream.
    pub end_pts: Option<f64>,
    pub finalized: Vec<SinkStats>,
    pub failed: Vec<SinkFailure>,
    pub drain_timed_out: bool,
}

impl StopOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn stats_for(&self, target: SinkTarget) -> Option<&SinkStats> {
        self.finalized.iter().find(|s| s.target == target)
    }
}

enum Command {
    Configure {
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    StartWriting {
        first_pts: f64,
        reply: Option<oneshot::Sender<Result<(), PipelineError>>>,
    },
    AppendVideo {
        target: SinkTarget,
        frame: Arc<VideoFrame>,
    },
    AppendAudio {
        chunk: AudioChunk,
    },
    StopWriting {
        reply: oneshot::Sender<Result<StopOutcome, PipelineError>>,
    },
}

/// Cloneable handle to the coordinator worker.
#[derive(Clone)]
pub struct EncodingCoordinator {
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<SessionState>>,
    pending: Arc<AtomicU64>,
    clock: Arc<SyncClock>,
}

impl EncodingCoordinator {
    /// Spawns the worker task. Requires a running tokio runtime.
    pub fn spawn(compositor: Arc<FrameCompositor>, library: Arc<dyn MediaLibrary>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SessionState::Unconfigured));
        let pending = Arc::new(AtomicU64::new(0));
        let clock = Arc::new(SyncClock::new());

        let worker = Worker {
            rx,
            state: Arc::clone(&state),
            pending: Arc::clone(&pending),
            clock: Arc::clone(&clock),
            compositor,
            library,
            session: None,
        };
        tokio::spawn(worker.run());

        Self {
            tx,
            state,
            pending,
            clock,
        }
    }

    /// Current session state, the one source of truth every component
    /// consults.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends accepted but not yet written by a sink thread.
    pub fn pending_appends(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// The per-stream timestamp bookkeeping shared with the router.
    pub fn sync_clock(&self) -> Arc<SyncClock> {
        Arc::clone(&self.clock)
    }

    /// Validates the configuration and allocates the three sinks.
    /// Reentrant while not writing: the prior allocation is fully replaced
    /// and its files are removed.
    pub async fn configure(&self, config: SessionConfig) -> Result<(), PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Configure { config, reply })
            .map_err(|_| PipelineError::Shutdown)?;
        rx.await.map_err(|_| PipelineError::Shutdown)?
    }

    /// Opens all three sink sessions anchored at `first_pts`.
    pub async fn start_writing(&self, first_pts: f64) -> Result<(), PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StartWriting {
                first_pts,
                reply: Some(reply),
            })
            .map_err(|_| PipelineError::Shutdown)?;
        rx.await.map_err(|_| PipelineError::Shutdown)?
    }

    /// Fire-and-forget start used by the router when the first video frame
    /// arrives. A duplicate request is ignored by the worker.
    pub fn request_start(&self, first_pts: f64) {
        let _ = self.tx.send(Command::StartWriting {
            first_pts,
            reply: None,
        });
    }

    /// Non-blocking append. Dropped by the worker unless the session is
    /// writing and the target sink is healthy.
    pub fn append_video(&self, target: SinkTarget, frame: Arc<VideoFrame>) {
        let _ = self.tx.send(Command::AppendVideo { target, frame });
    }

    /// Non-blocking append fanned out to all three sinks by the worker.
    pub fn append_audio(&self, chunk: AudioChunk) {
        let _ = self.tx.send(Command::AppendAudio { chunk });
    }

    /// Drains, trims to the synchronization cutoff, finalizes all sinks and
    /// reports the terminal per-target result.
    pub async fn stop_writing(&self) -> Result<StopOutcome, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StopWriting { reply })
            .map_err(|_| PipelineError::Shutdown)?;
        rx.await.map_err(|_| PipelineError::Shutdown)?
    }
}

struct ActiveSession {
    id: Uuid,
    config: SessionConfig,
    started_at: Option<DateTime<Utc>>,
    first_pts: Option<f64>,
    sinks: [Option<EncoderSink>; 3],
    /// One warning per degraded sink, not one per dropped sample.
    drop_warned: [bool; 3],
}

struct Worker {
    rx: mpsc::UnboundedReceiver<Command>,
    state: Arc<RwLock<SessionState>>,
    pending: Arc<AtomicU64>,
    clock: Arc<SyncClock>,
    compositor: Arc<FrameCompositor>,
    library: Arc<dyn MediaLibrary>,
    session: Option<ActiveSession>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Configure { config, reply } => {
                    let _ = reply.send(self.handle_configure(config));
                }
                Command::StartWriting { first_pts, reply } => {
                    let quiet = reply.is_none();
                    let result = self.handle_start(first_pts, quiet);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                log::error!("deferred session start failed: {e}");
                            }
                        }
                    }
                }
                Command::AppendVideo { target, frame } => {
                    self.handle_append_video(target, frame);
                }
                Command::AppendAudio { chunk } => {
                    self.handle_append_audio(chunk);
                }
                Command::StopWriting { reply } => {
                    let _ = reply.send(self.handle_stop().await);
                }
            }
        }

        // Handle dropped mid-session: tear down without finalizing. The
        // outputs were never closed, so remove them rather than leave
        // unplayable partials.
        if let Some(session) = self.session.take() {
            log::warn!("coordinator dropped with session {} active", session.id);
            for sink in session.sinks.into_iter().flatten() {
                sink.cancel();
            }
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        log::debug!("session state {} -> {}", *state, next);
        *state = next;
    }

    fn handle_configure(&mut self, config: SessionConfig) -> Result<(), PipelineError> {
        let current = self.current_state();
        if matches!(
            current,
            SessionState::Writing | SessionState::Draining | SessionState::Finalizing
        ) {
            return Err(PipelineError::InvalidState {
                operation: "configure",
                state: current.to_string(),
            });
        }
        self.set_state(SessionState::Configuring);

        // Replace any prior allocation outright; its files go with it.
        if let Some(old) = self.session.take() {
            log::info!("configure: replacing session {}", old.id);
            for sink in old.sinks.into_iter().flatten() {
                sink.cancel();
            }
        }
        self.clock.clear();
        self.pending.store(0, Ordering::Release);

        if let Err(e) = config.validate() {
            self.set_state(SessionState::Unconfigured);
            return Err(e);
        }

        let mut sinks: [Option<EncoderSink>; 3] = [None, None, None];
        for target in SinkTarget::ALL {
            match EncoderSink::create(target, &config) {
                Ok(sink) => sinks[target.index()] = Some(sink),
                Err(e) => {
                    for sink in sinks.into_iter().flatten() {
                        sink.cancel();
                    }
                    self.set_state(SessionState::Unconfigured);
                    return Err(e);
                }
            }
        }

        let session = ActiveSession {
            id: Uuid::new_v4(),
            config,
            started_at: None,
            first_pts: None,
            sinks,
            drop_warned: [false; 3],
        };
        log::info!(
            "session {} configured: {}x{} @ {:.1} fps",
            session.id,
            session.config.width,
            session.config.height,
            session.config.fps
        );
        self.session = Some(session);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    fn handle_start(&mut self, first_pts: f64, quiet_if_started: bool) -> Result<(), PipelineError> {
        let current = self.current_state();
        if current == SessionState::Writing && quiet_if_started {
            // Both cameras raced to deliver the first frame; one won.
            return Ok(());
        }
        if current != SessionState::Ready {
            return Err(PipelineError::InvalidState {
                operation: "start writing",
                state: current.to_string(),
            });
        }
        let Some(mut session) = self.session.take() else {
            return Err(PipelineError::InvalidState {
                operation: "start writing",
                state: current.to_string(),
            });
        };

        // Storage probe before any sink opens: a vanished or full target
        // must fail the session while it is still output-free.
        for target in SinkTarget::ALL {
            let path = session.config.outputs.for_target(target);
            if let Err(e) = probe_storage(path) {
                let err = PipelineError::InsufficientResources(format!(
                    "output directory for '{}' is not writable: {e}",
                    path.display()
                ));
                log::error!("{err}");
                self.abort_session(session);
                return Err(err);
            }
        }

        for target in SinkTarget::ALL {
            let result = match session.sinks[target.index()].as_mut() {
                Some(sink) => sink.start(first_pts, Arc::clone(&self.pending)),
                None => Err(PipelineError::EncoderStart {
                    target,
                    reason: "sink missing".to_string(),
                }),
            };
            if let Err(e) = result {
                // One sink failing to open aborts the whole session; the
                // others are cancelled rather than left recording a
                // partial set of outputs.
                log::error!("session start aborted: {e}");
                self.abort_session(session);
                return Err(e);
            }
        }

        session.first_pts = Some(first_pts);
        session.started_at = Some(Utc::now());
        let config = CompositorConfig::from_session(&session.config);
        log::info!("session {} writing from pts {first_pts:.3}", session.id);
        self.session = Some(session);
        self.compositor.begin_recording(config);
        self.set_state(SessionState::Writing);
        Ok(())
    }

    /// Aborts a session before it produced anything, removing every
    /// output file.
    fn abort_session(&mut self, session: ActiveSession) {
        for sink in session.sinks.into_iter().flatten() {
            sink.cancel();
        }
        self.pending.store(0, Ordering::Release);
        self.set_state(SessionState::Failed);
    }

    fn handle_append_video(&mut self, target: SinkTarget, frame: Arc<VideoFrame>) {
        if self.current_state() != SessionState::Writing {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(sink) = session.sinks[target.index()].as_ref() else {
            return;
        };
        if sink.is_failed() {
            if !session.drop_warned[target.index()] {
                session.drop_warned[target.index()] = true;
                log::warn!("sink '{target}' degraded; its samples are now dropped");
            }
            return;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if !sink.submit_video(frame) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            log::debug!("sink '{target}' queue full, frame dropped");
        }
    }

    fn handle_append_audio(&mut self, chunk: AudioChunk) {
        if self.current_state() != SessionState::Writing {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        // Every output carries the shared audio track.
        for target in SinkTarget::ALL {
            let Some(sink) = session.sinks[target.index()].as_ref() else {
                continue;
            };
            if sink.is_failed() {
                continue;
            }
            self.pending.fetch_add(1, Ordering::AcqRel);
            if !sink.submit_audio(chunk.clone()) {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                log::debug!("sink '{target}' queue full, audio chunk dropped");
            }
        }
    }

    async fn handle_stop(&mut self) -> Result<StopOutcome, PipelineError> {
        let current = self.current_state();
        if current != SessionState::Writing {
            return Err(PipelineError::InvalidState {
                operation: "stop writing",
                state: current.to_string(),
            });
        }
        // No new samples are accepted from here on.
        self.set_state(SessionState::Draining);

        // Drain barrier: every already-accepted sample reaches its writer
        // before the cutoff is applied. Bounded; a stuck sink costs a
        // warning, never a hang.
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.pending.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let leftover = self.pending.load(Ordering::Acquire);
        let drain_timed_out = leftover > 0;
        if drain_timed_out {
            log::warn!("{}", PipelineError::DrainTimeout { pending: leftover });
        }

        let Some(mut session) = self.session.take() else {
            self.set_state(SessionState::Failed);
            return Err(PipelineError::InvalidState {
                operation: "stop writing",
                state: "writing without a session".to_string(),
            });
        };

        // Synchronization cutoff: no output may carry a sample past the
        // earliest-ending stream.
        let end_pts = self.clock.safe_end_pts().or(session.first_pts);
        if let Some(cutoff) = end_pts {
            log::info!("session {} ends at pts {:.3}", session.id, cutoff);
            for sink in session.sinks.iter().flatten() {
                sink.end_session(cutoff);
            }
        }

        // Compositor teardown before any sink input is marked finished, so
        // no in-flight composite is lost to a closing writer.
        self.compositor.reset();
        self.compositor.flush();

        self.set_state(SessionState::Finalizing);
        let mut handles = Vec::new();
        for slot in session.sinks.iter_mut() {
            if let Some(sink) = slot.take() {
                let target = sink.target();
                handles.push((
                    target,
                    tokio::task::spawn_blocking(move || sink.finish_blocking()),
                ));
            }
        }

        let mut finalized = Vec::new();
        let mut failed = Vec::new();
        for (target, handle) in handles {
            match handle.await {
                Ok(Ok(stats)) => finalized.push(stats),
                Ok(Err(e)) => failed.push(SinkFailure {
                    target,
                    reason: e.to_string(),
                }),
                Err(e) => failed.push(SinkFailure {
                    target,
                    reason: format!("finalize task panicked: {e}"),
                }),
            }
        }

        // Finished files go to the persistence layer even on partial
        // failure; a publish error leaves the file on disk and is logged.
        for stats in &finalized {
            if let Err(e) = self.library.publish(stats) {
                log::error!("publish of '{}' failed: {e}", stats.path.display());
            }
        }

        let outcome = StopOutcome {
            session_id: session.id,
            started_at: session.started_at.unwrap_or_else(Utc::now),
            end_pts,
            finalized,
            failed,
            drain_timed_out,
        };

        if outcome.all_succeeded() {
            log::info!(
                "session {} finished: {} outputs",
                session.id,
                outcome.finalized.len()
            );
            self.set_state(SessionState::Finished);
        } else {
            log::warn!(
                "session {} failed for {} of 3 targets",
                session.id,
                outcome.failed.len()
            );
            self.set_state(SessionState::Failed);
        }
        Ok(outcome)
    }
}

/// Writes and removes a probe file next to the given output path.
fn probe_storage(output: &std::path::Path) -> std::io::Result<()> {
    let dir = output.parent().unwrap_or_else(|| std::path::Path::new("."));
    let probe = dir.join(".dualcam-probe");
    std::fs::write(&probe, vec![0u8; STORAGE_PROBE_BYTES])?;
    std::fs::remove_file(&probe)
}
