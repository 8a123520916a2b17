//! Ingestion router: the single entry point for every hardware callback.
//!
//! Producers call in concurrently from their own threads at up to 60 Hz
//! per video stream. The router validates readiness against the session
//! state, applies per-stream backpressure (dropping, never queueing or
//! reordering), records accepted timestamps for the synchronization clock
//! and dispatches the surviving samples toward the sinks. Nothing in here
//! blocks on I/O.
//!
//! Create one router per configured session so the rate gates and
//! counters start fresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::compositor::FrameCompositor;
use crate::coordinator::{EncodingCoordinator, SessionState};
use crate::timing::SyncClock;
use crate::types::{AudioChunk, SinkTarget, StreamId, VideoFrame};

/// Per-stream minimum-spacing gate.
///
/// A sample is accepted only if its pts is strictly beyond the last
/// accepted one by at least the minimum interval. Dropping is the whole
/// backpressure mechanism: when a producer outruns the encoders, excess
/// samples die here instead of growing a queue.
#[derive(Debug)]
pub struct RateGate {
    min_interval: f64,
    last_accepted: Option<f64>,
}

impl RateGate {
    /// `min_interval` of zero disables spacing and keeps only the
    /// monotonicity check.
    pub fn new(min_interval: f64) -> Self {
        Self {
            min_interval,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, pts: f64) -> bool {
        match self.last_accepted {
            Some(last) if pts <= last => false,
            Some(last) if pts - last < self.min_interval => false,
            _ => {
                self.last_accepted = Some(pts);
                true
            }
        }
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }
}

/// Accepted/dropped totals per stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub accepted: [u64; 3],
    pub dropped: [u64; 3],
}

impl RouterStats {
    pub fn accepted_for(&self, stream: StreamId) -> u64 {
        self.accepted[stream.index()]
    }

    pub fn dropped_for(&self, stream: StreamId) -> u64 {
        self.dropped[stream.index()]
    }
}

pub struct IngestRouter {
    coordinator: EncodingCoordinator,
    compositor: Arc<FrameCompositor>,
    clock: Arc<SyncClock>,
    /// One gate per stream so the two cameras never contend on a lock.
    gates: [Mutex<RateGate>; 3],
    accepted: [AtomicU64; 3],
    dropped: [AtomicU64; 3],
}

impl IngestRouter {
    /// `min_frame_interval` applies to both video streams; audio is only
    /// monotonicity-checked (its pacing comes from the audio hardware).
    pub fn new(
        coordinator: EncodingCoordinator,
        compositor: Arc<FrameCompositor>,
        min_frame_interval: f64,
    ) -> Self {
        let clock = coordinator.sync_clock();
        Self {
            coordinator,
            compositor,
            clock,
            gates: [
                Mutex::new(RateGate::new(min_frame_interval)),
                Mutex::new(RateGate::new(min_frame_interval)),
                Mutex::new(RateGate::new(0.0)),
            ],
            accepted: Default::default(),
            dropped: Default::default(),
        }
    }

    /// Video callback contract: fire-and-forget, callable from any thread.
    ///
    /// The very first accepted video frame triggers the one-time session
    /// start anchored at its timestamp.
    pub fn on_video_frame(&self, stream: StreamId, frame: VideoFrame) {
        let Some(target) = stream.sink_target() else {
            log::warn!("audio stream id on the video path, sample dropped");
            return;
        };

        let state = self.coordinator.state();
        let first_frame_window = state == SessionState::Ready;
        if state != SessionState::Writing && !first_frame_window {
            self.count_drop(stream);
            return;
        }

        {
            let mut gate = self.gates[stream.index()]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !gate.accept(frame.pts) {
                self.count_drop(stream);
                return;
            }
        }

        self.clock.record_pts(stream, frame.pts);
        self.accepted[stream.index()].fetch_add(1, Ordering::Relaxed);

        if first_frame_window {
            self.coordinator.request_start(frame.pts);
        }

        // The compositor borrows the frame for the combined target; the
        // frame itself then moves to its single-stream sink.
        let frame = Arc::new(frame);
        if let Some(composite) = self.compositor.compose(stream, &frame) {
            self.coordinator
                .append_video(SinkTarget::Combined, Arc::new(composite));
        }
        self.coordinator.append_video(target, frame);
    }

    /// Audio callback contract: fire-and-forget, callable from any thread.
    /// Audio is only accepted while the session is writing; the worker
    /// fans it out to all three sinks.
    pub fn on_audio_chunk(&self, chunk: AudioChunk) {
        if self.coordinator.state() != SessionState::Writing {
            self.count_drop(StreamId::Audio);
            return;
        }

        {
            let mut gate = self.gates[StreamId::Audio.index()]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !gate.accept(chunk.pts) {
                self.count_drop(StreamId::Audio);
                return;
            }
        }

        self.clock.record_pts(StreamId::Audio, chunk.pts);
        self.accepted[StreamId::Audio.index()].fetch_add(1, Ordering::Relaxed);
        self.coordinator.append_audio(chunk);
    }

    /// Last pts this router accepted for a stream.
    pub fn last_accepted_pts(&self, stream: StreamId) -> Option<f64> {
        self.gates[stream.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_accepted()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            accepted: std::array::from_fn(|i| self.accepted[i].load(Ordering::Relaxed)),
            dropped: std::array::from_fn(|i| self.dropped[i].load(Ordering::Relaxed)),
        }
    }

    fn count_drop(&self, stream: StreamId) {
        self.dropped[stream.index()].fetch_add(1, Ordering::Relaxed);
        log::trace!("dropped {} sample", stream.as_str());
    }
}
