//! Shared monotonic timebase and per-stream synchronization bookkeeping.
//!
//! Every producer stamps its samples from one `PtsClock` so the three
//! streams live on a single timeline. The `SyncClock` tracks the latest
//! accepted timestamp per stream; its minimum is the safe session end time
//! used to cut all three outputs at the same instant.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::types::StreamId;

/// Monotonic clock for presentation timestamps.
///
/// Cloning shares the timebase; hand clones to the camera and audio
/// producers so their timestamps are directly comparable.
#[derive(Debug, Clone)]
pub struct PtsClock {
    epoch: Arc<Instant>,
}

impl PtsClock {
    pub fn new() -> Self {
        Self {
            epoch: Arc::new(Instant::now()),
        }
    }

    /// Seconds elapsed since the clock was created.
    #[inline]
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Timestamp of a captured instant on this timebase.
    #[inline]
    pub fn at(&self, instant: Instant) -> f64 {
        instant.duration_since(*self.epoch).as_secs_f64()
    }
}

impl Default for PtsClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest accepted pts per stream, written by the ingestion router and read
/// by the coordinator when the session stops.
#[derive(Debug, Default)]
pub struct SyncClock {
    last: Mutex<[Option<f64>; 3]>,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted sample timestamp. Keeps the maximum, so late
    /// bookkeeping can never move a stream's clock backwards.
    pub fn record_pts(&self, stream: StreamId, pts: f64) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut last[stream.index()];
        match slot {
            Some(prev) if *prev >= pts => {}
            _ => *slot = Some(pts),
        }
    }

    pub fn last_pts(&self, stream: StreamId) -> Option<f64> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last[stream.index()]
    }

    /// Safe session end: the minimum of the last timestamps across every
    /// stream that delivered anything. Cutting all outputs here guarantees
    /// no file ends with a frozen video tail or unmatched audio.
    ///
    /// Streams that never produced a sample do not constrain the result;
    /// `None` means nothing was ever accepted.
    pub fn safe_end_pts(&self) -> Option<f64> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.iter()
            .flatten()
            .copied()
            .fold(None, |acc: Option<f64>, pts| {
                Some(acc.map_or(pts, |m| m.min(pts)))
            })
    }

    /// Forgets all recorded timestamps (new session).
    pub fn clear(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = [None; 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pts_clock_is_monotonic() {
        let clock = PtsClock::new();
        let a = clock.now();
        thread::sleep(Duration::from_millis(5));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn test_clones_share_the_timebase() {
        let clock = PtsClock::new();
        let other = clock.clone();
        thread::sleep(Duration::from_millis(2));
        assert!((clock.now() - other.now()).abs() < 0.001);
    }

    #[test]
    fn test_safe_end_is_the_minimum() {
        let sync = SyncClock::new();
        sync.record_pts(StreamId::Front, 10.0);
        sync.record_pts(StreamId::Back, 9.5);
        sync.record_pts(StreamId::Audio, 10.2);
        assert_eq!(sync.safe_end_pts(), Some(9.5));
    }

    #[test]
    fn test_missing_stream_does_not_constrain() {
        let sync = SyncClock::new();
        sync.record_pts(StreamId::Front, 4.0);
        sync.record_pts(StreamId::Back, 5.0);
        assert_eq!(sync.safe_end_pts(), Some(4.0));
    }

    #[test]
    fn test_empty_clock_has_no_end() {
        let sync = SyncClock::new();
        assert_eq!(sync.safe_end_pts(), None);
    }

    #[test]
    fn test_record_keeps_the_maximum() {
        let sync = SyncClock::new();
        sync.record_pts(StreamId::Front, 2.0);
        sync.record_pts(StreamId::Front, 1.0);
        assert_eq!(sync.last_pts(StreamId::Front), Some(2.0));
    }

    #[test]
    fn test_clear_resets_all_streams() {
        let sync = SyncClock::new();
        sync.record_pts(StreamId::Audio, 1.0);
        sync.clear();
        assert_eq!(sync.last_pts(StreamId::Audio), None);
        assert_eq!(sync.safe_end_pts(), None);
    }
}
