//! Encoder sinks: one MP4 output per target, each written by a dedicated
//! thread.
//!
//! A sink owns an H.264 encoder, an Opus encoder and a muxide muxer. The
//! coordinator feeds it raw frames/chunks through a bounded channel; the
//! writer thread encodes and muxes them. Encoded samples pass through a
//! short holdback queue before reaching the container, so the session
//! cutoff (`end_session`) can trim trailing samples that would otherwise
//! freeze the tail of one output past the other streams' end.
//!
//! A sink that fails mid-stream keeps draining its queue (so the stop
//! drain barrier is never wedged) but writes nothing further; the other
//! sinks are unaffected.

mod audio;
mod video;

pub use audio::{EncodedAudio, OpusAudioEncoder};
pub use video::{EncodedVideo, VideoEncoder};

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use muxide::api::{AudioCodec, Metadata, Muxer, MuxerBuilder, VideoCodec};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::errors::PipelineError;
use crate::types::{AudioChunk, SinkTarget, VideoFrame};

/// Seconds an encoded sample is held before muxing. Bounds both the
/// trimming precision of `end_session` and the sink's extra memory.
pub(crate) const HOLDBACK_WINDOW: f64 = 1.0;

/// Writer queue depth: about three seconds of 60fps video.
const QUEUE_CAPACITY: usize = 180;

/// Statistics for one finalized output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkStats {
    pub target: SinkTarget,
    pub path: PathBuf,
    pub video_frames: u64,
    pub audio_packets: u64,
    pub bytes_written: u64,
    pub duration_secs: f64,
    /// Samples discarded at or past the session cutoff.
    pub trimmed_samples: u64,
    /// Session-timeline pts of the last muxed video frame.
    pub last_video_pts: Option<f64>,
}

enum SinkJob {
    Video(Arc<VideoFrame>),
    Audio(AudioChunk),
    EndSession { cutoff: f64 },
    Finish,
}

/// One encoder/output pair, owned exclusively by the coordinator.
pub(crate) struct EncoderSink {
    target: SinkTarget,
    path: PathBuf,
    /// Present from `create` until `start` moves it onto the thread.
    writer: Option<SinkWriter>,
    tx: Option<Sender<SinkJob>>,
    thread: Option<JoinHandle<Result<SinkStats, PipelineError>>>,
    failed: Arc<AtomicBool>,
}

impl EncoderSink {
    /// Allocates the sink: creates the output file and both encoders.
    /// Invalid paths and unsupported codec parameters surface here.
    pub fn create(target: SinkTarget, config: &SessionConfig) -> Result<Self, PipelineError> {
        let path = config.outputs.for_target(target).clone();
        let file = File::create(&path).map_err(|e| {
            PipelineError::Configuration(format!("cannot create '{}': {e}", path.display()))
        })?;

        let video = VideoEncoder::new(
            config.width,
            config.height,
            config.fps,
            config.bitrate,
            config.orientation,
        )?;
        let audio = OpusAudioEncoder::new(
            config.audio.sample_rate,
            config.audio.channels,
            config.audio.bitrate,
        )?;

        let (out_w, out_h) = video.output_dims();
        let metadata = match &config.title {
            Some(title) => Metadata::new().with_title(title).with_current_time(),
            None => Metadata::new().with_current_time(),
        };
        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(VideoCodec::H264, out_w, out_h, config.fps)
            .audio(
                AudioCodec::Opus,
                config.audio.sample_rate,
                config.audio.channels,
            )
            .with_fast_start(config.fast_start)
            .with_metadata(metadata)
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("muxer for '{}': {e}", path.display()))
            })?;

        Ok(Self {
            target,
            path: path.clone(),
            writer: Some(SinkWriter {
                target,
                path,
                muxer,
                video,
                audio,
                anchor: 0.0,
                cutoff: None,
                holdback: VecDeque::new(),
                newest_pts: f64::NEG_INFINITY,
                muxed_video: 0,
                muxed_audio: 0,
                trimmed: 0,
                last_video_pts: None,
            }),
            tx: None,
            thread: None,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn target(&self) -> SinkTarget {
        self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the output session anchored at `first_pts` and spawns the
    /// writer thread. Container time zero corresponds to `first_pts` on
    /// the session timeline.
    pub fn start(&mut self, first_pts: f64, pending: Arc<AtomicU64>) -> Result<(), PipelineError> {
        let mut writer = self.writer.take().ok_or_else(|| PipelineError::EncoderStart {
            target: self.target,
            reason: "sink already started".to_string(),
        })?;
        writer.anchor = first_pts;

        let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let failed = Arc::clone(&self.failed);
        let thread = std::thread::Builder::new()
            .name(format!("sink-{}", self.target.as_str()))
            .spawn(move || run_writer(writer, rx, pending, failed))
            .map_err(|e| PipelineError::EncoderStart {
                target: self.target,
                reason: format!("writer thread spawn failed: {e}"),
            })?;

        self.tx = Some(tx);
        self.thread = Some(thread);
        Ok(())
    }

    /// True once the writer hit an unrecoverable encode/mux error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Non-blocking submit. `false` means the bounded queue rejected the
    /// sample (writer is behind) or the sink is not running.
    pub fn submit_video(&self, frame: Arc<VideoFrame>) -> bool {
        self.submit(SinkJob::Video(frame))
    }

    pub fn submit_audio(&self, chunk: AudioChunk) -> bool {
        self.submit(SinkJob::Audio(chunk))
    }

    fn submit(&self, job: SinkJob) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    /// Declares the session end: samples past `cutoff` (session timeline)
    /// never reach the container.
    pub fn end_session(&self, cutoff: f64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(SinkJob::EndSession { cutoff });
        }
    }

    /// Finalizes the container and joins the writer thread. Blocking; run
    /// on a blocking-capable thread.
    pub fn finish_blocking(mut self) -> Result<SinkStats, PipelineError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(SinkJob::Finish);
        }
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(PipelineError::Finalize {
                    target: self.target,
                    reason: "writer thread panicked".to_string(),
                })
            }),
            None => Err(PipelineError::Cancelled(self.target)),
        }
    }

    /// Abandons the sink and removes its output file. Used when another
    /// sink's start failure aborts the whole session: no partial files
    /// are left behind.
    pub fn cancel(mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        // Close the muxer/file handle before unlinking.
        self.writer.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("cancel: could not remove '{}': {e}", self.path.display());
        }
    }
}

/// Writer thread body: encode, hold back, mux; drain forever even after
/// failure so the coordinator's pending counter always reaches zero.
fn run_writer(
    mut writer: SinkWriter,
    rx: Receiver<SinkJob>,
    pending: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
) -> Result<SinkStats, PipelineError> {
    let mut error: Option<PipelineError> = None;
    let mut finish_requested = false;

    while let Ok(job) = rx.recv() {
        match job {
            SinkJob::Video(frame) => {
                let result = if error.is_none() {
                    writer.write_video(&frame)
                } else {
                    Ok(())
                };
                pending.fetch_sub(1, Ordering::AcqRel);
                if let Err(e) = result {
                    let e = PipelineError::Append {
                        target: writer.target,
                        reason: e.to_string(),
                    };
                    log::error!("{e}");
                    failed.store(true, Ordering::Release);
                    error = Some(e);
                }
            }
            SinkJob::Audio(chunk) => {
                let result = if error.is_none() {
                    writer.write_audio(&chunk)
                } else {
                    Ok(())
                };
                pending.fetch_sub(1, Ordering::AcqRel);
                if let Err(e) = result {
                    let e = PipelineError::Append {
                        target: writer.target,
                        reason: e.to_string(),
                    };
                    log::error!("{e}");
                    failed.store(true, Ordering::Release);
                    error = Some(e);
                }
            }
            SinkJob::EndSession { cutoff } => writer.end_session(cutoff),
            SinkJob::Finish => {
                finish_requested = true;
                break;
            }
        }
    }

    if let Some(e) = error {
        return Err(e);
    }
    if !finish_requested {
        return Err(PipelineError::Cancelled(writer.target));
    }
    writer.finish()
}

/// An encoded sample waiting out the holdback window.
enum HeldSample {
    Video {
        pts: f64,
        data: Vec<u8>,
        keyframe: bool,
    },
    Audio {
        pts: f64,
        data: Vec<u8>,
    },
}

impl HeldSample {
    fn pts(&self) -> f64 {
        match self {
            HeldSample::Video { pts, .. } | HeldSample::Audio { pts, .. } => *pts,
        }
    }
}

struct SinkWriter {
    target: SinkTarget,
    path: PathBuf,
    muxer: Muxer<BufWriter<File>>,
    video: VideoEncoder,
    audio: OpusAudioEncoder,
    /// Session-timeline pts mapped to container time zero.
    anchor: f64,
    cutoff: Option<f64>,
    holdback: VecDeque<HeldSample>,
    newest_pts: f64,
    muxed_video: u64,
    muxed_audio: u64,
    trimmed: u64,
    last_video_pts: Option<f64>,
}

impl SinkWriter {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<(), PipelineError> {
        if self.past_cutoff(frame.pts) {
            self.trimmed += 1;
            return Ok(());
        }
        if let Some(encoded) = self.video.encode(&frame.data)? {
            self.hold(HeldSample::Video {
                pts: frame.pts,
                data: encoded.data,
                keyframe: encoded.keyframe,
            })?;
        }
        Ok(())
    }

    fn write_audio(&mut self, chunk: &AudioChunk) -> Result<(), PipelineError> {
        if self.past_cutoff(chunk.pts) {
            self.trimmed += 1;
            return Ok(());
        }
        for packet in self.audio.push(chunk)? {
            if self.past_cutoff(packet.pts) {
                self.trimmed += 1;
                continue;
            }
            self.hold(HeldSample::Audio {
                pts: packet.pts,
                data: packet.data,
            })?;
        }
        Ok(())
    }

    fn past_cutoff(&self, pts: f64) -> bool {
        matches!(self.cutoff, Some(cutoff) if pts > cutoff)
    }

    fn hold(&mut self, sample: HeldSample) -> Result<(), PipelineError> {
        self.newest_pts = self.newest_pts.max(sample.pts());
        self.holdback.push_back(sample);

        // Flush everything old enough that a later cutoff can no longer
        // affect it.
        while let Some(front) = self.holdback.front() {
            if front.pts() + HOLDBACK_WINDOW >= self.newest_pts {
                break;
            }
            if let Some(sample) = self.holdback.pop_front() {
                self.mux(sample)?;
            }
        }
        Ok(())
    }

    fn mux(&mut self, sample: HeldSample) -> Result<(), PipelineError> {
        match sample {
            HeldSample::Video {
                pts,
                data,
                keyframe,
            } => {
                let container_pts = (pts - self.anchor).max(0.0);
                self.muxer
                    .write_video(container_pts, &data, keyframe)
                    .map_err(|e| PipelineError::Muxing(format!("write_video: {e}")))?;
                self.muxed_video += 1;
                self.last_video_pts = Some(pts);
            }
            HeldSample::Audio { pts, data } => {
                let container_pts = (pts - self.anchor).max(0.0);
                self.muxer
                    .write_audio(container_pts, &data)
                    .map_err(|e| PipelineError::Muxing(format!("write_audio: {e}")))?;
                self.muxed_audio += 1;
            }
        }
        Ok(())
    }

    /// Records the cutoff and trims already-held samples past it.
    fn end_session(&mut self, cutoff: f64) {
        self.cutoff = Some(cutoff);
        let before = self.holdback.len();
        self.holdback.retain(|sample| sample.pts() <= cutoff);
        let dropped = before - self.holdback.len();
        self.trimmed += dropped as u64;
        if dropped > 0 {
            log::debug!(
                "sink '{}': trimmed {dropped} held sample(s) past cutoff {cutoff:.3}",
                self.target
            );
        }
    }

    fn finish(mut self) -> Result<SinkStats, PipelineError> {
        // Emit the final partial audio frame, still subject to the cutoff.
        for packet in self.audio.flush()? {
            if self.past_cutoff(packet.pts) {
                self.trimmed += 1;
                continue;
            }
            self.holdback.push_back(HeldSample::Audio {
                pts: packet.pts,
                data: packet.data,
            });
        }

        while let Some(sample) = self.holdback.pop_front() {
            self.mux(sample)?;
        }

        let stats = self
            .muxer
            .finish_with_stats()
            .map_err(|e| PipelineError::Finalize {
                target: self.target,
                reason: e.to_string(),
            })?;

        log::info!(
            "sink '{}' finalized: {} video frames, {} audio packets, {:.2}s, {} bytes",
            self.target,
            self.muxed_video,
            self.muxed_audio,
            stats.duration_secs,
            stats.bytes_written
        );

        Ok(SinkStats {
            target: self.target,
            path: self.path,
            video_frames: self.muxed_video,
            audio_packets: self.muxed_audio,
            bytes_written: stats.bytes_written,
            duration_secs: stats.duration_secs,
            trimmed_samples: self.trimmed,
            last_video_pts: self.last_video_pts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputPaths;
    use std::env::temp_dir;
    use std::sync::atomic::AtomicU64;

    fn test_config(dir: &Path, stem: &str) -> SessionConfig {
        SessionConfig::new(OutputPaths::in_dir(dir, stem), 64, 64, 30.0)
    }

    fn gray_frame(pts: f64, seq: u64) -> Arc<VideoFrame> {
        Arc::new(VideoFrame::new(vec![110u8; 64 * 64 * 3], 64, 64, pts, seq))
    }

    #[test]
    fn test_create_rejects_bad_path() {
        let mut config = test_config(&temp_dir(), "sink_badpath");
        config.outputs.front = PathBuf::from("/no/such/dir/out.mp4");
        let result = EncoderSink::create(SinkTarget::Front, &config);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_submit_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "sink_nostart");
        let sink = EncoderSink::create(SinkTarget::Front, &config).unwrap();
        assert!(!sink.submit_video(gray_frame(0.0, 0)));
    }

    #[test]
    fn test_write_and_finalize_produces_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "sink_roundtrip");
        let mut sink = EncoderSink::create(SinkTarget::Front, &config).unwrap();
        let pending = Arc::new(AtomicU64::new(0));
        sink.start(0.0, Arc::clone(&pending)).unwrap();

        for i in 0..30u64 {
            pending.fetch_add(1, Ordering::AcqRel);
            assert!(sink.submit_video(gray_frame(i as f64 / 30.0, i)));
        }
        sink.end_session(2.0);
        let stats = sink.finish_blocking().expect("finalize should succeed");

        assert_eq!(stats.video_frames, 30);
        assert_eq!(pending.load(Ordering::Acquire), 0);
        let bytes = std::fs::read(&stats.path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
    }

    #[test]
    fn test_cutoff_trims_trailing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "sink_cutoff");
        let mut sink = EncoderSink::create(SinkTarget::Back, &config).unwrap();
        let pending = Arc::new(AtomicU64::new(0));
        sink.start(0.0, Arc::clone(&pending)).unwrap();

        // 15 frames over half a second; cutoff trims everything past 0.2s.
        for i in 0..15u64 {
            pending.fetch_add(1, Ordering::AcqRel);
            sink.submit_video(gray_frame(i as f64 / 30.0, i));
        }
        sink.end_session(0.2);
        let stats = sink.finish_blocking().unwrap();

        assert!(stats.last_video_pts.unwrap() <= 0.2);
        assert!(stats.trimmed_samples > 0);
        assert_eq!(stats.video_frames, 7, "frames at 0/30 .. 6/30 survive");
    }

    #[test]
    fn test_encode_failure_degrades_but_keeps_draining() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "sink_fail");
        let mut sink = EncoderSink::create(SinkTarget::Front, &config).unwrap();
        let pending = Arc::new(AtomicU64::new(0));
        sink.start(0.0, Arc::clone(&pending)).unwrap();

        // A frame with a bogus payload size fails the encoder.
        pending.fetch_add(1, Ordering::AcqRel);
        sink.submit_video(Arc::new(VideoFrame::new(vec![0u8; 10], 64, 64, 0.0, 0)));
        for _ in 0..200 {
            if sink.is_failed() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(sink.is_failed());

        // Later samples still drain the queue so a stop barrier would not
        // wedge on this sink.
        pending.fetch_add(1, Ordering::AcqRel);
        sink.submit_video(gray_frame(0.1, 1));
        for _ in 0..200 {
            if pending.load(Ordering::Acquire) == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(pending.load(Ordering::Acquire), 0);

        let err = sink.finish_blocking().unwrap_err();
        assert!(matches!(err, PipelineError::Append { .. }));
    }

    #[test]
    fn test_cancel_removes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "sink_cancel");
        let sink = EncoderSink::create(SinkTarget::Combined, &config).unwrap();
        let path = sink.path().to_path_buf();
        assert!(path.exists());
        sink.cancel();
        assert!(!path.exists());
    }
}
