//! Opus audio encoding for one sink.
//!
//! Each sink owns its encoder, so the three outputs never contend for the
//! same libopus state. PCM accumulates in an internal queue and is emitted
//! as fixed 20ms Opus packets; `flush` zero-pads the final partial frame.

use crate::errors::PipelineError;
use crate::types::AudioChunk;

/// Samples per channel in one Opus frame: 20ms at 48kHz.
const OPUS_FRAME_SAMPLES: usize = 960;

/// OPUS_APPLICATION_AUDIO: rate control tuned for music/mixed content.
const OPUS_APPLICATION_AUDIO: i32 = 2049;

/// Upper bound on a single Opus packet.
const MAX_PACKET_BYTES: usize = 4000;

/// One encoded Opus packet ready for muxing.
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub data: Vec<u8>,
    /// Presentation timestamp of the packet's first sample, in seconds.
    pub pts: f64,
    /// Packet duration in seconds.
    pub duration: f64,
}

/// PCM → Opus encoder.
///
/// The raw libopus encoder is not safe for concurrent use. It is created by
/// the coordinator and moved onto the sink's writer thread, which is its
/// only user from then on; `Sync` is deliberately not implemented.
pub struct OpusAudioEncoder {
    raw: *mut libopus_sys::OpusEncoder,
    sample_rate: u32,
    channels: u16,
    queue: Vec<f32>,
    /// Timestamp of the first queued sample, fixed at first push.
    base_pts: Option<f64>,
    samples_encoded: u64,
}

// SAFETY: the pointer targets libopus state that is valid from any single
// thread; ownership moves to exactly one writer thread and the type is not
// Sync, so concurrent access cannot occur.
unsafe impl Send for OpusAudioEncoder {}

impl OpusAudioEncoder {
    /// `sample_rate` must be 48000 and `channels` 1 or 2 (Opus limits).
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self, PipelineError> {
        if sample_rate != 48000 {
            return Err(PipelineError::Configuration(format!(
                "opus requires 48000 Hz, got {sample_rate}"
            )));
        }
        if channels != 1 && channels != 2 {
            return Err(PipelineError::Configuration(format!(
                "opus supports 1 or 2 channels, got {channels}"
            )));
        }

        let mut status: i32 = 0;
        let raw = unsafe {
            libopus_sys::opus_encoder_create(
                sample_rate as i32,
                channels as i32,
                OPUS_APPLICATION_AUDIO,
                &mut status,
            )
        };
        if raw.is_null() || status != 0 {
            return Err(PipelineError::Encoding(format!(
                "opus_encoder_create failed with status {status}"
            )));
        }

        let status = unsafe {
            libopus_sys::opus_encoder_ctl(
                raw,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                bitrate as i32,
            )
        };
        if status != 0 {
            unsafe { libopus_sys::opus_encoder_destroy(raw) };
            return Err(PipelineError::Encoding(format!(
                "opus bitrate ctl failed with status {status}"
            )));
        }

        Ok(Self {
            raw,
            sample_rate,
            channels,
            queue: Vec::with_capacity(OPUS_FRAME_SAMPLES * channels as usize * 2),
            base_pts: None,
            samples_encoded: 0,
        })
    }

    /// Queues a PCM chunk and returns every complete packet it unlocked.
    pub fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<EncodedAudio>, PipelineError> {
        if chunk.sample_rate != self.sample_rate {
            return Err(PipelineError::Encoding(format!(
                "sample rate changed mid-stream: {} -> {}",
                self.sample_rate, chunk.sample_rate
            )));
        }
        if chunk.channels != self.channels {
            return Err(PipelineError::Encoding(format!(
                "channel count changed mid-stream: {} -> {}",
                self.channels, chunk.channels
            )));
        }

        if self.base_pts.is_none() && !chunk.samples.is_empty() {
            self.base_pts = Some(chunk.pts);
        }
        self.queue.extend_from_slice(&chunk.samples);
        self.drain_complete_frames()
    }

    /// Encodes any buffered remainder, zero-padded to a full frame. Call
    /// once when the session ends.
    pub fn flush(&mut self) -> Result<Vec<EncodedAudio>, PipelineError> {
        if self.queue.is_empty() {
            return Ok(Vec::new());
        }
        let frame_len = OPUS_FRAME_SAMPLES * self.channels as usize;
        let remainder = self.queue.len() % frame_len;
        if remainder != 0 {
            self.queue
                .extend(std::iter::repeat(0.0f32).take(frame_len - remainder));
        }
        self.drain_complete_frames()
    }

    fn drain_complete_frames(&mut self) -> Result<Vec<EncodedAudio>, PipelineError> {
        let frame_len = OPUS_FRAME_SAMPLES * self.channels as usize;
        let frame_secs = OPUS_FRAME_SAMPLES as f64 / self.sample_rate as f64;
        let base = self.base_pts.unwrap_or(0.0);

        let mut packets = Vec::new();
        while self.queue.len() >= frame_len {
            let block: Vec<f32> = self.queue.drain(..frame_len).collect();
            // Packet pts tracks absolute sample position from the first
            // queued sample; wall jitter in chunk arrival does not skew it.
            let pts = base + self.samples_encoded as f64 / self.sample_rate as f64;

            let mut out = vec![0u8; MAX_PACKET_BYTES];
            let written = unsafe {
                libopus_sys::opus_encode_float(
                    self.raw,
                    block.as_ptr(),
                    OPUS_FRAME_SAMPLES as i32,
                    out.as_mut_ptr(),
                    out.len() as i32,
                )
            };
            if written < 0 {
                return Err(PipelineError::Encoding(format!(
                    "opus_encode_float failed with status {written}"
                )));
            }
            out.truncate(written as usize);

            packets.push(EncodedAudio {
                data: out,
                pts,
                duration: frame_secs,
            });
            self.samples_encoded += OPUS_FRAME_SAMPLES as u64;
        }
        Ok(packets)
    }
}

impl Drop for OpusAudioEncoder {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { libopus_sys::opus_encoder_destroy(self.raw) };
        }
    }
}
