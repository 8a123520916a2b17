//! Core sample and stream types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// Identifies one of the three hardware producers feeding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    /// Front-facing camera (stream A).
    Front,
    /// Back-facing camera (stream B).
    Back,
    /// Microphone.
    Audio,
}

impl StreamId {
    /// Stable index used for per-stream bookkeeping tables.
    pub fn index(&self) -> usize {
        match self {
            StreamId::Front => 0,
            StreamId::Back => 1,
            StreamId::Audio => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamId::Front => "front",
            StreamId::Back => "back",
            StreamId::Audio => "audio",
        }
    }

    /// The single-stream sink a video stream feeds, if any.
    pub fn sink_target(&self) -> Option<SinkTarget> {
        match self {
            StreamId::Front => Some(SinkTarget::Front),
            StreamId::Back => Some(SinkTarget::Back),
            StreamId::Audio => None,
        }
    }
}

/// One of the three independent encoder outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SinkTarget {
    /// Front camera only.
    Front,
    /// Back camera only.
    Back,
    /// Both cameras composited onto one canvas.
    Combined,
}

impl SinkTarget {
    pub const ALL: [SinkTarget; 3] = [SinkTarget::Front, SinkTarget::Back, SinkTarget::Combined];

    pub fn index(&self) -> usize {
        match self {
            SinkTarget::Front => 0,
            SinkTarget::Back => 1,
            SinkTarget::Combined => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkTarget::Front => "front",
            SinkTarget::Back => "back",
            SinkTarget::Combined => "combined",
        }
    }
}

impl std::fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uncompressed RGB24 video frame handed in by a camera callback.
///
/// Ownership transfers to the router on arrival; the frame is consumed by
/// exactly one encoder submission (the compositor keeps its own short-lived
/// copy for pairing).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Packed RGB24 pixels, `width * height * 3` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in seconds on the shared session timebase.
    pub pts: f64,
    /// Monotonic per-producer counter.
    pub sequence: u64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, pts: f64, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            pts,
            sequence,
        }
    }

    /// Expected byte length of an RGB24 frame with the given dimensions.
    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 3
    }
}

/// A chunk of interleaved f32 PCM handed in by the audio callback.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Presentation timestamp of the first sample, in seconds.
    pub pts: f64,
    /// Monotonic per-producer counter.
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, pts: f64, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            pts,
            sequence,
        }
    }

    /// Duration covered by this chunk, in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let frames = self.samples.len() / self.channels as usize;
        frames as f64 / self.sample_rate as f64
    }
}
