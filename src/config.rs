//! Session configuration for a dual-camera recording.
//!
//! A `SessionConfig` arrives fully formed from the capture-setup layer; the
//! pipeline never persists or reloads it. All three outputs share one codec
//! configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::types::SinkTarget;

/// Quality presets shared by all three outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingQuality {
    /// 720p at 30fps, lower bitrate.
    Low,
    /// 1080p at 30fps, standard bitrate.
    Medium,
    /// 1080p at 60fps, high bitrate.
    High,
    /// Explicit settings.
    Custom,
}

impl RecordingQuality {
    /// Recommended bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        match self {
            RecordingQuality::Low => 2_500_000,
            RecordingQuality::Medium => 5_000_000,
            RecordingQuality::High => 10_000_000,
            RecordingQuality::Custom => 5_000_000,
        }
    }

    /// Recommended resolution (width, height).
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            RecordingQuality::Low => (1280, 720),
            RecordingQuality::Medium => (1920, 1080),
            RecordingQuality::High => (1920, 1080),
            RecordingQuality::Custom => (1920, 1080),
        }
    }

    /// Recommended frame rate.
    pub fn fps(&self) -> f64 {
        match self {
            RecordingQuality::High => 60.0,
            _ => 30.0,
        }
    }
}

impl Default for RecordingQuality {
    fn default() -> Self {
        RecordingQuality::Medium
    }
}

/// Where the three container files land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub front: PathBuf,
    pub back: PathBuf,
    pub combined: PathBuf,
}

impl OutputPaths {
    pub fn new(
        front: impl Into<PathBuf>,
        back: impl Into<PathBuf>,
        combined: impl Into<PathBuf>,
    ) -> Self {
        Self {
            front: front.into(),
            back: back.into(),
            combined: combined.into(),
        }
    }

    /// Builds the conventional `<stem>_front.mp4` / `_back` / `_combined`
    /// triple inside one directory.
    pub fn in_dir(dir: impl AsRef<Path>, stem: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            front: dir.join(format!("{stem}_front.mp4")),
            back: dir.join(format!("{stem}_back.mp4")),
            combined: dir.join(format!("{stem}_combined.mp4")),
        }
    }

    pub fn for_target(&self, target: SinkTarget) -> &PathBuf {
        match target {
            SinkTarget::Front => &self.front,
            SinkTarget::Back => &self.back,
            SinkTarget::Combined => &self.combined,
        }
    }
}

/// Rotation applied to every frame before encoding.
///
/// Quarter turns swap the encoded dimensions; the configured width/height
/// always describe the sensor-delivered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Encoded output dimensions for a source of the given size.
    pub fn apply_dims(&self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Orientation::Identity | Orientation::Rotate180 => (width, height),
            Orientation::Rotate90 | Orientation::Rotate270 => (height, width),
        }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Orientation::Identity
    }
}

/// How the two camera streams are placed on the combined canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeLayout {
    /// Front on the top half, back on the bottom half.
    VerticalStack,
    /// Back fills the canvas, front is inset top-right.
    PictureInPicture,
}

impl Default for CompositeLayout {
    fn default() -> Self {
        CompositeLayout::VerticalStack
    }
}

/// Audio track parameters shared by all three outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// Sample rate in Hz. Opus requires 48000.
    pub sample_rate: u32,
    /// 1 for mono, 2 for stereo.
    pub channels: u16,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bitrate: 128_000,
        }
    }
}

/// Full configuration for one recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub outputs: OutputPaths,
    /// Width of each camera frame in pixels.
    pub width: u32,
    /// Height of each camera frame in pixels.
    pub height: u32,
    /// Target video bitrate in bits per second.
    pub bitrate: u32,
    /// Frames per second each camera is expected to deliver.
    pub fps: f64,
    pub orientation: Orientation,
    pub layout: CompositeLayout,
    pub audio: AudioParams,
    pub quality: RecordingQuality,
    /// moov-before-mdat for instant playback.
    pub fast_start: bool,
    /// Optional title stamped into container metadata.
    pub title: Option<String>,
}

impl SessionConfig {
    pub fn new(outputs: OutputPaths, width: u32, height: u32, fps: f64) -> Self {
        Self {
            outputs,
            width,
            height,
            bitrate: RecordingQuality::Custom.bitrate(),
            fps,
            orientation: Orientation::default(),
            layout: CompositeLayout::default(),
            audio: AudioParams::default(),
            quality: RecordingQuality::Custom,
            fast_start: true,
            title: None,
        }
    }

    pub fn from_quality(outputs: OutputPaths, quality: RecordingQuality) -> Self {
        let (width, height) = quality.resolution();
        Self {
            outputs,
            width,
            height,
            bitrate: quality.bitrate(),
            fps: quality.fps(),
            orientation: Orientation::default(),
            layout: CompositeLayout::default(),
            audio: AudioParams::default(),
            quality,
            fast_start: true,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_layout(mut self, layout: CompositeLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_audio(mut self, audio: AudioParams) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_fast_start(mut self, enabled: bool) -> Self {
        self.fast_start = enabled;
        self
    }

    /// Minimum accepted spacing between two frames of one video stream.
    ///
    /// 10% under the nominal interval so ordinary delivery jitter is not
    /// punished as a burst.
    pub fn min_frame_interval(&self) -> f64 {
        0.9 / self.fps
    }

    /// Validates paths and codec parameters.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::Configuration(format!(
                "invalid dimensions {}x{}",
                self.width, self.height
            )));
        }
        // YUV 4:2:0 subsampling needs even dimensions.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(PipelineError::Configuration(format!(
                "dimensions {}x{} must be even for 4:2:0 encoding",
                self.width, self.height
            )));
        }
        if !(self.fps > 0.0) || !self.fps.is_finite() {
            return Err(PipelineError::Configuration(format!(
                "invalid frame rate {}",
                self.fps
            )));
        }
        if self.bitrate == 0 {
            return Err(PipelineError::Configuration("zero video bitrate".into()));
        }
        if self.audio.sample_rate != 48000 {
            return Err(PipelineError::Configuration(format!(
                "opus requires 48000 Hz, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.channels != 1 && self.audio.channels != 2 {
            return Err(PipelineError::Configuration(format!(
                "unsupported channel count {}",
                self.audio.channels
            )));
        }

        let paths = [
            self.outputs.for_target(SinkTarget::Front),
            self.outputs.for_target(SinkTarget::Back),
            self.outputs.for_target(SinkTarget::Combined),
        ];
        for (i, a) in paths.iter().enumerate() {
            for b in paths.iter().skip(i + 1) {
                if a == b {
                    return Err(PipelineError::Configuration(format!(
                        "output paths must be distinct, '{}' repeats",
                        a.display()
                    )));
                }
            }
        }
        for path in paths {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(PipelineError::Configuration(format!(
                    "output directory '{}' does not exist",
                    parent.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(dir: &Path) -> SessionConfig {
        SessionConfig::new(OutputPaths::in_dir(dir, "rec"), 640, 480, 30.0)
    }

    #[test]
    fn test_quality_presets() {
        assert_eq!(RecordingQuality::Low.resolution(), (1280, 720));
        assert_eq!(RecordingQuality::High.fps(), 60.0);
        assert!(RecordingQuality::High.bitrate() > RecordingQuality::Low.bitrate());
    }

    #[test]
    fn test_min_frame_interval_has_tolerance() {
        let config = valid_config(Path::new("."));
        assert!((config.min_frame_interval() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        let dir = std::env::temp_dir();
        assert!(valid_config(&dir).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_dimensions() {
        let dir = std::env::temp_dir();
        let mut config = valid_config(&dir);
        config.width = 641;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_paths() {
        let dir = std::env::temp_dir();
        let mut config = valid_config(&dir);
        config.outputs.back = config.outputs.front.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_directory() {
        let config = valid_config(Path::new("/definitely/not/a/real/dir"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_opus_rate() {
        let dir = std::env::temp_dir();
        let mut config = valid_config(&dir);
        config.audio.sample_rate = 44100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_orientation_dims_swap_on_quarter_turns() {
        assert_eq!(Orientation::Rotate90.apply_dims(640, 480), (480, 640));
        assert_eq!(Orientation::Rotate180.apply_dims(640, 480), (640, 480));
    }
}
