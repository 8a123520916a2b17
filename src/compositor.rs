//! Combines the two camera streams onto one output canvas.
//!
//! The compositor keeps the last buffer seen per stream so ordinary
//! delivery jitter between the cameras does not starve the combined
//! output. The cache is epoch-tagged and cleared on every session
//! transition, and a pairing-skew bound keeps it from ever standing in
//! for a stream that stopped delivering: the combined file must never
//! end on a repeated frame.
//!
//! The back stream drives composition: every accepted back frame is
//! paired with the freshest front frame and produces at most one
//! composite.

use std::sync::{Arc, Mutex};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};

use crate::config::{CompositeLayout, SessionConfig};
use crate::types::{StreamId, VideoFrame};

/// How stale a cached counterpart may be, in frame intervals.
const MAX_PAIR_SKEW_FRAMES: f64 = 1.5;

/// Picture-in-picture inset is this fraction of the canvas edge.
const PIP_DIVISOR: u32 = 3;

/// Margin between the inset and the canvas border, in pixels.
const PIP_MARGIN: u32 = 16;

/// Canvas geometry and pairing parameters for one session.
#[derive(Debug, Clone, Copy)]
pub struct CompositorConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub layout: CompositeLayout,
    pub fps: f64,
}

impl CompositorConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            canvas_width: config.width,
            canvas_height: config.height,
            layout: config.layout,
            fps: config.fps,
        }
    }

    fn max_pair_skew(&self) -> f64 {
        MAX_PAIR_SKEW_FRAMES / self.fps
    }
}

struct CachedEntry {
    frame: Arc<VideoFrame>,
    epoch: u64,
}

struct State {
    slots: [Option<CachedEntry>; 2],
    config: Option<CompositorConfig>,
    /// Shutdown mode: armed between sessions and from `reset()` until the
    /// next `begin_recording()`. While armed, only buffers cached in the
    /// current epoch may pair.
    armed: bool,
    epoch: u64,
    sequence: u64,
}

/// Thread-safe compositor shared by both video ingestion paths.
pub struct FrameCompositor {
    state: Mutex<State>,
}

impl FrameCompositor {
    /// Starts armed with an empty cache; `begin_recording` enables it.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slots: [None, None],
                config: None,
                armed: true,
                epoch: 0,
                sequence: 0,
            }),
        }
    }

    /// Clears the cache and disarms shutdown mode for a new session. No
    /// buffer from a previous recording can bleed into this one.
    pub fn begin_recording(&self, config: CompositorConfig) {
        let mut state = self.lock();
        state.slots = [None, None];
        state.config = Some(config);
        state.armed = false;
        state.epoch += 1;
        state.sequence = 0;
        log::debug!(
            "compositor ready: {}x{} {:?} @ {:.1} fps",
            config.canvas_width,
            config.canvas_height,
            config.layout,
            config.fps
        );
    }

    /// Clears the cache and arms shutdown mode. Until the next
    /// `begin_recording`, no composite may be synthesized from a buffer
    /// cached before this call.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.slots = [None, None];
        state.armed = true;
        state.epoch += 1;
        log::debug!("compositor reset, shutdown mode armed");
    }

    /// Barrier against in-flight cache mutation before teardown proceeds.
    ///
    /// Rendering itself happens outside the lock; a composite finished
    /// after this point is rejected by the coordinator's state check, so
    /// synchronizing on the cache is sufficient.
    pub fn flush(&self) {
        drop(self.lock());
    }

    /// Offers a frame for composition.
    ///
    /// Front frames only refresh the cache. A back frame pairs with the
    /// freshest front frame and yields one composite, unless the pairing
    /// skew exceeds the jitter bound, in which case the combined frame is dropped
    /// rather than built from a stale buffer.
    pub fn compose(&self, stream: StreamId, frame: &Arc<VideoFrame>) -> Option<VideoFrame> {
        let slot = match stream {
            StreamId::Front => 0,
            StreamId::Back => 1,
            StreamId::Audio => return None,
        };

        let (config, counterpart, sequence) = {
            let mut state = self.lock();
            let config = state.config?;
            let epoch = state.epoch;
            state.slots[slot] = Some(CachedEntry {
                frame: Arc::clone(frame),
                epoch,
            });

            if stream != StreamId::Back {
                return None;
            }

            let counterpart = match &state.slots[0] {
                Some(entry) => {
                    if state.armed && entry.epoch != epoch {
                        return None;
                    }
                    if (frame.pts - entry.frame.pts).abs() > config.max_pair_skew() {
                        log::trace!(
                            "dropping composite at pts {:.3}: front counterpart is {:.3}s away",
                            frame.pts,
                            (frame.pts - entry.frame.pts).abs()
                        );
                        return None;
                    }
                    Arc::clone(&entry.frame)
                }
                None => return None,
            };

            state.sequence += 1;
            (config, counterpart, state.sequence)
        };

        render(&config, &counterpart, frame, sequence)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FrameCompositor {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the combined frame. Runs outside the cache lock.
fn render(
    config: &CompositorConfig,
    front: &VideoFrame,
    back: &VideoFrame,
    sequence: u64,
) -> Option<VideoFrame> {
    let width = config.canvas_width;
    let height = config.canvas_height;
    let mut canvas = RgbImage::new(width, height);

    match config.layout {
        CompositeLayout::VerticalStack => {
            let half = height / 2;
            let top = scale_fill(front, width, half)?;
            let bottom = scale_fill(back, width, height - half)?;
            imageops::replace(&mut canvas, &top, 0, 0);
            imageops::replace(&mut canvas, &bottom, 0, half as i64);
        }
        CompositeLayout::PictureInPicture => {
            let base = scale_fill(back, width, height)?;
            imageops::replace(&mut canvas, &base, 0, 0);

            let inset_w = (width / PIP_DIVISOR).max(2);
            let inset_h = (height / PIP_DIVISOR).max(2);
            let inset = scale_fill(front, inset_w, inset_h)?;
            let x = width.saturating_sub(inset_w + PIP_MARGIN);
            imageops::replace(&mut canvas, &inset, x as i64, PIP_MARGIN.min(height) as i64);
        }
    }

    Some(VideoFrame::new(
        canvas.into_raw(),
        width,
        height,
        back.pts,
        sequence,
    ))
}

/// Aspect-fill: center-crops the source to the destination aspect ratio,
/// then scales.
fn scale_fill(frame: &VideoFrame, dst_w: u32, dst_h: u32) -> Option<RgbImage> {
    if dst_w == 0 || dst_h == 0 {
        return None;
    }
    let src: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_slice())?;

    let src_aspect = frame.width as f64 / frame.height as f64;
    let dst_aspect = dst_w as f64 / dst_h as f64;
    let (crop_w, crop_h) = if src_aspect > dst_aspect {
        ((frame.height as f64 * dst_aspect).round() as u32, frame.height)
    } else {
        (frame.width, (frame.width as f64 / dst_aspect).round() as u32)
    };
    let crop_w = crop_w.clamp(1, frame.width);
    let crop_h = crop_h.clamp(1, frame.height);
    let x = (frame.width - crop_w) / 2;
    let y = (frame.height - crop_h) / 2;

    let cropped = imageops::crop_imm(&src, x, y, crop_w, crop_h);
    Some(imageops::resize(&*cropped, dst_w, dst_h, FilterType::Triangle))
}
