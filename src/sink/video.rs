//! H.264 video encoding for one sink.
//!
//! Wraps openh264 and handles the RGB24 → YUV 4:2:0 conversion plus the
//! configured orientation transform. Dimensions are fixed at construction;
//! frames that do not match are rejected rather than silently rescaled.

use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::config::Orientation;
use crate::errors::PipelineError;

/// One encoded H.264 access unit in Annex B format.
#[derive(Debug, Clone)]
pub struct EncodedVideo {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

pub struct VideoEncoder {
    encoder: Encoder,
    /// Source frame dimensions, before orientation.
    source_width: u32,
    source_height: u32,
    /// Encoded dimensions, after orientation.
    out_width: u32,
    out_height: u32,
    orientation: Orientation,
    frames_in: u64,
}

impl VideoEncoder {
    /// The fps and bitrate act as rate-control hints; openh264 derives the
    /// actual dimensions from each submitted YUV buffer.
    pub fn new(
        width: u32,
        height: u32,
        _fps: f64,
        _bitrate: u32,
        orientation: Orientation,
    ) -> Result<Self, PipelineError> {
        let encoder = Encoder::new()
            .map_err(|e| PipelineError::Encoding(format!("failed to create encoder: {e}")))?;
        let (out_width, out_height) = orientation.apply_dims(width, height);
        Ok(Self {
            encoder,
            source_width: width,
            source_height: height,
            out_width,
            out_height,
            orientation,
            frames_in: 0,
        })
    }

    /// Encoded output dimensions (orientation applied).
    pub fn output_dims(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    /// Encodes one RGB24 frame.
    ///
    /// Returns `None` when the encoder produced no bitstream for this
    /// frame; the caller skips it rather than muxing an empty sample.
    pub fn encode(&mut self, rgb: &[u8]) -> Result<Option<EncodedVideo>, PipelineError> {
        let expected = (self.source_width as usize) * (self.source_height as usize) * 3;
        if rgb.len() != expected {
            return Err(PipelineError::Encoding(format!(
                "frame is {} bytes, expected {} for {}x{}",
                rgb.len(),
                expected,
                self.source_width,
                self.source_height
            )));
        }

        let oriented;
        let pixels: &[u8] = match self.orientation {
            Orientation::Identity => rgb,
            _ => {
                oriented = rotate_rgb(rgb, self.source_width, self.source_height, self.orientation);
                oriented.as_slice()
            }
        };

        let yuv = rgb_to_yuv420(pixels, self.out_width, self.out_height);
        let buffer = YUVBuffer::from_vec(yuv, self.out_width as usize, self.out_height as usize);

        let bitstream = self
            .encoder
            .encode(&buffer)
            .map_err(|e| PipelineError::Encoding(format!("encode failed: {e}")))?;
        self.frames_in += 1;

        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(EncodedVideo { data, keyframe }))
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }
}

/// Rotates a packed RGB24 buffer by the given quarter turn.
fn rotate_rgb(rgb: &[u8], width: u32, height: u32, orientation: Orientation) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut out = vec![0u8; rgb.len()];

    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            // Destination coordinates in the rotated frame.
            let dst = match orientation {
                Orientation::Identity => src,
                Orientation::Rotate90 => ((x * h) + (h - 1 - y)) * 3,
                Orientation::Rotate180 => (((h - 1 - y) * w) + (w - 1 - x)) * 3,
                Orientation::Rotate270 => (((w - 1 - x) * h) + y) * 3,
            };
            out[dst..dst + 3].copy_from_slice(&rgb[src..src + 3]);
        }
    }
    out
}

/// Converts packed RGB24 to planar YUV 4:2:0 using BT.601 coefficients.
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let luma_len = w * h;
    let chroma_len = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; luma_len + 2 * chroma_len];

    let (y_plane, chroma) = yuv.split_at_mut(luma_len);
    let (u_plane, v_plane) = chroma.split_at_mut(chroma_len);

    for (row, line) in rgb.chunks_exact(w * 3).enumerate() {
        for (col, px) in line.chunks_exact(3).enumerate() {
            let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);

            let luma = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * w + col] = luma.clamp(0, 255) as u8;

            // Chroma is subsampled 2x2; sample the top-left of each block.
            if row % 2 == 0 && col % 2 == 0 {
                let idx = (row / 2) * (w / 2) + (col / 2);
                let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[idx] = u.clamp(0, 255) as u8;
                v_plane[idx] = v.clamp(0, 255) as u8;
            }
        }
    }
    yuv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv420_output_length() {
        let rgb = vec![127u8; 320 * 240 * 3];
        let yuv = rgb_to_yuv420(&rgb, 320, 240);
        assert_eq!(yuv.len(), 320 * 240 * 3 / 2);
    }

    #[test]
    fn test_rotate90_moves_top_left() {
        // 2x2 frame: pixels numbered 1..4 by red channel.
        #[rustfmt::skip]
        let rgb = vec![
            1, 0, 0,  2, 0, 0,
            3, 0, 0,  4, 0, 0,
        ];
        let rotated = rotate_rgb(&rgb, 2, 2, Orientation::Rotate90);
        // Clockwise: top row becomes right column.
        assert_eq!(rotated[0], 3);
        assert_eq!(rotated[3], 1);
        assert_eq!(rotated[6], 4);
        assert_eq!(rotated[9], 2);
    }

    #[test]
    fn test_rotate180_reverses() {
        #[rustfmt::skip]
        let rgb = vec![
            1, 0, 0,  2, 0, 0,
            3, 0, 0,  4, 0, 0,
        ];
        let rotated = rotate_rgb(&rgb, 2, 2, Orientation::Rotate180);
        assert_eq!(rotated[0], 4);
        assert_eq!(rotated[9], 1);
    }

    #[test]
    fn test_encoder_creation() {
        assert!(VideoEncoder::new(320, 240, 30.0, 1_000_000, Orientation::Identity).is_ok());
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut encoder =
            VideoEncoder::new(320, 240, 30.0, 1_000_000, Orientation::Identity).unwrap();
        let rgb = vec![90u8; 320 * 240 * 3];
        let encoded = encoder
            .encode(&rgb)
            .expect("encode should succeed")
            .expect("first frame should produce bitstream");
        assert!(encoded.keyframe);
        assert!(
            encoded.data.starts_with(&[0, 0, 0, 1]) || encoded.data.starts_with(&[0, 0, 1]),
            "expected Annex B start code"
        );
    }

    #[test]
    fn test_wrong_frame_size_is_rejected() {
        let mut encoder =
            VideoEncoder::new(320, 240, 30.0, 1_000_000, Orientation::Identity).unwrap();
        assert!(encoder.encode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_quarter_turn_swaps_encode_dims() {
        let encoder =
            VideoEncoder::new(320, 240, 30.0, 1_000_000, Orientation::Rotate270).unwrap();
        assert_eq!(encoder.output_dims(), (240, 320));
    }
}
