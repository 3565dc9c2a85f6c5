//! Frame transformation utilities.

use super::types::Rotation;

const BPP: usize = 3;

/// An RGB24 image owned outside the capture path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Rotate an RGB24 image clockwise.
///
/// Quarter turns swap width and height. `pixels` must hold exactly
/// `width * height * 3` bytes; anything shorter is returned unrotated.
pub fn rotate_rgb(pixels: &[u8], width: u32, height: u32, rotation: Rotation) -> RgbImage {
    let w = width as usize;
    let h = height as usize;
    if rotation == Rotation::None || pixels.len() < w * h * BPP {
        return RgbImage {
            width,
            height,
            data: pixels.to_vec(),
        };
    }

    let mut out = vec![0u8; w * h * BPP];
    let (out_w, out_h) = match rotation {
        Rotation::Cw90 | Rotation::Cw270 => (h, w),
        _ => (w, h),
    };

    for y in 0..h {
        for x in 0..w {
            // Destination of source pixel (x, y)
            let (dx, dy) = match rotation {
                Rotation::Cw90 => (h - 1 - y, x),
                Rotation::Cw180 => (w - 1 - x, h - 1 - y),
                Rotation::Cw270 => (y, w - 1 - x),
                Rotation::None => (x, y),
            };
            let src = (y * w + x) * BPP;
            let dst = (dy * out_w + dx) * BPP;
            out[dst..dst + BPP].copy_from_slice(&pixels[src..src + BPP]);
        }
    }

    RgbImage {
        width: out_w as u32,
        height: out_h as u32,
        data: out,
    }
}
