//! Stitching captured outputs into one image.
//!
//! Each capture arrives with its own stride; rows are copied one at a
//! time into a tightly packed destination at the output's layout offset
//! relative to the bounding box origin.

use super::layout::{BufferSize, OutputRect};

/// Pixels of one captured output, XRGB8888 little-endian.
pub struct CapturedOutput {
    pub rect: OutputRect,
    pub stride: u32,
    pub pixels: Vec<u8>,
}

/// Compose the captures into one XRGB image, stride `size.width * 4`.
/// Gaps the layout leaves uncovered stay black.
pub fn stitch(captures: &[CapturedOutput], size: &BufferSize) -> Vec<u8> {
    let dst_stride = size.width as usize * 4;
    let mut dst = vec![0u8; dst_stride * size.height as usize];

    for capture in captures {
        let dst_x = (capture.rect.offset_x - size.min_x) as usize;
        let dst_y = (capture.rect.offset_y - size.min_y) as usize;
        let src_stride = capture.stride as usize;
        let row_bytes = capture.rect.width as usize * 4;

        for row in 0..capture.rect.height as usize {
            let src_start = row * src_stride;
            let dst_start = (dst_y + row) * dst_stride + dst_x * 4;
            let Some(src) = capture.pixels.get(src_start..src_start + row_bytes) else {
                break;
            };
            let Some(out) = dst.get_mut(dst_start..dst_start + row_bytes) else {
                break;
            };
            out.copy_from_slice(src);
        }
    }
    dst
}

/// Convert little-endian XRGB8888 to the RGBA byte order PNG encoders
/// expect, forcing the ignored X channel to opaque.
pub fn xrgb_to_rgba(xrgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(xrgb.len());
    for px in xrgb.chunks_exact(4) {
        // LE XRGB: bytes are B, G, R, X.
        rgba.extend_from_slice(&[px[2], px[1], px[0], 0xFF]);
    }
    rgba
}

// ============================================================================
// Tests
// ============================================================================
