//! Client-side output layout.
//!
//! The compositor's advertised x offsets are ignored; the client lays
//! outputs out side by side itself, walking its output list in reverse
//! announcement order, so the last-announced output sits at x 0.
//! Advertised y offsets are kept as-is.

use crate::core::errors::{CoreError, Result};

/// One output's place in the stitched image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputRect {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
}

/// Assign x offsets in reverse announcement order.
pub fn assign_offsets(outputs: &mut [OutputRect]) {
    let mut x = 0i32;
    for rect in outputs.iter_mut().rev() {
        rect.offset_x = x;
        x += rect.width as i32;
    }
}

/// Bounding box of every output rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub min_x: i32,
    pub min_y: i32,
    pub width: u32,
    pub height: u32,
}

/// Compute the stitched image's extent. A layout with no area aborts the
/// snapshot rather than producing an empty file.
pub fn compute_buffer_size(outputs: &[OutputRect]) -> Result<BufferSize> {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for rect in outputs {
        min_x = min_x.min(rect.offset_x);
        min_y = min_y.min(rect.offset_y);
        max_x = max_x.max(rect.offset_x + rect.width as i32);
        max_y = max_y.max(rect.offset_y + rect.height as i32);
    }
    if outputs.is_empty() || max_x <= min_x || max_y <= min_y {
        return Err(CoreError::DegenerateLayout);
    }
    Ok(BufferSize {
        min_x,
        min_y,
        width: (max_x - min_x) as u32,
        height: (max_y - min_y) as u32,
    })
}

// ============================================================================
// Tests
// ============================================================================
