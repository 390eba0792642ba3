//! Output and head model.
//!
//! An output is one independently-presentable display surface; virtual
//! outputs have no physical display behind them and exist only to be
//! captured. Each output carries exactly one head with the monitor and
//! connector strings clients see in wl_output.geometry.

use crate::core::errors::{CoreError, Result};

/// Default refresh when a modeline omits one, in millihertz.
pub const DEFAULT_REFRESH_MHZ: u32 = 60_000;

/// One display mode. Refresh is in millihertz, matching wl_output.mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

impl Mode {
    /// Length of one presentation period, for the finish-frame timer.
    pub fn frame_interval(&self) -> std::time::Duration {
        let msec = (1_000_000u64 / self.refresh.max(1) as u64).max(1);
        std::time::Duration::from_millis(msec)
    }
}

/// Parse a `"<width>x<height>[@<refresh>]"` modeline.
///
/// Refresh defaults to 60 Hz; the stored value is millihertz.
pub fn parse_modeline(modeline: &str) -> Result<Mode> {
    let reject = || CoreError::InvalidModeline(modeline.to_string());

    let (size, refresh) = match modeline.split_once('@') {
        Some((size, refresh)) => (size, Some(refresh)),
        None => (modeline, None),
    };
    let (width, height) = size.split_once('x').ok_or_else(reject)?;
    let width: u32 = width.trim().parse().map_err(|_| reject())?;
    let height: u32 = height.trim().parse().map_err(|_| reject())?;
    if width == 0 || height == 0 {
        return Err(reject());
    }
    let refresh = match refresh {
        Some(r) => r.trim().parse::<u32>().map_err(|_| reject())?.max(1) * 1000,
        None => DEFAULT_REFRESH_MHZ,
    };

    Ok(Mode {
        width,
        height,
        refresh,
    })
}

// ============================================================================
// Head
// ============================================================================

/// Logical monitor attached to an output.
#[derive(Debug, Clone)]
pub struct Head {
    pub connector_name: String,
    pub make: String,
    pub model: String,
    pub serial_number: String,
    /// Physical size in millimetres; virtual heads report their pixel
    /// dimensions here, as there is no panel to measure.
    pub physical_width: u32,
    pub physical_height: u32,
}

impl Head {
    pub fn virtual_head() -> Self {
        Self {
            connector_name: "virtual".to_string(),
            make: "Tioga".to_string(),
            model: "Virtual Display".to_string(),
            serial_number: "unknown".to_string(),
            physical_width: 0,
            physical_height: 0,
        }
    }
}

// ============================================================================
// OutputState
// ============================================================================

/// Geometry and lifecycle state of one output.
#[derive(Debug, Clone)]
pub struct OutputState {
    pub id: u32,
    pub name: String,
    /// Screen-space offset.
    pub x: i32,
    pub y: i32,
    pub current_mode: Mode,
    /// All modes ever set; torn down with the output.
    pub modes: Vec<Mode>,
    pub scale: u32,
    pub enabled: bool,
}

impl OutputState {
    pub fn new(id: u32, name: impl Into<String>, mode: Mode) -> Self {
        Self {
            id,
            name: name.into(),
            x: 0,
            y: 0,
            current_mode: mode,
            modes: vec![mode],
            scale: 1,
            enabled: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.current_mode.width
    }

    pub fn height(&self) -> u32 {
        self.current_mode.height
    }
}

// ============================================================================
// Tests
// ============================================================================
