//! Core error types

use thiserror::Error;

/// Capture pipeline errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Wayland protocol error: {0}")]
    Protocol(String),

    #[error("no compatible renderer for output '{0}'")]
    NoRenderer(String),

    #[error("submit-frame hook is not armed for output '{0}'")]
    SubmitHookMissing(String),

    #[error("invalid modeline: '{0}'")]
    InvalidModeline(String),

    #[error("output not found: {0}")]
    OutputNotFound(u32),

    #[error("output layout is degenerate (no area to capture)")]
    DegenerateLayout,

    #[error("no free buffer slots, frame dropped")]
    NoFreeBuffers,

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
