//! Headless virtual-output snapshot capture for Wayland.
//!
//! The compositor side (`core/`) renders virtual outputs into refcounted
//! framebuffers, waits on GPU fences and copies completed frames into
//! client-supplied shm buffers; the client side (`client/`) lays outputs
//! out, captures them one by one and stitches the result into a PNG.

pub mod client;
pub mod config;
pub mod core;
pub mod prelude;

pub use crate::core::compositor::{Compositor, TiogaClientData};
pub use crate::core::errors::CoreError;
pub use crate::core::state::ServerState;
