//! Common imports and types used throughout Tioga.

pub use std::collections::HashMap;
pub use std::rc::Rc;

pub type Result<T> = std::result::Result<T, crate::core::errors::CoreError>;
