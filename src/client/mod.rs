//! Snapshot client: layout, capture and stitching.

pub mod layout;
pub mod snapshot;
pub mod stitch;
