//! Process configuration, read from the environment.
//!
//! Server:
//! - `TIOGA_SOCKET`  - socket name, default "tioga-0"
//! - `TIOGA_OUTPUTS` - comma-separated `name:WxH[@refresh]` entries,
//!   default two side-by-side 1280x720 outputs
//!
//! Snapshot client:
//! - `WAYLAND_DISPLAY`  - socket to connect to
//! - `TIOGA_OUTPUT_DIR` - where PNG snapshots land, default the current
//!   directory

use crate::core::errors::{CoreError, Result};

pub const DEFAULT_SOCKET: &str = "tioga-0";
pub const DEFAULT_OUTPUTS: &str = "virt-0:1280x720,virt-1:1280x720";

/// One `name:modeline` entry from `TIOGA_OUTPUTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub name: String,
    pub modeline: String,
}

/// Configuration for the compositor
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_name: String,
    pub outputs: Vec<OutputConfig>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let socket_name =
            std::env::var("TIOGA_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET.to_string());
        let entries =
            std::env::var("TIOGA_OUTPUTS").unwrap_or_else(|_| DEFAULT_OUTPUTS.to_string());
        Ok(Self {
            socket_name,
            outputs: parse_outputs(&entries)?,
        })
    }
}

fn parse_outputs(entries: &str) -> Result<Vec<OutputConfig>> {
    let mut outputs = Vec::new();
    for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, modeline) = entry
            .split_once(':')
            .ok_or_else(|| CoreError::protocol(format!("malformed output entry '{entry}'")))?;
        // Validate the modeline now so the failure names the entry.
        crate::core::output::parse_modeline(modeline)?;
        outputs.push(OutputConfig {
            name: name.trim().to_string(),
            modeline: modeline.trim().to_string(),
        });
    }
    if outputs.is_empty() {
        return Err(CoreError::protocol("no outputs configured"));
    }
    Ok(outputs)
}

/// Configuration for the snapshot client
#[derive(Debug, Clone)]
pub struct SnapConfig {
    pub output_dir: std::path::PathBuf,
}

impl SnapConfig {
    pub fn from_env() -> Self {
        let output_dir = std::env::var("TIOGA_OUTPUT_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("."));
        Self { output_dir }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outputs_multiple_entries() {
        let outputs = parse_outputs("a:800x600, b:1024x768@30").unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].name, "a");
        assert_eq!(outputs[0].modeline, "800x600");
        assert_eq!(outputs[1].name, "b");
        assert_eq!(outputs[1].modeline, "1024x768@30");
    }

    #[test]
    fn test_parse_outputs_rejects_bad_entries() {
        assert!(parse_outputs("").is_err());
        assert!(parse_outputs("no-modeline").is_err());
        assert!(parse_outputs("a:0x0").is_err());
        assert!(parse_outputs("a:800x600@fast").is_err());
    }
}
