//! Supervisor configuration

use procsup_core::{ProcessError, Result};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
#[cfg(windows)]
const DEFAULT_PATH: &str = r"C:\Windows\system32;C:\Windows";

/// Tunables of a [`crate::Supervisor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Upper bound of one non-blocking read from a child channel
    pub read_chunk_size: usize,
    /// Search path used when a request carries no `PATH` of its own
    pub default_path: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 8192,
            default_path: DEFAULT_PATH.to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SupervisorConfig = serde_json::from_str(text)
            .map_err(|e| ProcessError::InvalidRequest(format!("supervisor config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(ProcessError::InvalidRequest(
                "read_chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.read_chunk_size, 8192);
        assert!(!config.default_path.is_empty());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SupervisorConfig::from_json(r#"{"read_chunk_size": 512}"#).unwrap();
        assert_eq!(config.read_chunk_size, 512);
        assert_eq!(config.default_path, SupervisorConfig::default().default_path);
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let err = SupervisorConfig::from_json(r#"{"read_chunk_size": 0}"#).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(SupervisorConfig::from_json("{").is_err());
    }
}
