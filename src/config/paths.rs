//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("SANDPREVIEW_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|d| d.join("sandpreview"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("sandpreview"))
                .unwrap_or_else(|| PathBuf::from(".sandpreview"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("SANDPREVIEW_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_json_in_config_dir() {
        if std::env::var("SANDPREVIEW_CONFIG").is_err() {
            assert!(config_path().starts_with(config_dir()));
            assert!(config_path().ends_with("config.json"));
        }
    }
}
