//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    // Apply environment variable overrides (highest precedence)
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        // JSON5 accepts comments and trailing commas
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` if present, then overlays any `SANDPREVIEW_*` variables.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Overlay values from `lookup` onto `config`. Unparseable values are
/// logged and skipped.
pub(crate) fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Runtime overrides
    if let Some(backend) = lookup("SANDPREVIEW_BACKEND") {
        match backend.parse() {
            Ok(backend) => config.runtime.backend = backend,
            Err(e) => warn!("Ignoring SANDPREVIEW_BACKEND: {}", e),
        }
    }
    if let Some(root) = lookup("SANDPREVIEW_WORKSPACE") {
        config.runtime.workspace_root = Some(PathBuf::from(root));
    }
    if let Some(image) = lookup("SANDPREVIEW_IMAGE") {
        config.runtime.container.image = image;
    }
    if let Some(network) = lookup("SANDPREVIEW_NETWORK") {
        config.runtime.container.network = network;
    }

    // Pipeline overrides
    if let Some(command) = lookup("SANDPREVIEW_INSTALL_COMMAND") {
        config.pipeline.install_command = split_command(&command);
    }
    if let Some(command) = lookup("SANDPREVIEW_START_COMMAND") {
        config.pipeline.start_command = split_command(&command);
    }
    if let Some(port) = lookup("SANDPREVIEW_PORT") {
        match port.parse() {
            Ok(port) => config.pipeline.port = port,
            Err(e) => warn!("Ignoring SANDPREVIEW_PORT={}: {}", port, e),
        }
    }
    if let Some(timeout) = lookup("SANDPREVIEW_READY_TIMEOUT") {
        match parse_duration(&timeout) {
            Some(timeout) => config.pipeline.ready_timeout = timeout,
            None => warn!("Ignoring SANDPREVIEW_READY_TIMEOUT={}", timeout),
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Accepts human-readable durations ("90s", "2m") or plain seconds
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime_serde::re::humantime::parse_duration(value).ok()
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeBackend;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();

        let mut config = Config::default();
        config.pipeline.ready_timeout = Duration::from_secs(45);
        config.runtime.backend = RuntimeBackend::Container;

        for name in ["config.json", "config.toml"] {
            let path = dir.path().join(name);
            save_config(&config, &path).unwrap();
            let loaded = load_config_from_path(&path).unwrap();
            assert_eq!(loaded, config, "round trip through {}", name);
        }
    }

    #[test]
    fn test_json5_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            "{\n  // preview port\n  pipeline: { port: 5173, ready_timeout: \"30s\", },\n}",
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.pipeline.port, 5173);
        assert_eq!(config.pipeline.ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SANDPREVIEW_BACKEND", "docker"),
            ("SANDPREVIEW_PORT", "8080"),
            ("SANDPREVIEW_READY_TIMEOUT", "0"),
            ("SANDPREVIEW_START_COMMAND", "npx serve . -p 8080"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.runtime.backend, RuntimeBackend::Container);
        assert_eq!(config.pipeline.port, 8080);
        assert_eq!(config.pipeline.ready_deadline(), None);
        assert_eq!(config.pipeline.start_command[0], "npx");
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| match key {
            "SANDPREVIEW_PORT" => Some("not-a-port".to_string()),
            "SANDPREVIEW_BACKEND" => Some("wasm".to_string()),
            _ => None,
        });
        assert_eq!(config, Config::default());
    }
}
