//! Configuration types module
//!
//! Re-exports all configuration types.

pub mod pipeline;
pub mod runtime;

use serde::{Deserialize, Serialize};

use crate::vfs::BuildOptions;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sandbox backend configuration
    #[serde(default)]
    pub runtime: runtime::RuntimeConfig,

    /// Install/serve pipeline configuration
    #[serde(default)]
    pub pipeline: pipeline::PipelineConfig,

    /// Project layout configuration
    #[serde(default)]
    pub build: BuildConfig,
}

impl Config {
    /// Load configuration from the config file and environment variables
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }

    /// Options for laying out generated files
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            port: self.pipeline.port,
            serve_version: self.build.serve_version.clone(),
        }
    }
}

/// Project layout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Version range of the static file server added to the manifest
    #[serde(default = "default_serve_version")]
    pub serve_version: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            serve_version: default_serve_version(),
        }
    }
}

fn default_serve_version() -> String {
    BuildOptions::default().serve_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.runtime.backend, runtime::RuntimeBackend::Local);
        assert_eq!(config.pipeline.port, 3000);
        assert_eq!(config.build.serve_version, "^14.0.0");
        assert_eq!(config.build_options(), BuildOptions::default());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"pipeline": {"port": 8080}}"#).unwrap();
        assert_eq!(config.pipeline.port, 8080);
        assert_eq!(config.pipeline.install_command, vec!["npm", "install"]);
        assert_eq!(config.build_options().port, 8080);
    }
}
