//! Sandbox backend configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Sandbox backend configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Which backend boots the sandbox
    #[serde(default)]
    pub backend: RuntimeBackend,
    /// Parent directory for local workspaces; the system temp dir when unset
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Container backend configuration
    #[serde(default)]
    pub container: ContainerConfig,
}

/// Sandbox backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// Private host directory, host child processes
    #[default]
    Local,
    /// One Docker container per sandbox
    Container,
}

impl std::str::FromStr for RuntimeBackend {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "os" => Ok(RuntimeBackend::Local),
            "container" | "docker" => Ok(RuntimeBackend::Container),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid runtime backend: {}. Valid: local, container",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeBackend::Local => write!(f, "local"),
            RuntimeBackend::Container => write!(f, "container"),
        }
    }
}

/// Container (Docker) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Docker image with Node.js and npm
    #[serde(default = "default_image")]
    pub image: String,
    /// Project directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Network mode; the install step needs registry access
    #[serde(default = "default_network")]
    pub network: String,
    /// Memory limit
    #[serde(default = "default_memory")]
    pub memory_limit: String,
    /// CPU limit (number of CPUs)
    #[serde(default = "default_cpu")]
    pub cpu_limit: f64,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            image: default_image(),
            workdir: default_workdir(),
            network: default_network(),
            memory_limit: default_memory(),
            cpu_limit: default_cpu(),
            env: HashMap::new(),
        }
    }
}

fn default_image() -> String {
    "node:20-alpine".to_string()
}

fn default_workdir() -> String {
    "/home/project".to_string()
}

fn default_network() -> String {
    "bridge".to_string()
}

fn default_memory() -> String {
    "1g".to_string()
}

fn default_cpu() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("docker".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Container);
        assert_eq!("LOCAL".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Local);
        assert!("wasm".parse::<RuntimeBackend>().is_err());
        assert_eq!(RuntimeBackend::Container.to_string(), "container");
    }
}
