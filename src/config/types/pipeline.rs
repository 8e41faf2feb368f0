//! Install/serve pipeline configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::runtime::CommandSpec;

/// Install/serve pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dependency install command, program first
    #[serde(default = "default_install")]
    pub install_command: Vec<String>,
    /// Server start command, program first
    #[serde(default = "default_start")]
    pub start_command: Vec<String>,
    /// Port the preview server listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long to wait for the server after starting it; `0s` waits forever
    #[serde(with = "humantime_serde", default = "default_ready_timeout")]
    pub ready_timeout: Duration,
    /// Delay between readiness probes
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// Output lines buffered per process
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Output lines retained for slow log subscribers
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            install_command: default_install(),
            start_command: default_start(),
            port: default_port(),
            ready_timeout: default_ready_timeout(),
            probe_interval: default_probe_interval(),
            output_buffer: default_output_buffer(),
            log_buffer: default_log_buffer(),
        }
    }
}

impl PipelineConfig {
    pub fn install_spec(&self) -> Result<CommandSpec> {
        CommandSpec::from_argv(&self.install_command)
    }

    pub fn start_spec(&self) -> Result<CommandSpec> {
        Ok(CommandSpec::from_argv(&self.start_command)?.serving())
    }

    /// Ready timeout, or `None` when waiting is unbounded
    pub fn ready_deadline(&self) -> Option<Duration> {
        (!self.ready_timeout.is_zero()).then_some(self.ready_timeout)
    }
}

fn default_install() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_start() -> Vec<String> {
    vec!["npm".to_string(), "start".to_string()]
}

fn default_port() -> u16 {
    3000
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_output_buffer() -> usize {
    256
}

fn default_log_buffer() -> usize {
    1024
}
