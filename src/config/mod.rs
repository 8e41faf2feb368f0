//! Configuration module
//!
//! Configuration is split into focused modules:
//! - types/mod.rs: Root `Config` and project layout settings
//! - types/runtime.rs: Sandbox backend configuration
//! - types/pipeline.rs: Install/serve commands, port and timeouts
//! - io.rs: Configuration loading, saving and env overrides
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{BuildConfig, Config};

// Re-export runtime types
pub use types::runtime::{ContainerConfig, RuntimeBackend, RuntimeConfig};

// Re-export pipeline types
pub use types::pipeline::PipelineConfig;

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
