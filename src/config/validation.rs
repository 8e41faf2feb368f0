//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::runtime::RuntimeBackend;
use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_pipeline_config(config, result);
    result = validate_runtime_config(config, result);

    result
}

fn validate_pipeline_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let pipeline = &config.pipeline;

    for (path, argv) in [
        ("pipeline.install_command", &pipeline.install_command),
        ("pipeline.start_command", &pipeline.start_command),
    ] {
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            result = result.with_error(
                ValidationIssue::new(path, "Command is empty")
                    .with_suggestion("Use a program followed by its arguments, e.g. [\"npm\", \"install\"]"),
            );
        }
    }

    if pipeline.port == 0 {
        result = result.with_error(
            ValidationIssue::new("pipeline.port", "Port 0 cannot be probed for readiness")
                .with_suggestion("Use the port the start command listens on, e.g. 3000"),
        );
    }

    if pipeline.probe_interval.is_zero() {
        result = result.with_error(
            ValidationIssue::new("pipeline.probe_interval", "Probe interval must be greater than zero")
                .with_suggestion("Use a short interval such as \"250ms\""),
        );
    }

    if pipeline.ready_deadline().is_none() {
        result = result.with_warning(
            ValidationIssue::new(
                "pipeline.ready_timeout",
                "Ready timeout is zero; a server that never starts keeps the preview loading forever",
            )
            .with_suggestion("Set a timeout such as \"2m\""),
        );
    }

    if pipeline.output_buffer == 0 || pipeline.log_buffer == 0 {
        result = result.with_warning(ValidationIssue::new(
            "pipeline",
            "Zero-sized output buffers are raised to one line",
        ));
    }

    result
}

fn validate_runtime_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    match config.runtime.backend {
        RuntimeBackend::Local => {
            let programs = [&config.pipeline.install_command, &config.pipeline.start_command];
            for program in programs.iter().filter_map(|argv| argv.first()) {
                if !program.trim().is_empty() && which::which(program).is_err() {
                    result = result.with_error(
                        ValidationIssue::new(
                            "runtime.backend",
                            format!("`{}` was not found on PATH", program),
                        )
                        .with_suggestion("Install Node.js and npm, or use the container backend"),
                    );
                }
            }

            if let Some(root) = &config.runtime.workspace_root {
                if !root.exists() {
                    result = result.with_warning(
                        ValidationIssue::new(
                            "runtime.workspace_root",
                            format!("Workspace root does not exist: {}", root.display()),
                        )
                        .with_suggestion("It will be created on first boot"),
                    );
                }
            }
        }
        RuntimeBackend::Container => {
            let container = &config.runtime.container;
            if container.image.is_empty() {
                result = result.with_error(
                    ValidationIssue::new(
                        "runtime.container.image",
                        "Container backend selected but no image specified",
                    )
                    .with_suggestion("Set runtime.container.image to an image with Node.js, e.g. node:20-alpine"),
                );
            }
            if container.network == "none" {
                result = result.with_error(
                    ValidationIssue::new(
                        "runtime.container.network",
                        "Network mode \"none\" blocks dependency install and the published preview port",
                    )
                    .with_suggestion("Use \"bridge\""),
                );
            }
            if !container.workdir.starts_with('/') {
                result = result.with_error(
                    ValidationIssue::new(
                        "runtime.container.workdir",
                        "Container working directory must be absolute",
                    ),
                );
            }
            if container.cpu_limit <= 0.0 {
                result = result.with_error(ValidationIssue::new(
                    "runtime.container.cpu_limit",
                    "CPU limit must be greater than zero",
                ));
            }
        }
    }

    result
}
