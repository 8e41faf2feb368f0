//! Error classification
//!
//! Maps raw failure text from the boot and process layers onto a small set of
//! categories, each with fixed remediation steps a user can act on.
//! Classification is substring matching and never fails: text that matches
//! nothing is reported as [`ErrorCategory::Unknown`] with the raw text intact.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Stage};

/// Failure categories surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The sandbox may not use persistent storage
    StorageAccessDenied,
    /// The hosting page lacks cross-origin isolation headers
    MissingSecurityHeaders,
    /// Dependency install exited non-zero
    InstallFailed,
    /// Writing files into the sandbox failed
    MountFailed,
    /// The sandbox failed to boot
    BootFailed,
    /// The start command never signalled readiness
    ServeNeverReady,
    /// Anything else
    Unknown,
}

const STORAGE_PATTERNS: &[&str] = &["storage is not allowed"];
const HEADER_PATTERNS: &[&str] = &["headers", "cross-origin isolat", "sharedarraybuffer"];

impl ErrorCategory {
    /// Short headline for the error panel
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCategory::StorageAccessDenied => "Storage access error",
            ErrorCategory::MissingSecurityHeaders => "Security headers missing",
            ErrorCategory::InstallFailed => "Dependency install failed",
            ErrorCategory::MountFailed => "Could not write project files",
            ErrorCategory::BootFailed => "Sandbox failed to start",
            ErrorCategory::ServeNeverReady => "Preview server did not start",
            ErrorCategory::Unknown => "Preview failed",
        }
    }

    /// Fixed remediation steps, in the order they should be tried
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::StorageAccessDenied => &[
                "Disable any content-blocking extensions",
                "Open in a new incognito/private window",
                "Try a different browser (Chrome recommended)",
                "Refresh the page",
            ],
            ErrorCategory::MissingSecurityHeaders => &[
                "Disable browser extensions",
                "Clear browser cache",
                "Refresh the page",
            ],
            ErrorCategory::InstallFailed => &[
                "Check the install output for the failing package",
                "Make sure the sandbox can reach the package registry",
                "Regenerate the files and try again",
            ],
            ErrorCategory::MountFailed => &[
                "Check that the sandbox workspace is writable and has free space",
                "Try again",
            ],
            ErrorCategory::BootFailed => &[
                "Make sure the sandbox backend is installed and running",
                "Check the runtime configuration and that the workspace location is writable",
                "Try again",
            ],
            ErrorCategory::ServeNeverReady => &[
                "Check the server output for errors",
                "Make sure the preview port is not used by another process",
                "Try again",
            ],
            ErrorCategory::Unknown => &["Try again"],
        }
    }

    /// Category implied by a pipeline stage when no pattern matches
    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Boot => ErrorCategory::BootFailed,
            Stage::Mount => ErrorCategory::MountFailed,
            Stage::Install => ErrorCategory::InstallFailed,
            Stage::Serve => ErrorCategory::ServeNeverReady,
            Stage::Other => ErrorCategory::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::StorageAccessDenied => "storage_access_denied",
            ErrorCategory::MissingSecurityHeaders => "missing_security_headers",
            ErrorCategory::InstallFailed => "install_failed",
            ErrorCategory::MountFailed => "mount_failed",
            ErrorCategory::BootFailed => "boot_failed",
            ErrorCategory::ServeNeverReady => "serve_never_ready",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A failure ready to be shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Category
    pub category: ErrorCategory,
    /// Raw failure text, verbatim
    pub raw_message: String,
    /// Remediation steps for the category
    pub remediation: Vec<String>,
}

impl ClassifiedError {
    /// Build a classified error with the category's fixed remediation list
    pub fn new(category: ErrorCategory, raw_message: impl Into<String>) -> Self {
        ClassifiedError {
            category,
            raw_message: raw_message.into(),
            remediation: category
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Render the headline, raw message and numbered remediation steps
    pub fn user_message(&self) -> String {
        if self.category == ErrorCategory::Unknown {
            return self.raw_message.clone();
        }

        let mut message = format!("{}: {}\nPlease try the following:", self.category.title(), self.raw_message);
        for (i, step) in self.remediation.iter().enumerate() {
            message.push_str(&format!("\n{}. {}", i + 1, step));
        }
        message
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category, self.raw_message)
    }
}

/// Environment-level category detected from raw text, if any
fn match_patterns(raw: &str) -> Option<ErrorCategory> {
    let lowered = raw.to_lowercase();
    if STORAGE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        Some(ErrorCategory::StorageAccessDenied)
    } else if HEADER_PATTERNS.iter().any(|p| lowered.contains(p)) {
        Some(ErrorCategory::MissingSecurityHeaders)
    } else {
        None
    }
}

/// Classify free-form failure text
pub fn classify_message(raw: &str) -> ClassifiedError {
    let category = match_patterns(raw).unwrap_or(ErrorCategory::Unknown);
    ClassifiedError::new(category, raw)
}

/// Classify a pipeline error.
///
/// Environment patterns are only looked for in boot failures and errors
/// raised outside the pipeline. Later stages report file paths and process
/// output, so they take their stage's category.
pub fn classify(err: &Error) -> ClassifiedError {
    let raw = err.to_string();
    let category = match err {
        Error::Install { .. } => ErrorCategory::InstallFailed,
        Error::ServeNeverReady(_) => ErrorCategory::ServeNeverReady,
        Error::Boot(message) => match_patterns(message).unwrap_or(ErrorCategory::BootFailed),
        other => match other.stage() {
            Stage::Other => match_patterns(&raw).unwrap_or(ErrorCategory::Unknown),
            stage => ErrorCategory::for_stage(stage),
        },
    };
    ClassifiedError::new(category, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_denied_boot() {
        let err = Error::Boot("SecurityError: storage is not allowed in this context".into());
        let classified = classify(&err);

        assert_eq!(classified.category, ErrorCategory::StorageAccessDenied);
        assert_eq!(classified.remediation.len(), 4);
        assert!(classified.raw_message.contains("storage is not allowed"));
    }

    #[test]
    fn test_mount_paths_are_not_patterns() {
        let err = Error::Mount("src/components/Headers.js: No space left on device (os error 28)".into());
        assert_eq!(classify(&err).category, ErrorCategory::MountFailed);

        let err = Error::Mount("src/storage is not allowed.js: Permission denied (os error 13)".into());
        assert_eq!(classify(&err).category, ErrorCategory::MountFailed);
    }

    #[test]
    fn test_host_permission_errors_keep_stage() {
        let err = Error::Boot("Cannot create workspace: Permission denied (os error 13)".into());
        let classified = classify(&err);
        assert_eq!(classified.category, ErrorCategory::BootFailed);
        assert!(classified.remediation.iter().any(|s| s.contains("writable")));

        let err = Error::Spawn {
            stage: Stage::Serve,
            message: "npm start: read-only file system".into(),
        };
        assert_eq!(classify(&err).category, ErrorCategory::ServeNeverReady);
    }

    #[test]
    fn test_missing_headers() {
        let classified = classify_message("Cross-Origin isolation headers are not set");
        assert_eq!(classified.category, ErrorCategory::MissingSecurityHeaders);
        assert_eq!(classified.remediation.len(), 3);
    }

    #[test]
    fn test_install_failure_keeps_exit_code() {
        let classified = classify(&Error::Install { exit_code: 1 });
        assert_eq!(classified.category, ErrorCategory::InstallFailed);
        assert!(classified.raw_message.contains("exit code 1"));
    }

    #[test]
    fn test_stage_fallbacks() {
        assert_eq!(
            classify(&Error::Boot("npm not found".into())).category,
            ErrorCategory::BootFailed
        );
        assert_eq!(
            classify(&Error::Mount("disk full".into())).category,
            ErrorCategory::MountFailed
        );
        assert_eq!(
            classify(&Error::ServeNeverReady("no signal after 120s".into())).category,
            ErrorCategory::ServeNeverReady
        );
    }

    #[test]
    fn test_unknown_is_verbatim() {
        let raw = "something odd happened";
        let classified = classify_message(raw);

        assert_eq!(classified.category, ErrorCategory::Unknown);
        assert_eq!(classified.raw_message, raw);
        assert_eq!(classified.user_message(), raw);
    }

    #[test]
    fn test_user_message_numbers_steps() {
        let message = classify_message("storage is not allowed").user_message();
        assert!(message.starts_with("Storage access error"));
        assert!(message.contains("\n1. Disable any content-blocking extensions"));
        assert!(message.contains("\n4. Refresh the page"));
    }
}
