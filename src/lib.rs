//! # sandpreview
//!
//! Live previews for generated web projects, run inside a sandbox.
//!
//! ## Features
//!
//! - **Project layout:** flat generated files become a runnable static-site project
//! - **Shared sandbox:** one sandbox is booted on first use and reused by every preview
//! - **Install/serve pipeline:** dependency install, server start and readiness detection
//! - **Classified failures:** every failure is mapped to a category with remediation steps
//! - **Backends:** a local workspace directory or a Docker container

pub mod classify;
pub mod config;
pub mod error;
pub mod isolation;
pub mod preview;
pub mod runtime;
pub mod session;
pub mod supervisor;
pub mod vfs;

pub use classify::{ClassifiedError, ErrorCategory};
pub use config::Config;
pub use error::{Error, Result};
pub use preview::Previewer;
pub use session::{Phase, PreviewSession};
pub use vfs::{GeneratedFile, GeneratedFileSet, MountNode};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
