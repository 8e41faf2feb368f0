//! Sandbox runtime - the isolated environment previews run in
//!
//! Provides two backends plus a scripted one for tests:
//! - Local: a private workspace directory, commands run as host child processes
//! - Container: one long-lived Docker container driven through `docker exec`
//! - Mock: in-memory runtime with injectable failures
//!
//! A runtime is booted once by the [`RuntimeManager`] and shared by every
//! preview in the process.

mod container;
mod local;
mod manager;
pub mod mock;
mod process;
mod probe;

pub use container::{ContainerBooter, ContainerRuntime};
pub use local::{LocalBooter, LocalRuntime};
pub use manager::{RuntimeHandle, RuntimeManager, RuntimeState};
pub use process::{CommandSpec, ProcessGuard, ProcessIo, SandboxProcess};
pub(crate) use process::lost_exit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::{Config, RuntimeBackend};
use crate::error::Result;
use crate::vfs::MountNode;

/// Payload of the server-ready signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    /// Port the server bound inside the sandbox
    pub port: u16,
    /// URL the preview is reachable at from the caller
    pub url: String,
}

/// A booted sandbox instance
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Write `root` into the project directory, overwriting conflicting paths
    async fn mount(&self, root: &MountNode) -> Result<()>;

    /// Start a command in the project directory
    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess>;

    /// Subscribe to server-ready signals. Subscribe before spawning the
    /// server: signals sent earlier are not replayed.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Destroy the instance
    async fn teardown(&self) -> Result<()>;
}

/// Boots sandbox instances of one backend
#[async_trait]
pub trait RuntimeBooter: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Boot a fresh instance
    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>>;
}

/// Create a booter for the configured backend
pub fn create_booter(config: &Config) -> Arc<dyn RuntimeBooter> {
    match config.runtime.backend {
        RuntimeBackend::Local => Arc::new(LocalBooter::new(config)),
        RuntimeBackend::Container => Arc::new(ContainerBooter::new(config)),
    }
}
