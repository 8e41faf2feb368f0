//! Shared sandbox lifecycle
//!
//! At most one sandbox instance exists per manager. The first caller of
//! [`RuntimeManager::acquire`] boots it and concurrent callers wait for that
//! same boot; a failed boot leaves the manager unbooted so the next call
//! retries. The boot runs in its own task: a caller that stops waiting does
//! not cancel it, and the instance it produces is kept for the next caller.

use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{RuntimeBooter, SandboxRuntime};
use crate::error::{Error, Result};

/// Lifecycle state of the shared instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Unbooted,
    Booting,
    Ready,
}

/// A booted sandbox instance
#[derive(Clone)]
pub struct RuntimeHandle {
    id: Uuid,
    runtime: Arc<dyn SandboxRuntime>,
}

impl RuntimeHandle {
    /// Identifier assigned at boot
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether both handles refer to the same boot
    pub fn same_instance(&self, other: &RuntimeHandle) -> bool {
        self.id == other.id
    }
}

impl Deref for RuntimeHandle {
    type Target = dyn SandboxRuntime;

    fn deref(&self) -> &Self::Target {
        self.runtime.as_ref()
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("backend", &self.runtime.name())
            .finish()
    }
}

/// Boots the shared sandbox on first use and tears it down on release
pub struct RuntimeManager {
    booter: Arc<dyn RuntimeBooter>,
    slot: Arc<Mutex<Option<RuntimeHandle>>>,
    state: Arc<watch::Sender<RuntimeState>>,
}

/// Puts the state back to `Unbooted` if a boot does not complete
struct BootGuard<'a> {
    state: &'a watch::Sender<RuntimeState>,
    armed: bool,
}

impl Drop for BootGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(RuntimeState::Unbooted);
        }
    }
}

impl RuntimeManager {
    pub fn new(booter: Arc<dyn RuntimeBooter>) -> Self {
        let (state, _) = watch::channel(RuntimeState::Unbooted);
        RuntimeManager {
            booter,
            slot: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
        }
    }

    /// Backend name
    pub fn backend(&self) -> &str {
        self.booter.name()
    }

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Return the shared instance, booting it if needed.
    ///
    /// Dropping the returned future does not cancel a boot in progress.
    pub async fn acquire(&self) -> Result<RuntimeHandle> {
        let booter = Arc::clone(&self.booter);
        let slot = Arc::clone(&self.slot);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move { acquire_shared(booter.as_ref(), &slot, &state).await })
            .await
            .map_err(|e| Error::Boot(format!("Boot task failed: {}", e)))?
    }

    /// Tear down the shared instance, if any. Safe to call repeatedly.
    pub async fn release(&self) {
        let handle = self.slot.lock().await.take();
        let Some(handle) = handle else {
            debug!("No sandbox to release");
            return;
        };

        match handle.teardown().await {
            Ok(()) => info!("Sandbox {} torn down", handle.id),
            Err(e) => warn!("Sandbox {} teardown failed: {}", handle.id, e),
        }
        self.state.send_replace(RuntimeState::Unbooted);
    }

    /// Release the instance when the process is asked to stop
    pub fn spawn_unload_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown requested, releasing sandbox");
            manager.release().await;
        })
    }
}

async fn acquire_shared(
    booter: &dyn RuntimeBooter,
    slot: &Mutex<Option<RuntimeHandle>>,
    state: &watch::Sender<RuntimeState>,
) -> Result<RuntimeHandle> {
    // Held across the boot so concurrent callers wait for it.
    let mut slot = slot.lock().await;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    state.send_replace(RuntimeState::Booting);
    let mut guard = BootGuard { state, armed: true };

    info!("Booting {} sandbox", booter.name());
    let runtime = booter.boot().await.map_err(|e| {
        error!("Sandbox boot failed: {}", e);
        match e {
            Error::Boot(message) => Error::Boot(message),
            other => Error::Boot(other.to_string()),
        }
    })?;

    let handle = RuntimeHandle {
        id: Uuid::new_v4(),
        runtime,
    };
    info!("Sandbox {} ready", handle.id);

    *slot = Some(handle.clone());
    guard.armed = false;
    state.send_replace(RuntimeState::Ready);
    Ok(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{MockBooter, MockScript};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_acquire_boots_once() {
        let booter = Arc::new(
            MockBooter::new(MockScript::default()).with_boot_delay(Duration::from_millis(50)),
        );
        let manager = Arc::new(RuntimeManager::new(booter.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire().await.unwrap() })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(booter.boots(), 1);
        assert!(handles.iter().all(|h| h.same_instance(&handles[0])));
        assert_eq!(manager.state(), RuntimeState::Ready);
    }

    #[tokio::test]
    async fn test_failed_boot_allows_retry() {
        let booter = Arc::new(MockBooter::new(MockScript::default()).with_boot_error("boom"));
        let manager = RuntimeManager::new(booter.clone());

        assert!(matches!(manager.acquire().await, Err(Error::Boot(_))));
        assert_eq!(manager.state(), RuntimeState::Unbooted);
        assert!(manager.acquire().await.is_err());
        assert_eq!(booter.boots(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_keeps_boot() {
        let booter = Arc::new(
            MockBooter::new(MockScript::default()).with_boot_delay(Duration::from_millis(200)),
        );
        let manager = RuntimeManager::new(booter.clone());

        let gave_up = tokio::time::timeout(Duration::from_millis(20), manager.acquire()).await;
        assert!(gave_up.is_err());
        assert_eq!(manager.state(), RuntimeState::Booting);

        let handle = manager.acquire().await.unwrap();
        assert_eq!(booter.boots(), 1);
        assert_eq!(manager.state(), RuntimeState::Ready);
        assert!(handle.same_instance(&manager.acquire().await.unwrap()));
    }

    #[tokio::test]
    async fn test_teardown_failure_still_unboots() {
        let booter = Arc::new(MockBooter::new(
            MockScript::default().with_teardown_error("container already gone"),
        ));
        let manager = RuntimeManager::new(booter.clone());

        let first = manager.acquire().await.unwrap();
        manager.release().await;

        assert_eq!(manager.state(), RuntimeState::Unbooted);
        assert_eq!(booter.last_runtime().unwrap().teardowns(), 1);

        let second = manager.acquire().await.unwrap();
        assert!(!first.same_instance(&second));
        assert_eq!(booter.boots(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let booter = Arc::new(MockBooter::new(MockScript::default()));
        let manager = RuntimeManager::new(booter.clone());

        let first = manager.acquire().await.unwrap();
        manager.release().await;
        manager.release().await;
        assert_eq!(manager.state(), RuntimeState::Unbooted);
        assert_eq!(booter.last_runtime().unwrap().teardowns(), 1);

        let second = manager.acquire().await.unwrap();
        assert!(!first.same_instance(&second));
        assert_eq!(booter.boots(), 2);
    }
}
