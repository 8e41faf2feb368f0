//! Scripted sandbox backend for tests
//!
//! Records what it is asked to do and plays back a configurable script:
//! boot delays and failures, mount failures, per-command exit codes and
//! output, and whether the server ever reports ready.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use super::process::{CommandSpec, SandboxProcess};
use super::{RuntimeBooter, SandboxRuntime, ServerReady};
use crate::error::{Error, Result};
use crate::vfs::MountNode;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a [`MockRuntime`] does when asked
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Error message returned by every mount
    pub mount_error: Option<String>,
    /// Exit codes by command line; unlisted commands exit 0
    pub exit_codes: HashMap<String, i32>,
    /// Commands that keep running until stopped
    pub long_running: Vec<String>,
    /// Output lines by command line
    pub output: HashMap<String, Vec<String>>,
    /// Whether long-running commands announce a ready server
    pub serve_ready: bool,
    /// Ready signal payload
    pub ready: ServerReady,
    /// Error message returned by teardown
    pub teardown_error: Option<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        MockScript {
            mount_error: None,
            exit_codes: HashMap::new(),
            long_running: vec!["npm start".to_string()],
            output: HashMap::new(),
            serve_ready: true,
            ready: ServerReady {
                port: 3000,
                url: "http://localhost:3000".to_string(),
            },
            teardown_error: None,
        }
    }
}

impl MockScript {
    /// Make `command` exit with `code`
    pub fn with_exit_code(mut self, command: &str, code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    /// Make `command` print `lines`
    pub fn with_output<I, S>(mut self, command: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output
            .insert(command.to_string(), lines.into_iter().map(Into::into).collect());
        self
    }

    /// Make every mount fail with `message`
    pub fn with_mount_error(mut self, message: impl Into<String>) -> Self {
        self.mount_error = Some(message.into());
        self
    }

    /// Make teardown fail with `message`
    pub fn with_teardown_error(mut self, message: impl Into<String>) -> Self {
        self.teardown_error = Some(message.into());
        self
    }

    /// Keep long-running commands alive without ever announcing readiness
    pub fn never_ready(mut self) -> Self {
        self.serve_ready = false;
        self
    }
}

/// Boots [`MockRuntime`] instances and keeps a handle to the latest one
#[derive(Default)]
pub struct MockBooter {
    script: MockScript,
    boot_delay: Option<Duration>,
    boot_error: Option<String>,
    boots: AtomicUsize,
    last: Mutex<Option<Arc<MockRuntime>>>,
}

impl MockBooter {
    pub fn new(script: MockScript) -> Self {
        MockBooter {
            script,
            ..Default::default()
        }
    }

    /// Sleep this long inside every boot
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = Some(delay);
        self
    }

    /// Fail every boot with `message`
    pub fn with_boot_error(mut self, message: impl Into<String>) -> Self {
        self.boot_error = Some(message.into());
        self
    }

    /// Number of boots attempted
    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    /// Most recently booted runtime
    pub fn last_runtime(&self) -> Option<Arc<MockRuntime>> {
        lock(&self.last).clone()
    }
}

#[async_trait]
impl RuntimeBooter for MockBooter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.boot_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.boot_error {
            return Err(Error::Boot(message.clone()));
        }

        let runtime = Arc::new(MockRuntime::new(self.script.clone()));
        *lock(&self.last) = Some(runtime.clone());
        Ok(runtime)
    }
}

/// In-memory sandbox that records mounts and spawned commands
pub struct MockRuntime {
    script: MockScript,
    mounts: Mutex<Vec<MountNode>>,
    spawned: Mutex<Vec<String>>,
    teardowns: AtomicUsize,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl MockRuntime {
    pub fn new(script: MockScript) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        MockRuntime {
            script,
            mounts: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            teardowns: AtomicUsize::new(0),
            ready_tx,
        }
    }

    /// Trees mounted so far, oldest first
    pub fn mounts(&self) -> Vec<MountNode> {
        lock(&self.mounts).clone()
    }

    /// Command lines spawned so far, oldest first
    pub fn spawned(&self) -> Vec<String> {
        lock(&self.spawned).clone()
    }

    /// Number of teardowns
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn mount(&self, root: &MountNode) -> Result<()> {
        if let Some(message) = &self.script.mount_error {
            return Err(Error::Mount(message.clone()));
        }
        lock(&self.mounts).push(root.clone());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess> {
        let line = command.to_string();
        lock(&self.spawned).push(line.clone());

        let (io, process) = SandboxProcess::channel(line.clone(), 64);
        let output = self.script.output.get(&line).cloned().unwrap_or_default();
        let exit_code = self.script.exit_codes.get(&line).copied().unwrap_or(0);
        let long_running = self.script.long_running.contains(&line);
        let ready = (long_running && self.script.serve_ready).then(|| {
            (self.ready_tx.clone(), self.script.ready.clone())
        });

        tokio::spawn(async move {
            for text in output {
                if io.output.send(text).await.is_err() {
                    break;
                }
            }
            drop(io.output);

            if long_running {
                if let Some((signal, payload)) = ready {
                    let _ = signal.send(payload);
                }
                // Runs until the guard is dropped.
                let _ = io.kill.await;
                let _ = io.exit.send(-1);
            } else {
                let _ = io.exit.send(exit_code);
            }
        });

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        match &self.script.teardown_error {
            Some(message) => Err(Error::Internal(message.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_exit_and_output() {
        let script = MockScript::default()
            .with_exit_code("npm install", 1)
            .with_output("npm install", ["npm ERR! 404"]);
        let runtime = MockRuntime::new(script);

        let mut process = runtime
            .spawn(&CommandSpec::new("npm", ["install"]))
            .await
            .unwrap();
        assert_eq!(process.output.recv().await.as_deref(), Some("npm ERR! 404"));
        assert_eq!((&mut process.exit).await.unwrap(), 1);
        assert_eq!(runtime.spawned(), vec!["npm install"]);
    }

    #[tokio::test]
    async fn test_long_running_announces_and_stops() {
        let runtime = MockRuntime::new(MockScript::default());
        let mut ready = runtime.server_ready();

        let process = runtime.spawn(&CommandSpec::new("npm", ["start"]).serving()).await.unwrap();
        assert_eq!(ready.recv().await.unwrap().port, 3000);

        let SandboxProcess { exit, guard, .. } = process;
        drop(guard);
        assert_eq!(exit.await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_boot_error() {
        let booter = MockBooter::new(MockScript::default()).with_boot_error("no sandbox");
        assert!(booter.boot().await.is_err());
        assert_eq!(booter.boots(), 1);
        assert!(booter.last_runtime().is_none());
    }
}
