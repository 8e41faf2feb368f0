//! Install/serve pipeline
//!
//! Runs one preview attempt against a booted sandbox:
//! - mounts the project tree
//! - runs the install command and waits for it to exit
//! - starts the server and waits for its ready signal
//!
//! Output of both processes is relayed line by line, in order, to log
//! subscribers. The server is never started when install fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, Stage};
use crate::runtime::{
    CommandSpec, ProcessGuard, RuntimeHandle, SandboxProcess, ServerReady,
};
use crate::session::PipelineStep;
use crate::vfs::MountNode;

/// Which process produced a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Install,
    Serve,
}

impl std::fmt::Display for OutputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSource::Install => write!(f, "install"),
            OutputSource::Serve => write!(f, "serve"),
        }
    }
}

/// One line of process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub source: OutputSource,
    pub line: String,
    pub at: DateTime<Utc>,
}

/// A server that reported ready. Dropping it stops the server.
#[derive(Debug)]
pub struct RunningPreview {
    /// Ready signal the server produced
    pub ready: ServerReady,
    /// Keeps the server process alive
    pub server: ProcessGuard,
}

/// Drives the install and serve processes of a preview
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    install: CommandSpec,
    start: CommandSpec,
    ready_timeout: Option<Duration>,
    logs: broadcast::Sender<LogLine>,
}

impl ProcessSupervisor {
    pub fn new(
        install: CommandSpec,
        start: CommandSpec,
        ready_timeout: Option<Duration>,
        logs: broadcast::Sender<LogLine>,
    ) -> Self {
        ProcessSupervisor {
            install,
            start,
            ready_timeout,
            logs,
        }
    }

    /// Build from configuration; fails on empty commands
    pub fn from_config(config: &Config, logs: broadcast::Sender<LogLine>) -> Result<Self> {
        Ok(ProcessSupervisor::new(
            config.pipeline.install_spec()?,
            config.pipeline.start_spec()?,
            config.pipeline.ready_deadline(),
            logs,
        ))
    }

    /// Subscribe to output of every process this supervisor starts
    pub fn logs(&self) -> broadcast::Receiver<LogLine> {
        self.logs.subscribe()
    }

    /// Mount `tree`, install dependencies and start the server.
    ///
    /// `progress` is called as each step begins.
    pub async fn run<P>(
        &self,
        runtime: &RuntimeHandle,
        tree: &MountNode,
        progress: P,
    ) -> Result<RunningPreview>
    where
        P: Fn(PipelineStep),
    {
        progress(PipelineStep::Mounting);
        runtime.mount(tree).await.map_err(|e| match e {
            Error::Mount(message) => Error::Mount(message),
            other => Error::Mount(other.to_string()),
        })?;

        progress(PipelineStep::Installing);
        self.install(runtime).await?;

        progress(PipelineStep::Starting);
        // Subscribe first; the signal is not replayed.
        let mut ready_rx = runtime.server_ready();
        let server = runtime
            .spawn(&self.start)
            .await
            .map_err(|e| e.in_stage(Stage::Serve))?;
        let SandboxProcess {
            output,
            exit,
            guard,
        } = server;
        self.relay(OutputSource::Serve, output);

        progress(PipelineStep::WaitingForServer);
        let wait = wait_ready(&mut ready_rx, exit);
        let ready = match self.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                Error::ServeNeverReady(format!(
                    "`{}` did not report ready within {}",
                    self.start,
                    humantime_serde::re::humantime::format_duration(limit)
                ))
            })??,
            None => wait.await?,
        };

        info!("Preview ready at {}", ready.url);
        Ok(RunningPreview {
            ready,
            server: guard,
        })
    }

    async fn install(&self, runtime: &RuntimeHandle) -> Result<()> {
        let process = runtime
            .spawn(&self.install)
            .await
            .map_err(|e| e.in_stage(Stage::Install))?;
        let SandboxProcess {
            output,
            exit,
            guard,
        } = process;
        let relay = self.relay(OutputSource::Install, output);

        let exit_code = exit
            .await
            .map_err(|_| crate::runtime::lost_exit(Stage::Install, guard.label()))?;
        // Output sent before exit is flushed before the result is reported.
        let _ = relay.await;

        if exit_code != 0 {
            warn!("`{}` exited with code {}", self.install, exit_code);
            return Err(Error::Install { exit_code });
        }
        debug!("`{}` finished", self.install);
        Ok(())
    }

    /// Forward a process's lines to log subscribers, in order
    fn relay(
        &self,
        source: OutputSource,
        mut output: mpsc::Receiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let logs = self.logs.clone();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                debug!(target: "sandpreview::output", %source, "{}", line);
                // No subscribers is fine; the line is still traced.
                let _ = logs.send(LogLine {
                    source,
                    line,
                    at: Utc::now(),
                });
            }
        })
    }
}

/// Wait for the ready signal, failing if the server exits first
async fn wait_ready(
    ready_rx: &mut broadcast::Receiver<ServerReady>,
    mut exit: tokio::sync::oneshot::Receiver<i32>,
) -> Result<ServerReady> {
    loop {
        tokio::select! {
            signal = ready_rx.recv() => match signal {
                Ok(ready) => return Ok(ready),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Missed {} ready signals", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::ServeNeverReady(
                        "sandbox stopped before the server became ready".to_string(),
                    ));
                }
            },
            code = &mut exit => {
                let message = match code {
                    Ok(code) => format!("server exited with code {} before becoming ready", code),
                    Err(_) => "server stopped before becoming ready".to_string(),
                };
                return Err(Error::ServeNeverReady(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{MockBooter, MockScript};
    use crate::runtime::RuntimeManager;
    use std::sync::{Arc, Mutex};

    fn supervisor(timeout: Option<Duration>) -> ProcessSupervisor {
        let (logs, _) = broadcast::channel(64);
        ProcessSupervisor::new(
            CommandSpec::new("npm", ["install"]),
            CommandSpec::new("npm", ["start"]).serving(),
            timeout,
            logs,
        )
    }

    async fn runtime(script: MockScript) -> (Arc<MockBooter>, RuntimeHandle) {
        let booter = Arc::new(MockBooter::new(script));
        let manager = RuntimeManager::new(booter.clone());
        let handle = manager.acquire().await.unwrap();
        (booter, handle)
    }

    #[tokio::test]
    async fn test_happy_path_reports_steps_in_order() {
        let (booter, handle) = runtime(MockScript::default()).await;
        let steps = Mutex::new(Vec::new());

        let running = supervisor(None)
            .run(&handle, &MountNode::directory(), |s| steps.lock().unwrap().push(s))
            .await
            .unwrap();

        assert_eq!(running.ready.url, "http://localhost:3000");
        assert_eq!(
            *steps.lock().unwrap(),
            vec![
                PipelineStep::Mounting,
                PipelineStep::Installing,
                PipelineStep::Starting,
                PipelineStep::WaitingForServer,
            ]
        );
        let mock = booter.last_runtime().unwrap();
        assert_eq!(mock.spawned(), vec!["npm install", "npm start"]);
        assert_eq!(mock.mounts().len(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_skips_serve() {
        let script = MockScript::default().with_exit_code("npm install", 1);
        let (booter, handle) = runtime(script).await;

        let err = supervisor(None)
            .run(&handle, &MountNode::directory(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Install { exit_code: 1 }));
        assert_eq!(booter.last_runtime().unwrap().spawned(), vec!["npm install"]);
    }

    #[tokio::test]
    async fn test_install_output_reaches_subscribers_in_order() {
        let script = MockScript::default()
            .with_output("npm install", ["resolving", "added 2 packages"]);
        let (_booter, handle) = runtime(script).await;
        let supervisor = supervisor(None);
        let mut logs = supervisor.logs();

        supervisor
            .run(&handle, &MountNode::directory(), |_| {})
            .await
            .unwrap();

        let first = logs.recv().await.unwrap();
        let second = logs.recv().await.unwrap();
        assert_eq!(first.source, OutputSource::Install);
        assert_eq!(first.line, "resolving");
        assert_eq!(second.line, "added 2 packages");
    }

    #[tokio::test]
    async fn test_mount_failure() {
        let script = MockScript::default().with_mount_error("disk full");
        let (booter, handle) = runtime(script).await;

        let err = supervisor(None)
            .run(&handle, &MountNode::directory(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Mount(_)));
        assert!(booter.last_runtime().unwrap().spawned().is_empty());
    }

    #[tokio::test]
    async fn test_server_exit_before_ready() {
        let mut script = MockScript::default();
        script.long_running.clear();
        let script = script.with_exit_code("npm start", 1);
        let (_booter, handle) = runtime(script).await;

        let err = supervisor(None)
            .run(&handle, &MountNode::directory(), |_| {})
            .await
            .unwrap_err();

        match err {
            Error::ServeNeverReady(message) => assert!(message.contains("code 1")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let (_booter, handle) = runtime(MockScript::default().never_ready()).await;

        let err = supervisor(Some(Duration::from_millis(50)))
            .run(&handle, &MountNode::directory(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServeNeverReady(_)));
    }
}
