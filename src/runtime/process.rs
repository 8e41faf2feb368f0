//! Processes spawned inside a sandbox
//!
//! Every backend hands back the same shape: a bounded stream of output
//! lines, a one-shot exit code, and a guard whose drop stops the process.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result, Stage};

/// Program and arguments to run inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether the command is the preview server; only servers are probed
    /// for readiness
    #[serde(default)]
    pub serves: bool,
}

impl CommandSpec {
    /// Create a command
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            serves: false,
        }
    }

    /// Mark the command as the preview server
    pub fn serving(mut self) -> Self {
        self.serves = true;
        self
    }

    /// Build from an argv list such as `["npm", "install"]`
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("Command must not be empty".to_string()))?;
        if program.trim().is_empty() {
            return Err(Error::Config("Command program must not be blank".to_string()));
        }
        Ok(CommandSpec::new(program.clone(), args.iter().cloned()))
    }

    /// Full argv, program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Stops the process it belongs to when dropped
#[derive(Debug)]
pub struct ProcessGuard {
    label: String,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessGuard {
    /// A guard that has no process to stop
    pub fn detached(label: impl Into<String>) -> Self {
        ProcessGuard {
            label: label.into(),
            kill: None,
        }
    }

    /// Command line of the guarded process
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(kill) = self.kill.take() {
            debug!("Releasing process: {}", self.label);
            let _ = kill.send(());
        }
    }
}

/// A process running inside a sandbox
#[derive(Debug)]
pub struct SandboxProcess {
    /// Output lines (stdout and stderr interleaved), in stream order
    pub output: mpsc::Receiver<String>,
    /// Resolves with the exit code
    pub exit: oneshot::Receiver<i32>,
    /// Dropping this stops the process
    pub guard: ProcessGuard,
}

/// Backend side of a [`SandboxProcess`]
#[derive(Debug)]
pub struct ProcessIo {
    /// Sender for output lines; the stream ends when all clones are dropped
    pub output: mpsc::Sender<String>,
    /// Sender for the exit code
    pub exit: oneshot::Sender<i32>,
    /// Resolves when the guard is dropped
    pub kill: oneshot::Receiver<()>,
}

impl SandboxProcess {
    /// Create the two halves of a process. `buffer` bounds the number of
    /// output lines held before the backend waits for the consumer.
    pub fn channel(label: impl Into<String>, buffer: usize) -> (ProcessIo, SandboxProcess) {
        let (output_tx, output_rx) = mpsc::channel(buffer.max(1));
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let io = ProcessIo {
            output: output_tx,
            exit: exit_tx,
            kill: kill_rx,
        };
        let process = SandboxProcess {
            output: output_rx,
            exit: exit_rx,
            guard: ProcessGuard {
                label: label.into(),
                kill: Some(kill_tx),
            },
        };
        (io, process)
    }
}

/// Error for a process that ended without reporting its exit code
pub(crate) fn lost_exit(stage: Stage, label: &str) -> Error {
    Error::Spawn {
        stage,
        message: format!("{} ended without reporting an exit code", label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_argv() {
        let argv = vec!["npm".to_string(), "install".to_string()];
        let cmd = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args, vec!["install"]);
        assert_eq!(cmd.to_string(), "npm install");

        assert!(!cmd.serves);
        assert!(cmd.serving().serves);

        assert!(CommandSpec::from_argv(&[]).is_err());
        assert!(CommandSpec::from_argv(&[" ".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_dropping_guard_signals_kill() {
        let (io, process) = SandboxProcess::channel("npm start", 4);
        drop(process.guard);
        assert!(io.kill.await.is_ok());
    }

    #[tokio::test]
    async fn test_output_stream_ends_with_senders() {
        let (io, mut process) = SandboxProcess::channel("npm install", 4);
        io.output.send("added 1 package".to_string()).await.unwrap();
        io.exit.send(0).unwrap();
        drop(io.output);

        assert_eq!(process.output.recv().await.as_deref(), Some("added 1 package"));
        assert!(process.output.recv().await.is_none());
        assert_eq!((&mut process.exit).await.unwrap(), 0);
    }
}
