//! Local sandbox backend
//!
//! Runs previews in a private workspace directory on the host. Commands are
//! resolved on `PATH` and started as child processes with the workspace as
//! their working directory. Each child leads its own process group, so
//! stopping it also stops everything it started. Readiness of the server is
//! detected by probing the preview port.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::probe::ReadyProbe;
use super::process::{CommandSpec, ProcessIo, SandboxProcess};
use super::{RuntimeBooter, SandboxRuntime, ServerReady};
use crate::config::Config;
use crate::error::{Error, Result, Stage};
use crate::vfs::MountNode;

const WORKSPACE_PREFIX: &str = "sandpreview-";
/// How long a previous server gets to let go of the preview port
const PORT_RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Boots [`LocalRuntime`] instances
pub struct LocalBooter {
    workspace_root: Option<PathBuf>,
    programs: Vec<String>,
    port: u16,
    probe_interval: Duration,
    output_buffer: usize,
}

impl LocalBooter {
    /// Create a booter from configuration
    pub fn new(config: &Config) -> Self {
        let pipeline = &config.pipeline;
        let programs = [&pipeline.install_command, &pipeline.start_command]
            .iter()
            .filter_map(|argv| argv.first().cloned())
            .collect();

        LocalBooter {
            workspace_root: config.runtime.workspace_root.clone(),
            programs,
            port: pipeline.port,
            probe_interval: pipeline.probe_interval,
            output_buffer: pipeline.output_buffer,
        }
    }

    fn create_workspace(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);

        let created = match &self.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    Error::Boot(format!("Cannot create workspace root {}: {}", root.display(), e))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };

        created.map_err(|e| Error::Boot(format!("Cannot create workspace: {}", e)))
    }
}

#[async_trait]
impl RuntimeBooter for LocalBooter {
    fn name(&self) -> &str {
        "local"
    }

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>> {
        for program in &self.programs {
            which::which(program)
                .map_err(|e| Error::Boot(format!("`{}` is not available: {}", program, e)))?;
        }

        let workspace = self.create_workspace()?;
        info!("Local sandbox workspace: {}", workspace.path().display());

        let (ready_tx, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(LocalRuntime {
            project_dir: workspace.path().to_path_buf(),
            workspace: Mutex::new(Some(workspace)),
            port: self.port,
            probe_interval: self.probe_interval,
            output_buffer: self.output_buffer,
            ready_tx,
            shutdown,
            groups: ProcessGroups::default(),
        }))
    }
}

/// A sandbox backed by a private host directory
pub struct LocalRuntime {
    project_dir: PathBuf,
    workspace: Mutex<Option<TempDir>>,
    port: u16,
    probe_interval: Duration,
    output_buffer: usize,
    ready_tx: broadcast::Sender<ServerReady>,
    shutdown: watch::Sender<bool>,
    groups: ProcessGroups,
}

impl LocalRuntime {
    /// Project directory commands run in
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    async fn ensure_alive(&self) -> Result<()> {
        if self.workspace.lock().await.is_none() {
            return Err(Error::Internal("Local sandbox has been torn down".to_string()));
        }
        Ok(())
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    fn probe(&self) -> ReadyProbe {
        ReadyProbe {
            ready: ServerReady {
                port: self.port,
                url: format!("http://localhost:{}", self.port),
            },
            interval: self.probe_interval,
            signal: self.ready_tx.clone(),
        }
    }

    /// Fail if something other than the new server holds the preview port,
    /// since it would be reported as ready
    async fn ensure_port_free(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + PORT_RELEASE_GRACE;
        while TcpStream::connect(self.addr()).await.is_ok() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Spawn {
                    stage: Stage::Serve,
                    message: format!("Port {} is already in use", self.port),
                });
            }
            tokio::time::sleep(self.probe_interval).await;
        }
        Ok(())
    }
}

/// Create `dir`, replacing a file that sits where it should be
async fn prepare_dir(dir: &Path) -> std::io::Result<()> {
    if let Ok(meta) = tokio::fs::symlink_metadata(dir).await {
        if meta.is_dir() {
            return Ok(());
        }
        tokio::fs::remove_file(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await
}

/// Write `contents` to `file`, replacing a directory that sits where it should be
async fn write_file(file: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Ok(meta) = tokio::fs::symlink_metadata(file).await {
        if meta.is_dir() {
            tokio::fs::remove_dir_all(file).await?;
        }
    }
    tokio::fs::write(file, contents).await
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    async fn mount(&self, root: &MountNode) -> Result<()> {
        self.ensure_alive().await?;

        // Parents come before children, so each level is settled before the next.
        for dir in root.directories() {
            let target = self.project_dir.join(&dir);
            prepare_dir(&target)
                .await
                .map_err(|e| Error::Mount(format!("{}: {}", dir, e)))?;
        }

        let files = root.files();
        for (path, contents) in &files {
            let target = self.project_dir.join(path);
            write_file(&target, contents)
                .await
                .map_err(|e| Error::Mount(format!("{}: {}", path, e)))?;
        }

        debug!("Mounted {} files into {}", files.len(), self.project_dir.display());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess> {
        self.ensure_alive().await?;
        if command.serves {
            self.ensure_port_free().await?;
        }

        let program = which::which(&command.program).map_err(|e| Error::Spawn {
            stage: Stage::Other,
            message: format!("`{}` is not available: {}", command.program, e),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .current_dir(&self.project_dir)
            .env("PORT", self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            stage: Stage::Other,
            message: format!("{}: {}", command, e),
        })?;

        let group = child.id();
        if let Some(pgid) = group {
            self.groups.track(pgid);
        }
        debug!("Spawned `{}` (pid {:?})", command, group);

        let label = command.to_string();
        let (io, process) = SandboxProcess::channel(label.clone(), self.output_buffer);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, io.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, io.output.clone()));
        }

        let supervision = Supervision {
            label,
            group,
            groups: self.groups.clone(),
            readiness: command.serves.then(|| (self.probe(), self.addr())),
        };
        tokio::spawn(supervise(child, io, self.shutdown.subscribe(), supervision));

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.groups.kill_all();

        let workspace = self.workspace.lock().await.take();
        if let Some(dir) = workspace {
            let path = dir.path().display().to_string();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| Error::Internal(format!("Workspace cleanup panicked: {}", e)))??;
            info!("Removed local sandbox workspace {}", path);
        }
        Ok(())
    }
}

/// Process groups of running children, by group id
#[derive(Debug, Clone, Default)]
struct ProcessGroups(Arc<std::sync::Mutex<HashSet<u32>>>);

impl ProcessGroups {
    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, pgid: u32) {
        self.lock().insert(pgid);
    }

    /// Kill a group and forget it
    fn kill(&self, pgid: u32) {
        self.lock().remove(&pgid);
        kill_group(pgid);
    }

    fn kill_all(&self) {
        let groups: Vec<u32> = self.lock().drain().collect();
        for pgid in groups {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; an unknown group yields ESRCH.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Relay lines from a pipe, in order, until it closes
async fn forward_lines<R>(pipe: R, output: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut relaying = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !relaying {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                // Keep draining after the consumer leaves so the child never blocks on a full pipe.
                if output.send(line).await.is_err() {
                    relaying = false;
                }
            }
            Err(e) => {
                warn!("Error reading process output: {}", e);
                break;
            }
        }
    }
}

/// What `supervise` tracks besides the child
struct Supervision {
    label: String,
    group: Option<u32>,
    groups: ProcessGroups,
    /// Set for the preview server only
    readiness: Option<(ReadyProbe, SocketAddr)>,
}

/// Wait for the child to exit, stopping it on kill or shutdown, and report
/// readiness while it runs. Whatever is left of its process group is killed
/// once it is gone.
async fn supervise(
    mut child: Child,
    io: ProcessIo,
    mut shutdown: watch::Receiver<bool>,
    supervision: Supervision,
) {
    let ProcessIo {
        output,
        exit,
        mut kill,
    } = io;
    // The forwarders hold their own senders; the stream ends when the pipes close.
    drop(output);
    let Supervision {
        label,
        group,
        groups,
        readiness,
    } = supervision;
    let mut announced = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut kill => {
                debug!("Stopping `{}`", label);
                break stop(&mut child, group).await;
            }
            _ = shutdown.changed() => {
                debug!("Sandbox shutting down, stopping `{}`", label);
                break stop(&mut child, group).await;
            }
            _ = listening(readiness.as_ref()), if !announced => {
                announced = true;
                if let Some((probe, _)) = &readiness {
                    probe.announce();
                }
            }
        }
    };

    if let Some(pgid) = group {
        groups.kill(pgid);
    }

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!("Lost track of `{}`: {}", label, e);
            -1
        }
    };
    debug!("`{}` exited with code {}", label, code);
    let _ = exit.send(code);
}

/// Resolve once the server accepts connections; never for other commands
async fn listening(readiness: Option<&(ReadyProbe, SocketAddr)>) {
    match readiness {
        Some((probe, addr)) => probe.wait_for_listener(*addr).await,
        None => std::future::pending::<()>().await,
    }
}

async fn stop(child: &mut Child, group: Option<u32>) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pgid) = group {
        kill_group(pgid);
    }
    if let Err(e) = child.start_kill() {
        debug!("Kill failed, process may have exited already: {}", e);
    }
    child.wait().await
}
