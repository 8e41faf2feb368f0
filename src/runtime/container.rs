//! Docker sandbox backend
//!
//! Boots one long-lived container per sandbox and drives it with `docker exec`.
//! The mount tree is uploaded as a single tar archive. The preview port is
//! published on a random loopback port of the host; readiness is checked from
//! inside the container, since the published port accepts connections as soon
//! as the container starts.

use async_trait::async_trait;
use bollard::container::{
    Config as DockerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::probe::ReadyProbe;
use super::process::{CommandSpec, ProcessIo, SandboxProcess};
use super::{RuntimeBooter, SandboxRuntime, ServerReady};
use crate::config::{Config, ContainerConfig};
use crate::error::{Error, Result, Stage};
use crate::vfs::MountNode;

/// Prints the shell's pid, then replaces the shell with the command
const PID_WRAPPER: &str = "echo $$; exec \"$@\"";
/// Sends SIGTERM to `$1` and all of its descendants, children first
const TREE_KILL: &str =
    "k() { for c in $(pgrep -P \"$1\"); do k \"$c\"; done; kill -TERM \"$1\" 2>/dev/null; }; k \"$1\"";
/// Succeeds once something inside the container accepts connections on `$1`
const PORT_CHECK: &str = "nc -z 127.0.0.1 \"$1\" 2>/dev/null || wget -q -T 2 -O /dev/null \"http://127.0.0.1:$1/\"";

/// Boots [`ContainerRuntime`] instances
pub struct ContainerBooter {
    config: ContainerConfig,
    port: u16,
    probe_interval: Duration,
    output_buffer: usize,
}

impl ContainerBooter {
    /// Create a booter from configuration
    pub fn new(config: &Config) -> Self {
        ContainerBooter {
            config: config.runtime.container.clone(),
            port: config.pipeline.port,
            probe_interval: config.pipeline.probe_interval,
            output_buffer: config.pipeline.output_buffer,
        }
    }

    async fn connect(&self) -> Result<Docker> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Boot(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Boot(format!("Docker ping failed: {}", e)))?;

        Ok(docker)
    }

    /// Pull the image unless it is present locally
    async fn ensure_image(&self, docker: &Docker) -> Result<()> {
        let images = docker.list_images::<String>(None).await?;
        let image = &self.config.image;
        if images
            .iter()
            .any(|img| img.repo_tags.iter().any(|tag| tag == image))
        {
            return Ok(());
        }

        info!("Pulling Docker image: {}", image);
        let options = CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress =
                result.map_err(|e| Error::Boot(format!("Failed to pull {}: {}", image, e)))?;
            if let Some(status) = progress.status {
                debug!("Pull status: {}", status);
            }
        }
        info!("Image pulled successfully");
        Ok(())
    }

    fn container_config(&self) -> DockerConfig<String> {
        let port_key = format!("{}/tcp", self.port);

        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", self.port));
        env.sort();

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(Ipv4Addr::LOCALHOST.to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        DockerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
            working_dir: Some(self.config.workdir.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                memory: parse_memory_limit(&self.config.memory_limit),
                nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
                network_mode: Some(self.config.network.clone()),
                port_bindings: Some(port_bindings),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Host port the preview port was published on
    async fn published_port(&self, docker: &Docker, name: &str) -> Result<u16> {
        let inspect = docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let key = format!("{}/tcp", self.port);

        inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| Error::Boot(format!("Port {} was not published", self.port)))
    }
}

#[async_trait]
impl RuntimeBooter for ContainerBooter {
    fn name(&self) -> &str {
        "container"
    }

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>> {
        let docker = self.connect().await?;
        self.ensure_image(&docker).await?;

        let name = format!("sandpreview-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        docker
            .create_container(Some(options), self.container_config())
            .await
            .map_err(|e| Error::Boot(format!("Failed to create container: {}", e)))?;

        let started = docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await;
        let host_port = match started {
            Ok(()) => self.published_port(&docker, &name).await,
            Err(e) => Err(Error::Boot(format!("Failed to start container: {}", e))),
        };
        let host_port = match host_port {
            Ok(port) => port,
            Err(e) => {
                remove_container(&docker, &name).await;
                return Err(e);
            }
        };

        info!(
            "Container sandbox {} up, port {} published on {}",
            name, self.port, host_port
        );

        let (ready_tx, _) = broadcast::channel(16);
        Ok(Arc::new(ContainerRuntime {
            docker,
            name,
            workdir: self.config.workdir.clone(),
            port: self.port,
            host_port,
            probe_interval: self.probe_interval,
            output_buffer: self.output_buffer,
            ready_tx,
        }))
    }
}

/// A sandbox backed by one Docker container
pub struct ContainerRuntime {
    docker: Docker,
    name: String,
    workdir: String,
    port: u16,
    host_port: u16,
    probe_interval: Duration,
    output_buffer: usize,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl ContainerRuntime {
    /// Container name
    pub fn container_name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> ReadyProbe {
        ReadyProbe {
            ready: ServerReady {
                port: self.port,
                url: format!("http://localhost:{}", self.host_port),
            },
            interval: self.probe_interval,
            signal: self.ready_tx.clone(),
        }
    }
}

/// Run a short command in `container` to completion and return its exit code
async fn exec_status(docker: &Docker, container: &str, cmd: Vec<String>) -> Result<i64> {
    let options = CreateExecOptions {
        cmd: Some(cmd),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };
    let exec = docker.create_exec(container, options).await?;
    let started = docker.start_exec(&exec.id, None::<StartExecOptions>).await?;

    let StartExecResults::Attached { mut output, .. } = started else {
        return Err(Error::Container("Exec started detached".to_string()));
    };

    while let Some(chunk) = output.next().await {
        chunk?;
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    Ok(finished_code(inspect.exit_code))
}

/// Exit code of a finished exec; an exec with no code never finished cleanly
fn finished_code(exit_code: Option<i64>) -> i64 {
    exit_code.unwrap_or(-1)
}

/// Pack the mount tree into a tar archive, directories first
fn tar_tree(root: &MountNode) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    for dir in root.directories() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        archive.append_data(&mut header, format!("{}/", dir), std::io::empty())?;
    }

    for (path, contents) in root.files() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        archive.append_data(&mut header, &path, contents)?;
    }

    archive.into_inner()
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into(), "sh".into()]
}

#[async_trait]
impl SandboxRuntime for ContainerRuntime {
    fn name(&self) -> &str {
        "container"
    }

    async fn mount(&self, root: &MountNode) -> Result<()> {
        let archive = tar_tree(root).map_err(|e| Error::Mount(format!("Cannot pack files: {}", e)))?;
        let size = archive.len();

        // Docker replaces a file with a directory (and the reverse) while unpacking.
        let options = UploadToContainerOptions {
            path: self.workdir.clone(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.name, Some(options), archive.into())
            .await
            .map_err(|e| Error::Mount(format!("Upload to {} failed: {}", self.name, e)))?;

        debug!("Mounted {} bytes into {}:{}", size, self.name, self.workdir);
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess> {
        let spawn_error = |e: Error| Error::Spawn {
            stage: Stage::Other,
            message: format!("{}: {}", command, e),
        };

        let mut cmd = sh(PID_WRAPPER);
        cmd.extend(command.argv());
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(self.workdir.clone()),
            ..Default::default()
        };
        let id = self
            .docker
            .create_exec(&self.name, options)
            .await
            .map_err(|e| spawn_error(e.into()))?
            .id;
        let started = self
            .docker
            .start_exec(&id, None::<StartExecOptions>)
            .await
            .map_err(|e| spawn_error(e.into()))?;

        let StartExecResults::Attached { output, .. } = started else {
            return Err(spawn_error(Error::Container("exec started detached".into())));
        };

        let label = command.to_string();
        debug!("Spawned `{}` in {}", label, self.name);
        let (io, process) = SandboxProcess::channel(label.clone(), self.output_buffer);

        let exec = ExecRelay {
            docker: self.docker.clone(),
            container: self.name.clone(),
            id,
            label,
            probe: command.serves.then(|| self.probe()),
        };
        tokio::spawn(exec.run(output, io));

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&self.name, Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to remove container: {}", e)))?;
        info!("Removed container: {}", self.name);
        Ok(())
    }
}

type ExecOutput = std::pin::Pin<
    Box<dyn futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>,
>;

/// Relays one exec's output and reports its exit code
struct ExecRelay {
    docker: Docker,
    container: String,
    id: String,
    label: String,
    /// Set for the preview server only
    probe: Option<ReadyProbe>,
}

impl ExecRelay {
    async fn run(self, mut output: ExecOutput, io: ProcessIo) {
        let ProcessIo {
            output: lines,
            exit,
            kill,
        } = io;
        let mut kill = Some(kill);
        let mut splitter = LineSplitter::default();
        let mut pid: Option<String> = None;
        let mut relaying = true;
        let mut announced = false;

        loop {
            tokio::select! {
                chunk = output.next() => {
                    let Some(chunk) = chunk else { break };
                    let bytes = match chunk {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::StdErr { message })
                        | Ok(LogOutput::Console { message }) => message,
                        Ok(LogOutput::StdIn { .. }) => continue,
                        Err(e) => {
                            warn!("Error reading output of `{}`: {}", self.label, e);
                            break;
                        }
                    };
                    for line in splitter.push(&bytes) {
                        if pid.is_none() {
                            pid = Some(line);
                            continue;
                        }
                        if relaying && lines.send(line).await.is_err() {
                            relaying = false;
                        }
                    }
                }
                _ = wait_kill(&mut kill) => {
                    kill = None;
                    relaying = false;
                    match &pid {
                        Some(pid) => self.signal(pid).await,
                        None => debug!("`{}` stopped before reporting a pid", self.label),
                    }
                }
                _ = self.listening(), if !announced => {
                    announced = true;
                    if let Some(probe) = &self.probe {
                        probe.announce();
                    }
                }
            }
        }

        if relaying {
            if let Some(rest) = splitter.finish() {
                let _ = lines.send(rest).await;
            }
        }
        drop(lines);

        let code = match self.docker.inspect_exec(&self.id).await {
            Ok(inspect) => finished_code(inspect.exit_code) as i32,
            Err(e) => {
                warn!("Failed to inspect `{}`: {}", self.label, e);
                -1
            }
        };
        debug!("`{}` exited with code {}", self.label, code);
        let _ = exit.send(code);
    }

    /// Resolve once the server listens inside the container; never for
    /// other commands
    async fn listening(&self) {
        let Some(probe) = &self.probe else {
            return std::future::pending().await;
        };
        loop {
            let mut cmd = sh(PORT_CHECK);
            cmd.push(probe.ready.port.to_string());
            match exec_status(&self.docker, &self.container, cmd).await {
                Ok(0) => return,
                Ok(_) => debug!("Port {} not accepting yet in {}", probe.ready.port, self.container),
                Err(e) => debug!("Readiness check in {} failed: {}", self.container, e),
            }
            tokio::time::sleep(probe.interval).await;
        }
    }

    /// Send SIGTERM to the exec'd process and its descendants
    async fn signal(&self, pid: &str) {
        debug!("Stopping `{}` (pid {})", self.label, pid);
        let mut cmd = sh(TREE_KILL);
        cmd.push(pid.to_string());
        let options = CreateExecOptions {
            cmd: Some(cmd),
            ..Default::default()
        };
        let result = async {
            let exec = self.docker.create_exec(&self.container, options).await?;
            self.docker
                .start_exec(&exec.id, Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }))
                .await?;
            Ok::<_, bollard::errors::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to stop `{}`: {}", self.label, e);
        }
    }
}

/// Resolves once the kill signal fires; pending forever after it has
async fn wait_kill(kill: &mut Option<oneshot::Receiver<()>>) {
    match kill.as_mut() {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Reassembles lines from arbitrarily split output chunks
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            );
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(rest)
    }
}

async fn remove_container(docker: &Docker, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(name, Some(options)).await {
        warn!("Failed to remove container {}: {}", name, e);
    }
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let digits = limit.trim_end_matches('b');
    let (number, multiplier) = match digits.chars().last()? {
        'g' => (&digits[..digits.len() - 1], 1024 * 1024 * 1024),
        'm' => (&digits[..digits.len() - 1], 1024 * 1024),
        'k' => (&digits[..digits.len() - 1], 1024),
        _ => (digits, 1),
    };
    number.parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{build, GeneratedFile, GeneratedFileSet};

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("lots"), None);
        assert_eq!(parse_memory_limit(""), None);
    }

    #[test]
    fn test_line_splitter_joins_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"12").is_empty());
        assert_eq!(splitter.push(b"3\nready on "), vec!["123"]);
        assert_eq!(splitter.push(b"3000\r\nlast"), vec!["ready on 3000"]);
        assert_eq!(splitter.finish().as_deref(), Some("last"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_unfinished_exec_is_a_failure() {
        assert_eq!(finished_code(Some(0)), 0);
        assert_eq!(finished_code(Some(2)), 2);
        assert_eq!(finished_code(None), -1);
    }

    #[test]
    fn test_tar_tree_layout() {
        let files = GeneratedFileSet::new()
            .with_file(GeneratedFile::completed("index.html", "<h1>hi</h1>"))
            .with_file(GeneratedFile::completed("app.jsx", "export default 1;"));
        let archive = tar_tree(&build(&files)).unwrap();

        let mut entries = Vec::new();
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
            entries.push((path, entry.header().entry_type().is_dir(), contents));
        }

        let dirs: Vec<_> = entries.iter().filter(|e| e.1).map(|e| e.0.as_str()).collect();
        assert_eq!(dirs, vec!["public", "src"]);
        assert!(entries
            .iter()
            .any(|(path, _, contents)| path == "src/app.js" && contents == "export default 1;"));
        assert!(entries
            .iter()
            .any(|(path, _, contents)| path == "public/index.html" && contents == "<h1>hi</h1>"));
    }

    #[test]
    fn test_container_config_publishes_port() {
        let mut config = Config::default();
        config.pipeline.port = 4173;
        let booter = ContainerBooter::new(&config);
        let docker_config = booter.container_config();

        let bindings = docker_config
            .host_config
            .and_then(|h| h.port_bindings)
            .unwrap();
        assert!(bindings.contains_key("4173/tcp"));
        assert!(docker_config.env.unwrap().contains(&"PORT=4173".to_string()));
    }
}
