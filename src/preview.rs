//! Preview orchestrator
//!
//! [`Previewer`] is the caller-facing entry point. A request lays out the
//! generated files, acquires the shared sandbox, runs the install/serve
//! pipeline and publishes the session as it moves through its phases.
//!
//! A newer request supersedes an older one: the older run is aborted, its
//! session updates are dropped, and runs take turns on the sandbox so their
//! mounts never interleave.

use futures::future::{AbortHandle, Abortable};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info};

use crate::classify::classify;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::{create_booter, ProcessGuard, RuntimeBooter, RuntimeManager};
use crate::session::{PipelineStep, PreviewSession, SessionTracker};
use crate::supervisor::{LogLine, ProcessSupervisor};
use crate::vfs::{build_with, BuildOptions, GeneratedFileSet};

/// Runs previews against one shared sandbox
pub struct Previewer {
    manager: Arc<RuntimeManager>,
    supervisor: ProcessSupervisor,
    build_options: BuildOptions,
    tracker: SessionTracker,
    next_run: AtomicU64,
    /// Serializes access to the sandbox between runs
    run_lock: Mutex<()>,
    inflight: Mutex<Option<AbortHandle>>,
    /// Server of the latest successful run
    server: Mutex<Option<ProcessGuard>>,
}

impl Previewer {
    pub fn new(
        manager: Arc<RuntimeManager>,
        supervisor: ProcessSupervisor,
        build_options: BuildOptions,
    ) -> Self {
        Previewer {
            manager,
            supervisor,
            build_options,
            tracker: SessionTracker::new(),
            next_run: AtomicU64::new(1),
            run_lock: Mutex::new(()),
            inflight: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Build a previewer for the configured backend
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_booter(config, create_booter(config))
    }

    /// Build a previewer that boots sandboxes with `booter`
    pub fn with_booter(config: &Config, booter: Arc<dyn RuntimeBooter>) -> Result<Self> {
        let (logs, _) = broadcast::channel(config.pipeline.log_buffer.max(1));
        let supervisor = ProcessSupervisor::from_config(config, logs)?;
        Ok(Previewer::new(
            Arc::new(RuntimeManager::new(booter)),
            supervisor,
            config.build_options(),
        ))
    }

    /// Shared sandbox manager
    pub fn manager(&self) -> &Arc<RuntimeManager> {
        &self.manager
    }

    /// Current session snapshot
    pub fn session(&self) -> PreviewSession {
        self.tracker.current()
    }

    /// Subscribe to session snapshots
    pub fn subscribe(&self) -> watch::Receiver<PreviewSession> {
        self.tracker.subscribe()
    }

    /// Subscribe to install and serve output
    pub fn logs(&self) -> broadcast::Receiver<LogLine> {
        self.supervisor.logs()
    }

    /// Run a preview of `files` and return the session it ended in.
    ///
    /// Failures are classified into the returned session rather than
    /// returned as errors. If a newer request supersedes this one while it
    /// runs, the newer request's current session is returned instead.
    pub async fn start_preview(&self, files: &GeneratedFileSet) -> PreviewSession {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst);
        self.tracker.begin(run_id);
        info!(run_id, files = files.len(), "Preview requested");

        let (abort, registration) = AbortHandle::new_pair();
        if let Some(previous) = self.inflight.lock().await.replace(abort) {
            debug!(run_id, "Superseding previous preview run");
            previous.abort();
        }

        let outcome = Abortable::new(self.run(run_id, files), registration).await;
        match outcome {
            Ok(Ok(url)) => {
                self.tracker.update(run_id, |s| s.mark_ready(url));
            }
            Ok(Err(e)) => {
                let classified = classify(&e);
                error!(run_id, category = %classified.category, "Preview failed: {}", e);
                self.tracker.update(run_id, |s| s.mark_failed(classified));
            }
            Err(_aborted) => debug!(run_id, "Preview run superseded"),
        }

        self.tracker
            .snapshot(run_id)
            .unwrap_or_else(|| self.tracker.current())
    }

    async fn run(&self, run_id: u64, files: &GeneratedFileSet) -> Result<String> {
        if files.completed().next().is_none() {
            return Err(Error::InvalidInput("No completed files to preview".to_string()));
        }
        let tree = build_with(files, &self.build_options);

        let _turn = self.run_lock.lock().await;
        // The previous server holds the port the new one needs.
        if let Some(server) = self.server.lock().await.take() {
            debug!(run_id, "Stopping previous server: {}", server.label());
        }

        let progress = |step: PipelineStep| {
            debug!(run_id, "Preview step: {}", step);
            self.tracker.update(run_id, |s| s.advance(step));
        };

        progress(PipelineStep::Booting);
        let runtime = self.manager.acquire().await?;
        let running = self.supervisor.run(&runtime, &tree, progress).await?;

        let url = running.ready.url.clone();
        *self.server.lock().await = Some(running.server);
        Ok(url)
    }

    /// Stop the preview server and tear down the sandbox
    pub async fn shutdown(&self) {
        if let Some(inflight) = self.inflight.lock().await.take() {
            inflight.abort();
        }
        self.server.lock().await.take();
        self.manager.release().await;
    }
}
