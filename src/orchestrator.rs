//! App lifecycle orchestration
//!
//! Ties the registry, port allocator and process supervisor together. Every
//! mutating request bumps the app's generation counter; the background
//! provisioning pipeline captures the generation it was spawned for and
//! re-validates it at every commit point, so a newer edit/stop/delete wins
//! without waiting for a slow install to notice. Pipelines for one app are
//! serialized through a per-app async mutex; requests themselves never
//! queue behind it.

use crate::error::HostError;
use crate::logs::tail_lines;
use crate::ports::PortAllocator;
use crate::registry::{sha256_hex, AppRecord, AppRegistry, AppStatus};
use crate::supervisor::{ExitEvent, ProcessSupervisor};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    registry: Arc<AppRegistry>,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    /// Serializes background pipelines per app; never held across requests
    pipeline_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AppRegistry>,
        allocator: Arc<PortAllocator>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            allocator,
            supervisor,
            pipeline_locks: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Consume supervisor exit events for the lifetime of the process
    pub fn spawn_exit_loop(self: &Arc<Self>, mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                this.handle_exit(event).await;
            }
        });
    }

    /// Register a new app from uploaded content and begin provisioning it
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        code: &[u8],
        manifest: &[u8],
    ) -> Result<AppRecord, HostError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HostError::Validation("app name must not be empty".into()));
        }
        if code.is_empty() {
            return Err(HostError::Validation("code upload must not be empty".into()));
        }
        let record = self.registry.create(name, code, manifest)?;
        info!(app_id = %record.app_id, name, "App created");
        self.spawn_pipeline(record.app_id.clone(), record.generation);
        Ok(record)
    }

    /// Start (provision and launch) an idle app.
    ///
    /// Starting a running app is a no-op; starting an app that is already
    /// in motion is a conflict.
    pub fn start(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, HostError> {
        let record = self.registry.get(app_id)?;
        match record.status {
            AppStatus::Running { .. } => Ok(record),
            AppStatus::Installing | AppStatus::Starting { .. } | AppStatus::Stopping { .. } => {
                Err(HostError::Conflict(app_id.to_string()))
            }
            AppStatus::Created | AppStatus::Stopped | AppStatus::Failed { .. } => {
                let updated = self.registry.update(app_id, |r| {
                    if !r.status.is_idle() {
                        return Err(HostError::Conflict(r.app_id.clone()));
                    }
                    r.generation += 1;
                    Ok(())
                })?;
                info!(app_id, generation = updated.generation, "Start requested");
                self.spawn_pipeline(app_id.to_string(), updated.generation);
                Ok(updated)
            }
        }
    }

    /// Stop a running (or starting) app: SIGTERM, grace period, SIGKILL,
    /// port released. Stopping an idle app is a no-op.
    pub async fn stop(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, HostError> {
        let record = self.registry.get(app_id)?;
        match record.status {
            AppStatus::Created | AppStatus::Stopped | AppStatus::Failed { .. } => {
                return Ok(record)
            }
            AppStatus::Installing | AppStatus::Stopping { .. } => {
                return Err(HostError::Conflict(app_id.to_string()))
            }
            AppStatus::Running { .. } | AppStatus::Starting { .. } => {}
        }

        // Bumping the generation invalidates any pipeline for this app
        let updated = self.registry.update(app_id, |r| {
            let (port, pid) = match r.status {
                AppStatus::Running { port, pid } => (port, Some(pid)),
                AppStatus::Starting { port } => (port, None),
                _ => return Err(HostError::Conflict(r.app_id.clone())),
            };
            r.generation += 1;
            r.status = AppStatus::Stopping { port, pid };
            Ok(())
        })?;
        let generation = updated.generation;

        let log = self.supervisor.log(app_id, &updated.log_path)?;
        let _ = log.append("stopping app");
        self.supervisor
            .terminate(app_id, updated.status.pid(), self.supervisor.runtime().grace_period())
            .await;
        // With no committed pid the launch is still in flight; its pipeline
        // owns the lease and releases the port only after killing the
        // process, so the port cannot be handed out while it may still bind
        if updated.status.pid().is_some() {
            self.allocator.release(app_id);
        }

        let stopped = self.guarded_update(app_id, generation, |r| {
            r.status = AppStatus::Stopped;
            Ok(())
        })?;
        let _ = log.append("app stopped");
        info!(app_id, "App stopped");
        Ok(stopped)
    }

    /// Replace uploaded content and/or rename the app.
    ///
    /// When the code or manifest actually changed, the app re-provisions
    /// no matter what state it was in: any old process is torn down and a
    /// fresh pipeline re-runs install and launch against the new content.
    /// Name-only edits never restart anything.
    pub async fn edit(
        self: &Arc<Self>,
        app_id: &str,
        name: Option<&str>,
        code: Option<&[u8]>,
        manifest: Option<&[u8]>,
    ) -> Result<AppRecord, HostError> {
        let record = self.registry.get(app_id)?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(HostError::Validation("app name must not be empty".into()));
            }
        }
        if let Some(code) = code {
            if code.is_empty() {
                return Err(HostError::Validation("code upload must not be empty".into()));
            }
        }

        let mut content_changed = false;
        if let Some(code) = code {
            if sha256_hex(code) != record.code_sha256 {
                std::fs::write(&record.code_path, code)?;
                content_changed = true;
            }
        }
        if let Some(manifest) = manifest {
            if sha256_hex(manifest) != record.manifest_sha256 {
                std::fs::write(&record.manifest_path, manifest)?;
                content_changed = true;
            }
        }

        let previous = record.status.clone();
        let updated = self.registry.update(app_id, |r| {
            r.generation += 1;
            if let Some(name) = name {
                r.name = name.trim().to_string();
            }
            if let Some(code) = code {
                r.code_sha256 = sha256_hex(code);
            }
            if let Some(manifest) = manifest {
                r.manifest_sha256 = sha256_hex(manifest);
            }
            Ok(())
        })?;
        info!(app_id, content_changed, generation = updated.generation, "App edited");

        if content_changed {
            if let AppStatus::Running { .. } | AppStatus::Starting { .. } = previous {
                self.supervisor
                    .terminate(app_id, previous.pid(), self.supervisor.runtime().grace_period())
                    .await;
                // With no committed pid the superseded pipeline still owns
                // the lease and releases the port after killing its process
                if previous.pid().is_some() {
                    self.allocator.release(app_id);
                }
            }
            // New content always re-provisions; a pipeline already in
            // flight aborts at its next commit point and the replacement
            // queues behind it on the per-app lock
            self.spawn_pipeline(app_id.to_string(), updated.generation);
        }
        self.registry.get(app_id)
    }

    /// Tear an app down completely: process, port, registry record, files
    pub async fn delete(self: &Arc<Self>, app_id: &str) -> Result<(), HostError> {
        let record = self.registry.get(app_id)?;
        // Invalidate any in-flight pipeline before tearing down
        let _ = self.registry.update(app_id, |r| {
            r.generation += 1;
            Ok(())
        });
        self.supervisor
            .terminate(app_id, record.status.pid(), self.supervisor.runtime().grace_period())
            .await;
        // An uncommitted launch keeps its lease; the superseded pipeline
        // releases the port after killing the process it spawned
        if record.status.pid().is_some() {
            self.allocator.release(app_id);
        }
        self.registry.remove(app_id)?;
        self.supervisor.forget(app_id);
        self.pipeline_locks.remove(app_id);
        info!(app_id, "App deleted");
        Ok(())
    }

    /// Last `tail` lines of the app's cumulative log
    pub fn logs(&self, app_id: &str, tail: usize) -> Result<Vec<String>, HostError> {
        let record = self.registry.get(app_id)?;
        Ok(tail_lines(&record.log_path, tail)?)
    }

    /// Reconcile persisted state with reality after a restart.
    ///
    /// Running apps whose pid survived are re-adopted with their port
    /// binding restored; everything that was mid-transition is normalized
    /// to a stable state.
    pub async fn recover(self: &Arc<Self>) -> Result<(), HostError> {
        for record in self.registry.list() {
            let app_id = record.app_id.clone();
            match record.status.clone() {
                AppStatus::Running { port, pid } => {
                    if self.supervisor.pid_alive(pid) {
                        match self.allocator.restore(&app_id, port) {
                            Ok(()) => {
                                info!(app_id, port, pid, "Re-adopted running app");
                                self.supervisor.adopt(&app_id, pid);
                            }
                            Err(e) => {
                                warn!(app_id, port, error = %e, "Port binding lost, stopping survivor");
                                self.supervisor
                                    .terminate(&app_id, Some(pid), self.supervisor.runtime().grace_period())
                                    .await;
                                self.fail_on_recovery(
                                    &app_id,
                                    "port binding could not be restored after restart",
                                )?;
                            }
                        }
                    } else {
                        warn!(app_id, pid, "Process did not survive restart");
                        self.fail_on_recovery(&app_id, "process no longer alive after restart")?;
                    }
                }
                AppStatus::Installing | AppStatus::Starting { .. } => {
                    self.fail_on_recovery(&app_id, "interrupted by orchestrator restart")?;
                }
                AppStatus::Stopping { pid, .. } => {
                    if let Some(pid) = pid {
                        if self.supervisor.pid_alive(pid) {
                            self.supervisor
                                .terminate(&app_id, Some(pid), self.supervisor.runtime().grace_period())
                                .await;
                        }
                    }
                    self.registry.update(&app_id, |r| {
                        r.generation += 1;
                        r.status = AppStatus::Stopped;
                        Ok(())
                    })?;
                    info!(app_id, "Finished interrupted stop");
                }
                AppStatus::Created | AppStatus::Stopped | AppStatus::Failed { .. } => {}
            }
        }
        Ok(())
    }

    fn fail_on_recovery(&self, app_id: &str, reason: &str) -> Result<(), HostError> {
        self.registry.update(app_id, |r| {
            r.generation += 1;
            r.status = AppStatus::Failed {
                error: reason.to_string(),
            };
            Ok(())
        })?;
        Ok(())
    }

    /// React to a supervised process exiting on its own. Stale events (the
    /// app already moved on) are ignored.
    async fn handle_exit(&self, event: ExitEvent) {
        let result = self.registry.update(&event.app_id, |r| {
            match r.status {
                AppStatus::Running { pid, .. } if pid == event.pid => {
                    r.generation += 1;
                    r.status = AppStatus::Failed {
                        error: match event.code {
                            Some(code) => format!("process exited unexpectedly (exit code {})", code),
                            None => "process exited unexpectedly".to_string(),
                        },
                    };
                    Ok(())
                }
                _ => Err(HostError::Superseded),
            }
        });
        match result {
            Ok(record) => {
                warn!(app_id = %event.app_id, pid = event.pid, code = ?event.code, "App process exited unexpectedly");
                self.allocator.release(&event.app_id);
                if let Ok(log) = self.supervisor.log(&event.app_id, &record.log_path) {
                    let _ = log.append(&format!(
                        "process exited unexpectedly (pid {}, exit code {})",
                        event.pid,
                        event.code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
                    ));
                }
            }
            Err(HostError::Superseded) | Err(HostError::NotFound(_)) => {
                debug!(app_id = %event.app_id, pid = event.pid, "Ignoring stale exit event");
            }
            Err(e) => {
                warn!(app_id = %event.app_id, error = %e, "Failed to record process exit");
            }
        }
    }

    fn pipeline_lock(&self, app_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.pipeline_locks
            .entry(app_id.to_string())
            .or_default()
            .clone()
    }

    fn spawn_pipeline(self: &Arc<Self>, app_id: String, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run_pipeline(&app_id, generation).await {
                Ok(()) => {}
                Err(HostError::Superseded) => {
                    debug!(app_id, generation, "Pipeline superseded by a newer operation");
                }
                Err(HostError::NotFound(_)) => {
                    debug!(app_id, generation, "Pipeline aborted, app was deleted");
                }
                Err(e) => {
                    warn!(app_id, generation, error = %e, "Provisioning pipeline failed");
                    let message = e.to_string();
                    let _ = this.registry.update(&app_id, |r| {
                        if r.generation != generation {
                            return Err(HostError::Superseded);
                        }
                        r.status = AppStatus::Failed { error: message.clone() };
                        Ok(())
                    });
                }
            }
        });
    }

    /// The install-allocate-launch pipeline for one generation of one app.
    /// Holds the per-app pipeline lock for its whole duration.
    async fn run_pipeline(self: &Arc<Self>, app_id: &str, generation: u64) -> Result<(), HostError> {
        let lock = self.pipeline_lock(app_id);
        let _guard = lock.lock().await;

        let record = self.guarded_update(app_id, generation, |r| {
            r.status = AppStatus::Installing;
            Ok(())
        })?;
        let log = self.supervisor.log(app_id, &record.log_path)?;
        log.append("installing dependencies")?;
        self.supervisor.install(&record, &log).await?;

        // The lease goes back to the pool automatically unless the launch
        // commits all the way to running
        let lease = self.allocator.allocate(app_id)?;
        let port = lease.port();
        let record = self.guarded_update(app_id, generation, |r| {
            r.status = AppStatus::Starting { port };
            Ok(())
        })?;

        let pid = self.supervisor.launch(&record, port, &log).await?;

        match self.guarded_update(app_id, generation, |r| {
            r.status = AppStatus::Running { port, pid };
            Ok(())
        }) {
            Ok(_) => {
                lease.commit();
                self.supervisor.spawn_exit_monitor(app_id, pid);
                log.append(&format!("app running (pid {}, internal port {})", pid, port))?;
                info!(app_id, port, pid, "App running");
                Ok(())
            }
            Err(e) => {
                // A newer request won the race after we launched; the
                // process must not outlive its generation.
                self.supervisor
                    .terminate(app_id, Some(pid), self.supervisor.runtime().grace_period())
                    .await;
                Err(e)
            }
        }
    }

    /// Registry update that only applies while the app is still at the
    /// generation this pipeline was spawned for
    fn guarded_update<F>(
        &self,
        app_id: &str,
        generation: u64,
        mutate: F,
    ) -> Result<AppRecord, HostError>
    where
        F: FnOnce(&mut AppRecord) -> Result<(), HostError>,
    {
        self.registry.update(app_id, |r| {
            if r.generation != generation {
                return Err(HostError::Superseded);
            }
            mutate(r)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        _dir: tempfile::TempDir,
        orch: Arc<Orchestrator>,
        allocator: Arc<PortAllocator>,
    }

    fn harness(runtime: RuntimeConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(AppRegistry::load(dir.path()).unwrap());
        let allocator = PortAllocator::new(9100, 9105).unwrap();
        let (supervisor, exit_rx) = ProcessSupervisor::new(runtime);
        let orch = Orchestrator::new(registry, Arc::clone(&allocator), supervisor);
        orch.spawn_exit_loop(exit_rx);
        Harness {
            _dir: dir,
            orch,
            allocator,
        }
    }

    fn quick_runtime() -> RuntimeConfig {
        RuntimeConfig {
            setup: "true".to_string(),
            install: "true".to_string(),
            run: "sleep 30".to_string(),
            install_timeout_secs: 10,
            liveness_window_ms: 100,
            grace_period_secs: 2,
            exit_poll_interval_ms: 50,
        }
    }

    async fn wait_for_label(orch: &Orchestrator, app_id: &str, label: &str) -> AppRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let record = orch.registry().get(app_id).unwrap();
            if record.status.label() == label {
                return record;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for state {}, app is {}",
                    label,
                    record.status.label()
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_create_provisions_and_runs() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"code", b"").unwrap();
        assert_eq!(record.status, AppStatus::Created);

        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        let port = running.status.port().unwrap();
        assert_eq!(port, 9100);
        assert!(h.allocator.is_allocated(port));
        assert!(running.status.pid().is_some());

        // Log carries the provisioning trail
        let lines = h.orch.logs(&record.app_id, 50).unwrap();
        assert!(lines.iter().any(|l| l.contains("installing dependencies")));
        assert!(lines.iter().any(|l| l.contains("app running")));
    }

    #[tokio::test]
    async fn test_create_rejects_empty_uploads() {
        let h = harness(quick_runtime());
        assert!(matches!(
            h.orch.create("  ", b"code", b""),
            Err(HostError::Validation(_))
        ));
        assert!(matches!(
            h.orch.create("demo", b"", b""),
            Err(HostError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_install_failure_ends_failed_without_port() {
        let mut runtime = quick_runtime();
        runtime.install = "sh -c \"echo nope >&2; exit 1\"".to_string();
        let h = harness(runtime);
        let record = h.orch.create("demo", b"code", b"badpkg").unwrap();

        let failed = wait_for_label(&h.orch, &record.app_id, "failed").await;
        assert!(failed.status.error().unwrap().contains("installation failed"));
        assert!(!h.allocator.is_allocated(9100));
    }

    #[tokio::test]
    async fn test_launch_failure_releases_port() {
        let mut runtime = quick_runtime();
        runtime.run = "sh -c \"exit 5\"".to_string();
        let h = harness(runtime);
        let record = h.orch.create("demo", b"code", b"").unwrap();

        let failed = wait_for_label(&h.orch, &record.app_id, "failed").await;
        assert!(failed.status.error().unwrap().contains("failed to start"));
        assert!(!h.allocator.is_allocated(9100));
    }

    #[tokio::test]
    async fn test_stop_then_start_reuses_pool() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"code", b"").unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        let pid = running.status.pid().unwrap();

        let stopped = h.orch.stop(&record.app_id).await.unwrap();
        assert_eq!(stopped.status, AppStatus::Stopped);
        assert!(!h.allocator.is_allocated(9100));
        assert!(!h.orch.supervisor.pid_alive(pid));

        // Stopping again is a no-op
        let again = h.orch.stop(&record.app_id).await.unwrap();
        assert_eq!(again.status, AppStatus::Stopped);

        h.orch.start(&record.app_id).unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        assert_eq!(running.status.port(), Some(9100));
    }

    #[tokio::test]
    async fn test_start_while_installing_is_conflict() {
        let mut runtime = quick_runtime();
        runtime.install = "sleep 5".to_string();
        let h = harness(runtime);
        let record = h.orch.create("demo", b"code", b"").unwrap();

        wait_for_label(&h.orch, &record.app_id, "installing").await;
        assert!(matches!(
            h.orch.start(&record.app_id),
            Err(HostError::Conflict(_))
        ));
        assert!(matches!(
            h.orch.stop(&record.app_id).await,
            Err(HostError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_start_running_app_is_noop() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"code", b"").unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;

        let again = h.orch.start(&record.app_id).unwrap();
        assert_eq!(again.status, running.status);
        assert_eq!(again.generation, running.generation);
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed_and_frees_port() {
        let mut runtime = quick_runtime();
        runtime.run = "sh -c \"sleep 0.5\"".to_string();
        let h = harness(runtime);
        let record = h.orch.create("demo", b"code", b"").unwrap();

        wait_for_label(&h.orch, &record.app_id, "running").await;
        let failed = wait_for_label(&h.orch, &record.app_id, "failed").await;
        assert!(failed
            .status
            .error()
            .unwrap()
            .contains("exited unexpectedly"));
        assert!(!h.allocator.is_allocated(9100));
    }

    #[tokio::test]
    async fn test_edit_restarts_running_app_with_new_content() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"old code", b"").unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        let old_pid = running.status.pid().unwrap();

        let edited = h
            .orch
            .edit(&record.app_id, Some("renamed"), Some(b"new code"), None)
            .await
            .unwrap();
        assert_eq!(edited.name, "renamed");
        assert!(edited.generation > running.generation);
        assert_eq!(edited.code_sha256, sha256_hex(b"new code"));

        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        assert_ne!(running.status.pid(), Some(old_pid));
        assert_eq!(
            std::fs::read(&record.code_path).unwrap(),
            b"new code".to_vec()
        );
    }

    #[tokio::test]
    async fn test_edit_name_only_does_not_restart() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"code", b"").unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        let pid = running.status.pid().unwrap();

        let edited = h
            .orch
            .edit(&record.app_id, Some("other"), None, None)
            .await
            .unwrap();
        assert_eq!(edited.name, "other");
        assert_eq!(edited.status.pid(), Some(pid));
    }

    #[tokio::test]
    async fn test_edit_stopped_app_reprovisions() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"v1", b"").unwrap();
        wait_for_label(&h.orch, &record.app_id, "running").await;
        h.orch.stop(&record.app_id).await.unwrap();

        let edited = h
            .orch
            .edit(&record.app_id, None, Some(b"v2"), None)
            .await
            .unwrap();
        assert_eq!(edited.code_sha256, sha256_hex(b"v2"));

        // New content forces a fresh install and launch even from idle
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        assert_eq!(running.generation, edited.generation);
        assert!(running.status.pid().is_some());
        assert_eq!(
            std::fs::read(&record.code_path).unwrap(),
            b"v2".to_vec()
        );
    }

    #[tokio::test]
    async fn test_stop_while_starting_defers_port_release() {
        let mut runtime = quick_runtime();
        // Keep the app in starting long enough to stop it mid-launch
        runtime.liveness_window_ms = 2000;
        let h = harness(runtime);
        let record = h.orch.create("demo", b"code", b"").unwrap();

        let starting = wait_for_label(&h.orch, &record.app_id, "starting").await;
        let port = starting.status.port().unwrap();

        let stopped = h.orch.stop(&record.app_id).await.unwrap();
        assert_eq!(stopped.status, AppStatus::Stopped);
        // The superseded launch still holds the port; it must not reenter
        // the pool until that pipeline has killed its process
        assert!(h.allocator.is_allocated(port));

        let deadline = Instant::now() + Duration::from_secs(10);
        while h.allocator.is_allocated(port) {
            if Instant::now() > deadline {
                panic!("superseded launch never released its port");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        // Once released the port is ordinarily reusable
        assert_eq!(h.allocator.allocate("other").unwrap().commit(), port);
    }

    #[tokio::test]
    async fn test_edit_during_install_supersedes_pipeline() {
        let mut runtime = quick_runtime();
        runtime.install = "sleep 1".to_string();
        let h = harness(runtime);
        let record = h.orch.create("demo", b"old", b"").unwrap();
        wait_for_label(&h.orch, &record.app_id, "installing").await;

        let edited = h
            .orch
            .edit(&record.app_id, None, Some(b"new"), None)
            .await
            .unwrap();
        assert_eq!(edited.generation, 2);

        // Only the superseding pipeline may commit running
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        assert_eq!(running.generation, 2);
        assert_eq!(running.code_sha256, sha256_hex(b"new"));
    }

    #[tokio::test]
    async fn test_delete_running_app_frees_everything() {
        let h = harness(quick_runtime());
        let record = h.orch.create("demo", b"code", b"").unwrap();
        let running = wait_for_label(&h.orch, &record.app_id, "running").await;
        let pid = running.status.pid().unwrap();
        let dir = h.orch.registry().app_dir(&record.app_id);

        h.orch.delete(&record.app_id).await.unwrap();
        assert!(matches!(
            h.orch.registry().get(&record.app_id),
            Err(HostError::NotFound(_))
        ));
        assert!(!dir.exists());
        assert!(!h.allocator.is_allocated(9100));
        assert!(!h.orch.supervisor.pid_alive(pid));
    }

    #[tokio::test]
    async fn test_logs_default_tail() {
        let h = harness(quick_runtime());
        assert!(matches!(
            h.orch.logs("missing", 10),
            Err(HostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_normalizes_interrupted_states() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(AppRegistry::load(dir.path()).unwrap());
        let dead = registry.create("dead", b"x", b"").unwrap();
        registry
            .update(&dead.app_id, |r| {
                r.status = AppStatus::Running {
                    port: 9100,
                    // guaranteed-free pid
                    pid: 0x7fff_fff0,
                };
                Ok(())
            })
            .unwrap();
        let interrupted = registry.create("mid-install", b"x", b"").unwrap();
        registry
            .update(&interrupted.app_id, |r| {
                r.status = AppStatus::Installing;
                Ok(())
            })
            .unwrap();
        let stopping = registry.create("mid-stop", b"x", b"").unwrap();
        registry
            .update(&stopping.app_id, |r| {
                r.status = AppStatus::Stopping {
                    port: 9101,
                    pid: None,
                };
                Ok(())
            })
            .unwrap();

        let allocator = PortAllocator::new(9100, 9105).unwrap();
        let (supervisor, exit_rx) = ProcessSupervisor::new(quick_runtime());
        let orch = Orchestrator::new(Arc::clone(&registry), Arc::clone(&allocator), supervisor);
        orch.spawn_exit_loop(exit_rx);
        orch.recover().await.unwrap();

        let dead = registry.get(&dead.app_id).unwrap();
        assert!(dead.status.error().unwrap().contains("no longer alive"));
        assert!(!allocator.is_allocated(9100));

        let interrupted = registry.get(&interrupted.app_id).unwrap();
        assert!(interrupted.status.error().unwrap().contains("interrupted"));

        let stopping = registry.get(&stopping.app_id).unwrap();
        assert_eq!(stopping.status, AppStatus::Stopped);
    }
}
