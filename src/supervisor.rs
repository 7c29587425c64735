//! Process supervision for hosted apps
//!
//! Drives the external runtime commands (environment setup, dependency
//! install, app launch) for one app at a time, streams all command output
//! into the app's cumulative log, and reports process exits on an event
//! channel consumed by the orchestrator. The supervisor never touches app
//! status directly; it only produces facts (exit codes, pids).

use crate::config::RuntimeConfig;
use crate::error::HostError;
use crate::logs::LogWriter;
use crate::registry::AppRecord;
use dashmap::DashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Interval for polling a signalled process for exit during termination
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fired when a supervised (or adopted) process exits
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub app_id: String,
    pub pid: u32,
    /// Exit code when known; `None` for signal deaths and adopted pids
    pub code: Option<i32>,
}

/// Supervises the OS processes behind hosted apps
pub struct ProcessSupervisor {
    runtime: RuntimeConfig,
    /// Live child handles keyed by app id
    children: DashMap<String, Arc<tokio::sync::Mutex<Child>>>,
    /// Open log writers keyed by app id
    logs: DashMap<String, Arc<LogWriter>>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the exit-event stream the orchestrator
    /// consumes
    pub fn new(runtime: RuntimeConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                runtime,
                children: DashMap::new(),
                logs: DashMap::new(),
                exit_tx,
            }),
            exit_rx,
        )
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Get (or open) the single log writer for an app
    pub fn log(&self, app_id: &str, path: &Path) -> Result<Arc<LogWriter>, HostError> {
        if let Some(existing) = self.logs.get(app_id) {
            return Ok(Arc::clone(&existing));
        }
        let writer = Arc::new(LogWriter::open(path)?);
        let entry = self.logs.entry(app_id.to_string()).or_insert(writer);
        Ok(Arc::clone(&entry))
    }

    /// Provision the app's execution environment and install dependencies.
    /// Output of every command is appended to the app log.
    pub async fn install(&self, record: &AppRecord, log: &Arc<LogWriter>) -> Result<(), HostError> {
        let cwd = app_dir(record);
        let vars = template_vars(record, None);

        if !record.env_path.exists() {
            let argv = render_command(&self.runtime.setup, &vars)?;
            self.run_logged(&record.app_id, argv, cwd, log).await?;
        }

        let argv = render_command(&self.runtime.install, &vars)?;
        self.run_logged(&record.app_id, argv, cwd, log).await
    }

    /// Run one provisioning command to completion, streaming output
    async fn run_logged(
        &self,
        app_id: &str,
        argv: Vec<String>,
        cwd: &Path,
        log: &Arc<LogWriter>,
    ) -> Result<(), HostError> {
        log.append_command(&argv)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostError::Validation("empty runtime command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::ProvisionFailed(format!("failed to run {}: {}", program, e)))?;
        pump_output(&mut child, log);

        let timeout = self.runtime.install_timeout();
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(HostError::ProvisionFailed(e.to_string())),
            Err(_) => {
                warn!(app_id, command = %program, "Install command timed out, killing");
                let _ = child.kill().await;
                return Err(HostError::ProvisionFailed(format!(
                    "command timed out after {}s: {}",
                    timeout.as_secs(),
                    program
                )));
            }
        };

        if !status.success() {
            let msg = format!(
                "command failed (exit {}): {}",
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                argv.join(" ")
            );
            log.append(&format!("FAILED: {}", msg))?;
            return Err(HostError::ProvisionFailed(msg));
        }
        Ok(())
    }

    /// Launch the app process bound to `port`.
    ///
    /// The launch succeeds only if the process survives the liveness
    /// window. On success the child is retained for later termination and
    /// the pid is returned; the caller decides when to start exit
    /// monitoring.
    pub async fn launch(
        &self,
        record: &AppRecord,
        port: u16,
        log: &Arc<LogWriter>,
    ) -> Result<u32, HostError> {
        let cwd = app_dir(record);
        let vars = template_vars(record, Some(port));
        let argv = render_command(&self.runtime.run, &vars)?;
        log.append_command(&argv)?;

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostError::Validation("empty runtime command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("PYTHONUNBUFFERED", "1")
            .env("PORT", port.to_string())
            .env("APP_ID", &record.app_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::StartFailed(format!("failed to launch {}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| HostError::StartFailed("process exited before pid was known".into()))?;
        pump_output(&mut child, log);
        info!(app_id = %record.app_id, pid, port, "App process spawned");

        // The process must outlive the liveness window to count as started
        let window = self.runtime.liveness_window();
        match tokio::time::timeout(window, child.wait()).await {
            Ok(Ok(status)) => {
                let msg = format!(
                    "process exited during liveness window ({})",
                    status
                        .code()
                        .map(|c| format!("exit code {}", c))
                        .unwrap_or_else(|| "killed by signal".into())
                );
                log.append(&format!("FAILED: {}", msg))?;
                return Err(HostError::StartFailed(msg));
            }
            Ok(Err(e)) => return Err(HostError::StartFailed(e.to_string())),
            Err(_) => {} // still alive
        }

        // Port connectability is advisory: some runtimes bind late
        let addr = format!("127.0.0.1:{}", port);
        let connectable = tokio::time::timeout(
            Duration::from_millis(250),
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        debug!(app_id = %record.app_id, port, connectable, "Liveness window passed");
        log.append(&format!("process alive pid={} port={}", pid, port))?;

        self.children
            .insert(record.app_id.clone(), Arc::new(tokio::sync::Mutex::new(child)));
        Ok(pid)
    }

    /// Watch a launched child for exit, reporting on the event channel.
    /// Polling with a bounded interval; the status is cached by the child
    /// handle, so a concurrent terminate cannot lose the exit code.
    pub fn spawn_exit_monitor(&self, app_id: &str, pid: u32) {
        let Some(child) = self.children.get(app_id).map(|c| Arc::clone(&c)) else {
            return;
        };
        let app_id = app_id.to_string();
        let interval = self.runtime.exit_poll_interval();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = child.lock().await;
                    match guard.try_wait() {
                        Ok(Some(status)) => {
                            debug!(app_id, pid, ?status, "Supervised process exited");
                            let _ = exit_tx.send(ExitEvent {
                                app_id,
                                pid,
                                code: status.code(),
                            });
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(app_id, pid, error = %e, "Exit poll failed, stopping monitor");
                            return;
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Watch a pid that outlived an orchestrator restart. No child handle
    /// exists, so liveness is probed via signal 0.
    pub fn adopt(&self, app_id: &str, pid: u32) {
        let app_id = app_id.to_string();
        let interval = self.runtime.exit_poll_interval();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            loop {
                if !pid_alive(pid) {
                    debug!(app_id, pid, "Adopted process exited");
                    let _ = exit_tx.send(ExitEvent {
                        app_id,
                        pid,
                        code: None,
                    });
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Gracefully terminate the app's process: SIGTERM, bounded grace
    /// period, then SIGKILL. Works through the retained child handle when
    /// present, or by raw pid for adopted processes.
    pub async fn terminate(&self, app_id: &str, fallback_pid: Option<u32>, grace: Duration) {
        if let Some((_, child)) = self.children.remove(app_id) {
            let mut guard = child.lock().await;
            if let Some(pid) = guard.id() {
                info!(app_id, pid, "Sending SIGTERM to app process");
                send_sigterm(pid);
            }
            match tokio::time::timeout(grace, guard.wait()).await {
                Ok(Ok(status)) => {
                    info!(app_id, ?status, "App process exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(app_id, error = %e, "Error waiting for app process to exit");
                }
                Err(_) => {
                    warn!(
                        app_id,
                        grace_secs = grace.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = guard.kill().await;
                }
            }
        } else if let Some(pid) = fallback_pid {
            terminate_pid(app_id, pid, grace).await;
        }
    }

    /// Whether a pid refers to a live process
    pub fn pid_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    /// Drop all retained state for an app (on delete)
    pub fn forget(&self, app_id: &str) {
        self.children.remove(app_id);
        self.logs.remove(app_id);
    }
}

fn app_dir(record: &AppRecord) -> &Path {
    record
        .code_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
}

fn template_vars(record: &AppRecord, port: Option<u16>) -> Vec<(&'static str, String)> {
    let mut vars = vec![
        ("{env}", record.env_path.display().to_string()),
        ("{code}", record.code_path.display().to_string()),
        ("{manifest}", record.manifest_path.display().to_string()),
        ("{app_id}", record.app_id.clone()),
    ];
    if let Some(port) = port {
        vars.push(("{port}", port.to_string()));
    }
    vars
}

/// Substitute placeholders and split into argv with shell-words rules
fn render_command(template: &str, vars: &[(&'static str, String)]) -> Result<Vec<String>, HostError> {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(key, value);
    }
    let argv = shell_words::split(&rendered)
        .map_err(|e| HostError::Validation(format!("invalid runtime command: {}", e)))?;
    if argv.is_empty() {
        return Err(HostError::Validation("empty runtime command".into()));
    }
    Ok(argv)
}

/// Forward child stdout/stderr lines into the app log
fn pump_output(child: &mut Child, log: &Arc<LogWriter>) {
    if let Some(stdout) = child.stdout.take() {
        spawn_line_pump(stdout, Arc::clone(log));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_pump(stderr, Arc::clone(log));
    }
}

fn spawn_line_pump<R>(reader: R, log: Arc<LogWriter>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = log.append(&line) {
                warn!(error = %e, "Failed to append process output to log");
                break;
            }
        }
    });
}

async fn terminate_pid(app_id: &str, pid: u32, grace: Duration) {
    info!(app_id, pid, "Sending SIGTERM to adopted process");
    send_sigterm(pid);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }
    warn!(app_id, pid, "Grace period exceeded, sending SIGKILL");
    send_sigkill(pid);
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn send_sigkill(_pid: u32) {}
