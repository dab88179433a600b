pub mod template;
pub mod tree;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::model::NexusConfig;
use crate::logs::{self, LogSink, LogStream};
use crate::platform::{self, ProcessGroupHandle};
use crate::registry::Service;

/// How often termination re-checks the process table.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest wait for the output pumps to drain after the child is reaped.
/// Grandchildren may hold the pipes open long after the shell exits.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchErrorKind {
    InvalidCommand,
    DirectoryNotFound,
    SpawnFailed,
}

impl fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LaunchErrorKind::InvalidCommand => "invalid command",
            LaunchErrorKind::DirectoryNotFound => "directory not found",
            LaunchErrorKind::SpawnFailed => "spawn failed",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub message: String,
}

impl LaunchError {
    pub fn new(kind: LaunchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Exit information
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// A process started by this launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub pid: u32,
    pub start_time: Option<u64>,
    pub log_path: PathBuf,
    pub command: String,
}

struct ProcessHandle {
    pid: u32,
    start_time: Option<u64>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    // Flips to true once the output pumps have finished after the exit
    drained_rx: watch::Receiver<bool>,
    // Kept alive for the lifetime of the process (Windows Job Object)
    group: Option<ProcessGroupHandle>,
}

#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub host: String,
    pub log_dir: PathBuf,
    pub log_max_bytes: u64,
    pub kill_timeout: Duration,
}

impl LauncherSettings {
    pub fn from_config(config: &NexusConfig) -> Self {
        Self {
            host: config.ports.host.clone(),
            log_dir: config.log_dir(),
            log_max_bytes: config.logs.max_bytes,
            kill_timeout: Duration::from_millis(config.process.kill_timeout_ms),
        }
    }
}

/// Spawns service processes, pumps their output into log files and
/// terminates process trees. Holds runtime handles only; never persists.
pub struct Launcher {
    settings: LauncherSettings,
    handles: DashMap<String, ProcessHandle>,
    sinks: DashMap<String, LogSink>,
    #[cfg(test)]
    unkillable: std::sync::atomic::AtomicBool,
}

impl Launcher {
    pub fn new(settings: LauncherSettings) -> Self {
        Self {
            settings,
            handles: DashMap::new(),
            sinks: DashMap::new(),
            #[cfg(test)]
            unkillable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make every [`Launcher::terminate`] report an unconfirmed kill.
    #[cfg(test)]
    pub(crate) fn set_unkillable(&self, on: bool) {
        self.unkillable
            .store(on, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn log_dir(&self) -> &Path {
        &self.settings.log_dir
    }

    pub fn log_path_for(&self, service: &Service) -> PathBuf {
        logs::log_path_for(&self.settings.log_dir, service)
    }

    /// The shared sink for a service, opened on first use.
    pub fn sink(&self, service: &Service) -> LogSink {
        self.sinks
            .entry(service.id.clone())
            .or_insert_with(|| {
                logs::open_sink(&self.settings.log_dir, service, self.settings.log_max_bytes)
            })
            .clone()
    }

    fn resolve_dir(service: &Service) -> Result<Option<PathBuf>, LaunchError> {
        let Some(dir) = &service.working_directory else {
            return Ok(None);
        };
        let expanded = PathBuf::from(platform::expand_home(&dir.to_string_lossy()));
        if !expanded.is_dir() {
            return Err(LaunchError::new(
                LaunchErrorKind::DirectoryNotFound,
                format!("working directory not found: {}", expanded.display()),
            ));
        }
        Ok(Some(expanded))
    }

    fn resolve_command(
        &self,
        service: &Service,
        command: &str,
        field: &str,
    ) -> Result<template::ResolvedLaunch, LaunchError> {
        template::resolve(service, &self.settings.host, command, field).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            LaunchError::new(LaunchErrorKind::InvalidCommand, messages.join("; "))
        })
    }

    /// Start `service.start_command` through the platform shell in a new
    /// process group. The child inherits the controller's environment plus
    /// `PORT`/`HOST` and the resolved overrides.
    pub async fn launch(&self, service: &Service) -> Result<Launched, LaunchError> {
        if !service.has_start_command() {
            return Err(LaunchError::new(
                LaunchErrorKind::InvalidCommand,
                "start command is empty",
            ));
        }
        let resolved = self.resolve_command(service, &service.start_command, "start_command")?;
        let cwd = Self::resolve_dir(service)?;

        let sink = self.sink(service);
        sink.system(&format!("starting: {}", resolved.command));

        let mut cmd = platform::shell_command(&resolved.command);
        platform::configure_process_group(&mut cmd);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&resolved.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Services outlive the controller
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| {
            let message = format!(
                "failed to spawn '{}' via {}: {}",
                resolved.command,
                platform::shell_name(),
                e
            );
            sink.system(&message);
            LaunchError::new(LaunchErrorKind::SpawnFailed, message)
        })?;

        let Some(pid) = child.id() else {
            return Err(LaunchError::new(
                LaunchErrorKind::SpawnFailed,
                "process exited before its pid could be read",
            ));
        };
        let group = platform::post_spawn_setup(Some(pid));
        let start_time = tree::process_start_time(pid);

        info!(service = %service.name, pid, command = %resolved.command, "spawned");

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(spawn_pump(out, sink.clone(), LogStream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(spawn_pump(err, sink.clone(), LogStream::Stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = watch::channel(false);
        let waiter_sink = sink.clone();
        let service_name = service.name.clone();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!(service = %service_name, pid, error = %e, "failed to wait for child");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            // The pid is gone from the process table from here on, so the
            // exit must be visible before the pumps are drained.
            let _ = exit_tx.send(Some(info));
            debug!(service = %service_name, pid, exit = %info, "child reaped");
            let drain = futures_util::future::join_all(
                pumps
                    .into_iter()
                    .map(|pump| tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump)),
            );
            drain.await;
            waiter_sink.system(&format!("exited with {}", info));
            let _ = drained_tx.send(true);
        });

        self.handles.insert(
            service.id.clone(),
            ProcessHandle {
                pid,
                start_time,
                exit_rx,
                drained_rx,
                group,
            },
        );

        Ok(Launched {
            pid,
            start_time,
            log_path: sink.path(),
            command: resolved.command,
        })
    }

    /// PID and start time of the process this launcher started for `service_id`.
    pub fn handle(&self, service_id: &str) -> Option<(u32, Option<u64>)> {
        self.handles.get(service_id).map(|h| (h.pid, h.start_time))
    }

    /// Exit status of a reaped child, if this launcher started it.
    pub fn exit_status(&self, service_id: &str) -> Option<ExitInfo> {
        self.handles
            .get(service_id)
            .and_then(|h| *h.exit_rx.borrow())
    }

    /// Wait up to `timeout` for the child of `service_id` to be reaped.
    pub async fn wait_for_exit(&self, service_id: &str, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.handles.get(service_id)?.exit_rx.clone();
        let info = match tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await {
            Ok(Ok(info)) => *info,
            _ => None,
        };
        info
    }

    /// Wait up to `timeout` for the output of the reaped child of
    /// `service_id` to reach its log. Returns whether it did.
    pub async fn wait_for_output(&self, service_id: &str, timeout: Duration) -> bool {
        let Some(mut rx) = self.handles.get(service_id).map(|h| h.drained_rx.clone()) else {
            return true;
        };
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|drained| *drained)).await,
            Ok(Ok(_))
        );
        drained
    }

    pub fn forget(&self, service_id: &str) {
        self.handles.remove(service_id);
    }

    pub fn is_alive(&self, pid: u32, expected_start_time: Option<u64>) -> bool {
        tree::is_alive(pid, expected_start_time)
    }

    async fn wait_for_death(
        &self,
        service_id: &str,
        pid: u32,
        start_time: Option<u64>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exit_status(service_id).is_some() || !tree::is_alive(pid, start_time) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Stop the process tree rooted at `pid`: polite stop signal to the
    /// group and every descendant, up to `grace` to exit, then a forced kill
    /// and a bounded wait. Returns whether the root is confirmed dead.
    ///
    /// `start_time` guards against signalling a recycled PID.
    pub async fn terminate(
        &self,
        service_id: &str,
        pid: u32,
        start_time: Option<u64>,
        grace: Duration,
    ) -> bool {
        #[cfg(test)]
        if self.unkillable.load(std::sync::atomic::Ordering::SeqCst) {
            warn!(service = %service_id, pid, "process survived SIGKILL");
            return false;
        }

        if !tree::is_alive(pid, start_time) {
            debug!(service = %service_id, pid, "already dead");
            self.forget(service_id);
            return true;
        }

        platform::request_stop(pid);
        let signalled = tree::signal_tree_async(pid, start_time, sysinfo::Signal::Term).await;
        debug!(service = %service_id, pid, signalled, "requested stop");

        if self.wait_for_death(service_id, pid, start_time, grace).await {
            info!(service = %service_id, pid, "stopped");
            self.forget(service_id);
            return true;
        }

        warn!(
            service = %service_id,
            pid,
            grace = %humantime::format_duration(grace),
            "did not exit within grace period, killing"
        );
        tree::signal_tree_async(pid, start_time, sysinfo::Signal::Kill).await;
        {
            let handle = self.handles.get(service_id);
            let group = handle.as_ref().and_then(|h| h.group.as_ref());
            platform::force_kill_group(pid, group);
        }

        let dead = self
            .wait_for_death(service_id, pid, start_time, self.settings.kill_timeout)
            .await;
        if dead {
            info!(service = %service_id, pid, "killed");
            self.forget(service_id);
        } else {
            warn!(service = %service_id, pid, "process survived SIGKILL");
        }
        dead
    }

    /// Run an auxiliary command (e.g. `stop_command`) for `service` to
    /// completion, bounded by `timeout`. Output goes to the service log.
    pub async fn run_auxiliary(
        &self,
        service: &Service,
        command: &str,
        field: &str,
        timeout: Duration,
    ) -> Result<ExitInfo, LaunchError> {
        let resolved = self.resolve_command(service, command, field)?;
        let cwd = Self::resolve_dir(service)?;
        let sink = self.sink(service);
        sink.system(&format!("running {}: {}", field, resolved.command));

        let mut cmd = platform::shell_command(&resolved.command);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&resolved.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            LaunchError::new(
                LaunchErrorKind::SpawnFailed,
                format!("failed to spawn {} '{}': {}", field, resolved.command, e),
            )
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LaunchError::new(
                    LaunchErrorKind::SpawnFailed,
                    format!("{} failed: {}", field, e),
                ))
            }
            Err(_) => {
                let message = format!(
                    "{} timed out after {}",
                    field,
                    humantime::format_duration(timeout)
                );
                sink.system(&message);
                return Err(LaunchError::new(LaunchErrorKind::SpawnFailed, message));
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            sink.write(LogStream::Stdout, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            sink.write(LogStream::Stderr, line);
        }
        let info = ExitInfo::from_status(output.status);
        sink.system(&format!("{} finished with {}", field, info));
        Ok(info)
    }
}

fn spawn_pump<R>(reader: R, sink: LogSink, stream: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => sink.write(stream, &String::from_utf8_lossy(&buf)),
                Err(e) => {
                    debug!(?stream, error = %e, "output pump stopped");
                    break;
                }
            }
        }
    })
}
