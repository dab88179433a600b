use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use super::{Supervisor, SupervisorError};
use crate::logs::{self, LogEntry, LogStream};
use crate::process::ExitInfo;
use crate::registry::{Service, ServiceStatus};

/// How far back to look for the reason a service died.
const CRASH_SCAN_LINES: usize = 200;

/// Marker the launcher writes before every spawn.
const START_MARKER: &str = "starting: ";

/// Longest wait for the reaper to publish the exit of a child this
/// controller started, once its pid has left the process table.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

/// Longest wait for a dead child's last output to reach the log.
const OUTPUT_SETTLE: Duration = Duration::from_millis(250);

impl Supervisor {
    /// Load `id` and bring its stored status in line with the OS. The caller
    /// holds the service lock.
    pub(super) async fn load_reconciled(&self, id: &str) -> Result<Service, SupervisorError> {
        let svc = self.registry.get(id)?;
        let reconciled = self.reconcile(&svc).await;
        if reconciled == svc {
            return Ok(svc);
        }
        debug!(
            service = %svc.name,
            from = %svc.status,
            to = %reconciled.status,
            "reconciled status"
        );
        self.persist_runtime(reconciled)
    }

    /// The state `svc` is really in. A stored PID counts only when a process
    /// with that PID and start time is still alive.
    async fn reconcile(&self, svc: &Service) -> Service {
        let mut next = svc.clone();

        let Some(pid) = svc.process_pid else {
            if next.status == ServiceStatus::Running {
                next.status = ServiceStatus::Stopped;
            }
            return next;
        };

        if self.launcher.is_alive(pid, svc.process_start_time) {
            next.status = ServiceStatus::Running;
            next.last_error = None;
            return next;
        }

        let ours = self
            .launcher
            .handle(&svc.id)
            .is_some_and(|(handle_pid, _)| handle_pid == pid);
        let exit = match self.launcher.exit_status(&svc.id) {
            Some(info) => Some(info),
            // Our child, dead but not reaped yet
            None if ours => self.launcher.wait_for_exit(&svc.id, EXIT_SETTLE).await,
            None => None,
        };
        if exit.is_some_and(|info| !info.success()) {
            self.launcher.wait_for_output(&svc.id, OUTPUT_SETTLE).await;
        }
        self.launcher.forget(&svc.id);
        next.clear_process();

        let log_path = svc
            .log_path
            .clone()
            .unwrap_or_else(|| self.launcher.log_path_for(svc));
        match exit {
            Some(info) if info.success() => {
                info!(service = %svc.name, pid, "exited cleanly");
                next.status = ServiceStatus::Stopped;
                next.last_error = None;
            }
            Some(info) => {
                let message = exit_message(&info, crash_line(&log_path).as_deref());
                info!(service = %svc.name, pid, "{}", message);
                next.status = ServiceStatus::Error;
                next.last_error = Some(message);
            }
            // Started by an earlier controller: only the log can tell
            None => match crash_line(&log_path) {
                Some(line) => {
                    info!(service = %svc.name, pid, "died after logging an error");
                    next.status = ServiceStatus::Error;
                    next.last_error = Some(format!("process exited: {}", line));
                }
                None => {
                    info!(service = %svc.name, pid, "process is gone");
                    next.status = ServiceStatus::Stopped;
                }
            },
        }
        next
    }

    /// Most useful line to quote when a service fails: the last error line
    /// of the current run, else its last output line.
    pub(super) fn last_output_line(&self, path: &Path) -> Option<String> {
        let entries = current_run(path);
        entries
            .iter()
            .rev()
            .find(|e| e.is_error())
            .or_else(|| {
                entries
                    .iter()
                    .rev()
                    .find(|e| e.stream != Some(LogStream::System) && !e.text.trim().is_empty())
            })
            .map(|e| e.text.trim().to_string())
    }
}

fn exit_message(info: &ExitInfo, line: Option<&str>) -> String {
    match line {
        Some(line) => format!("exited with {}: {}", info, line),
        None => format!("exited with {}", info),
    }
}

/// Entries written since the most recent start marker.
fn current_run(path: &Path) -> Vec<LogEntry> {
    let Ok(tail) = logs::tail(path, CRASH_SCAN_LINES) else {
        return Vec::new();
    };
    let entries: Vec<LogEntry> = tail.map(|l| LogEntry::parse(&l)).collect();
    let start = entries
        .iter()
        .rposition(|e| e.stream == Some(LogStream::System) && e.text.starts_with(START_MARKER))
        .map(|i| i + 1)
        .unwrap_or(0);
    entries.into_iter().skip(start).collect()
}

/// Last error line of the current run, if any.
fn crash_line(path: &Path) -> Option<String> {
    current_run(path)
        .into_iter()
        .rev()
        .find(|e| e.is_error())
        .map(|e| e.text.trim().to_string())
}
