mod bulk;
mod reconcile;
mod summary;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::model::NexusConfig;
use crate::logs;
use crate::ports::{PortAllocator, PortError};
use crate::process::{LaunchError, LaunchErrorKind, Launcher, LauncherSettings};
use crate::registry::{NewService, Registry, RegistryError, Service, ServiceStatus, ServiceUpdate};

pub use bulk::{ConflictReport, Outcome};
pub use summary::{Alert, AlertKind, Summary, Totals};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("process {pid} is still alive after being killed")]
    TerminationUnconfirmed { pid: u32 },

    #[error(transparent)]
    Registry(RegistryError),

    #[error("failed to read log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<RegistryError> for SupervisorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => SupervisorError::NotFound(id),
            other => SupervisorError::Registry(other),
        }
    }
}

/// The verified state of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub id: String,
    pub name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub last_error: Option<String>,
}

impl From<&Service> for StatusReport {
    fn from(svc: &Service) -> Self {
        Self {
            id: svc.id.clone(),
            name: svc.name.clone(),
            status: svc.status,
            pid: svc.process_pid,
            port: svc.port,
            last_error: svc.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub grace: Duration,
    pub startup_probe: Duration,
    pub stop_command_timeout: Duration,
    pub workers: usize,
    pub sweep_interval: Option<Duration>,
}

impl SupervisorSettings {
    pub fn from_config(config: &NexusConfig) -> Self {
        let sweep = config.supervisor.sweep_interval_secs;
        Self {
            grace: Duration::from_millis(config.process.grace_ms),
            startup_probe: Duration::from_millis(config.process.startup_probe_ms),
            stop_command_timeout: Duration::from_millis(config.process.stop_command_timeout_ms),
            workers: config.supervisor.workers.max(1),
            sweep_interval: (sweep > 0).then(|| Duration::from_secs(sweep)),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the lifecycle of every registered service.
///
/// Operations on one service are serialised by a per-service lock and start
/// by re-verifying the stored PID against the OS. Port allocation and
/// conflict resolution additionally share one registry-wide lock. The
/// port lock is never held while waiting for a service lock.
pub struct Supervisor {
    registry: Arc<dyn Registry>,
    launcher: Launcher,
    ports: PortAllocator,
    settings: SupervisorSettings,
    locks: DashMap<String, Arc<Mutex<()>>>,
    port_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<dyn Registry>,
        launcher: Launcher,
        ports: PortAllocator,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            launcher,
            ports,
            settings,
            locks: DashMap::new(),
            port_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &NexusConfig, registry: Arc<dyn Registry>) -> Self {
        Self::new(
            registry,
            Launcher::new(LauncherSettings::from_config(config)),
            PortAllocator::from_config(config),
            SupervisorSettings::from_config(config),
        )
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    fn service_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write the lifecycle fields of `live` back, keeping any metadata edits
    /// made concurrently.
    fn persist_runtime(&self, mut live: Service) -> Result<Service, SupervisorError> {
        live.touch();
        let id = live.id.clone();
        Ok(self.registry.update(&id, &mut |stored| stored.apply_runtime(&live))?)
    }

    fn persist_failure(&self, mut svc: Service, message: &str) -> Result<Service, SupervisorError> {
        svc.status = ServiceStatus::Error;
        svc.last_error = Some(message.to_string());
        svc.clear_process();
        self.persist_runtime(svc)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The service with its status verified against the OS.
    pub async fn get(&self, id: &str) -> Result<Service, SupervisorError> {
        let lock = self.service_lock(id);
        let _guard = lock.lock().await;
        self.load_reconciled(id).await
    }

    pub async fn status(&self, id: &str) -> Result<StatusReport, SupervisorError> {
        let svc = self.get(id).await?;
        Ok(StatusReport::from(&svc))
    }

    /// Every service, each verified against the OS, ordered by name.
    pub async fn list(&self) -> Result<Vec<Service>, SupervisorError> {
        let ids: Vec<String> = self.registry.list()?.into_iter().map(|s| s.id).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(svc) => out.push(svc),
                // Removed while we were iterating
                Err(SupervisorError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// The newest `lines` lines of the service's log.
    pub fn tail_logs(&self, id: &str, lines: usize) -> Result<Vec<String>, SupervisorError> {
        let svc = self.registry.get(id)?;
        let path = svc
            .log_path
            .clone()
            .unwrap_or_else(|| self.launcher.log_path_for(&svc));
        let tail = logs::tail(&path, lines).map_err(|source| SupervisorError::Log {
            path: path.clone(),
            source,
        })?;
        Ok(tail.collect())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register(&self, new: NewService) -> Result<Service, SupervisorError> {
        if new.name.trim().is_empty() {
            return Err(SupervisorError::Invalid(
                "service name must not be empty".to_string(),
            ));
        }
        let svc = Service::new(new);
        self.registry.insert(svc.clone())?;
        info!(service = %svc.name, id = %svc.id, "registered");
        Ok(svc)
    }

    /// Edit the service's metadata. A running process keeps the command and
    /// environment it was started with until its next start.
    pub async fn update(&self, id: &str, patch: ServiceUpdate) -> Result<Service, SupervisorError> {
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(SupervisorError::Invalid(
                "service name must not be empty".to_string(),
            ));
        }
        let lock = self.service_lock(id);
        let _guard = lock.lock().await;
        let _ports = match patch.port {
            Some(Some(port)) => {
                let guard = self.port_lock.lock().await;
                self.check_port_claim(id, port)?;
                Some(guard)
            }
            _ => None,
        };
        let updated = self.registry.update(id, &mut |svc| {
            patch.apply(svc);
            svc.touch();
        })?;
        info!(service = %updated.name, id = %updated.id, "updated");
        Ok(updated)
    }

    /// Reject a port the controller owns or another service holds. The
    /// caller holds the port lock.
    fn check_port_claim(&self, id: &str, port: u16) -> Result<(), SupervisorError> {
        if self.ports.is_reserved(port) {
            return Err(SupervisorError::Invalid(format!(
                "port {} is reserved for the controller",
                port
            )));
        }
        let services = self.registry.list()?;
        if let Some(holder) = services
            .iter()
            .find(|s| s.id != id && s.port == Some(port))
        {
            return Err(SupervisorError::Invalid(format!(
                "port {} is already assigned to '{}'",
                port, holder.name
            )));
        }
        Ok(())
    }

    /// Stop the service if it runs, then remove it from the registry.
    pub async fn delete(&self, id: &str) -> Result<Service, SupervisorError> {
        let lock = self.service_lock(id);
        let removed = {
            let _guard = lock.lock().await;
            let svc = self.load_reconciled(id).await?;
            if svc.process_pid.is_some() {
                self.stop_locked(svc).await?;
            }
            self.launcher.forget(id);
            self.registry.remove(id)?
        };
        self.locks.remove(id);
        info!(service = %removed.name, id = %removed.id, "deleted");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the service unless it is verifiably running already.
    pub async fn start(&self, id: &str) -> Result<StatusReport, SupervisorError> {
        let lock = self.service_lock(id);
        let _guard = lock.lock().await;
        let svc = self.load_reconciled(id).await?;
        self.start_locked(svc).await
    }

    /// Stop the service's process tree. Stopping a stopped service is a no-op.
    pub async fn stop(&self, id: &str) -> Result<StatusReport, SupervisorError> {
        let lock = self.service_lock(id);
        let _guard = lock.lock().await;
        let svc = self.load_reconciled(id).await?;
        self.stop_locked(svc).await
    }

    /// Stop then start. Start is attempted even when stop fails; when both
    /// fail, or when the old process survived and start found it running,
    /// the stop error is returned.
    pub async fn restart(&self, id: &str) -> Result<StatusReport, SupervisorError> {
        let lock = self.service_lock(id);
        let _guard = lock.lock().await;
        let svc = self.load_reconciled(id).await?;
        let old_pid = svc.process_pid;
        let stopped = self.stop_locked(svc).await;
        if let Err(e) = &stopped {
            warn!(service = %id, error = %e, "stop failed during restart, starting anyway");
        }
        let svc = self.load_reconciled(id).await?;
        let started = self.start_locked(svc).await;
        match (stopped, started) {
            (Err(stop_err), Err(_)) => Err(stop_err),
            (Err(stop_err), Ok(report)) if old_pid.is_some() && report.pid == old_pid => {
                Err(stop_err)
            }
            (_, started) => started,
        }
    }

    async fn start_locked(&self, svc: Service) -> Result<StatusReport, SupervisorError> {
        if svc.is_running() {
            return Ok(StatusReport::from(&svc));
        }

        if !svc.has_start_command() {
            let err = LaunchError::new(LaunchErrorKind::InvalidCommand, "start command is empty");
            self.persist_failure(svc, &err.message)?;
            return Err(err.into());
        }

        let svc = if svc.needs_port() {
            match self.ensure_port(&svc).await {
                Ok(svc) => svc,
                Err(e) => {
                    self.persist_failure(svc, &e.to_string())?;
                    return Err(e);
                }
            }
        } else {
            svc
        };

        let launched = match self.launcher.launch(&svc).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!(service = %svc.name, error = %e, "launch failed");
                self.persist_failure(svc, &e.message)?;
                return Err(e.into());
            }
        };

        let mut live = svc;
        live.log_path = Some(launched.log_path.clone());

        if let Some(exit) = self
            .launcher
            .wait_for_exit(&live.id, self.settings.startup_probe)
            .await
        {
            if !exit.success() {
                self.launcher
                    .wait_for_output(&live.id, self.settings.startup_probe)
                    .await;
            }
            self.launcher.forget(&live.id);
            live.clear_process();
            if exit.success() {
                info!(service = %live.name, "ran to completion during startup");
                live.status = ServiceStatus::Stopped;
                live.last_error = None;
                let saved = self.persist_runtime(live)?;
                return Ok(StatusReport::from(&saved));
            }
            let mut message = format!("process exited immediately with {}", exit);
            if let Some(line) = self.last_output_line(&launched.log_path) {
                message.push_str(": ");
                message.push_str(&line);
            }
            warn!(service = %live.name, "{}", message);
            self.persist_failure(live, &message)?;
            return Err(LaunchError::new(LaunchErrorKind::SpawnFailed, message).into());
        }

        let id = live.id.clone();
        live.status = ServiceStatus::Running;
        live.process_pid = Some(launched.pid);
        live.process_start_time = launched.start_time;
        live.process_started_at = Some(Utc::now());
        live.last_error = None;
        let saved = match self.persist_runtime(live) {
            Ok(saved) => saved,
            Err(e) => {
                // An unrecorded process would be spawned again by the next start
                warn!(service = %id, pid = launched.pid, error = %e, "could not record pid, stopping process");
                self.launcher
                    .terminate(&id, launched.pid, launched.start_time, self.settings.grace)
                    .await;
                return Err(e);
            }
        };
        info!(service = %saved.name, pid = launched.pid, port = ?saved.port, "started");
        Ok(StatusReport::from(&saved))
    }

    async fn stop_locked(&self, svc: Service) -> Result<StatusReport, SupervisorError> {
        let Some(pid) = svc.process_pid else {
            if svc.status == ServiceStatus::Stopped {
                return Ok(StatusReport::from(&svc));
            }
            let mut live = svc;
            live.status = ServiceStatus::Stopped;
            live.last_error = None;
            let saved = self.persist_runtime(live)?;
            return Ok(StatusReport::from(&saved));
        };

        if !svc.stop_command.trim().is_empty() {
            match self
                .launcher
                .run_auxiliary(
                    &svc,
                    &svc.stop_command,
                    "stop_command",
                    self.settings.stop_command_timeout,
                )
                .await
            {
                Ok(exit) if !exit.success() => {
                    warn!(service = %svc.name, exit = %exit, "stop command failed")
                }
                Ok(_) => {}
                Err(e) => warn!(service = %svc.name, error = %e, "stop command failed"),
            }
        }

        let dead = self
            .launcher
            .terminate(&svc.id, pid, svc.process_start_time, self.settings.grace)
            .await;

        let mut live = svc;
        if dead {
            live.status = ServiceStatus::Stopped;
            live.last_error = None;
            live.clear_process();
            let saved = self.persist_runtime(live)?;
            info!(service = %saved.name, pid, "stopped");
            Ok(StatusReport::from(&saved))
        } else {
            let err = SupervisorError::TerminationUnconfirmed { pid };
            live.status = ServiceStatus::Error;
            live.last_error = Some(err.to_string());
            self.persist_runtime(live)?;
            Err(err)
        }
    }

    /// Make sure the service holds a usable port, reassigning a stored port
    /// that something else has bound or that belongs to the controller.
    async fn ensure_port(&self, svc: &Service) -> Result<Service, SupervisorError> {
        let _ports = self.port_lock.lock().await;
        let services = self.registry.list()?;
        let fresh = services
            .iter()
            .find(|s| s.id == svc.id)
            .ok_or_else(|| SupervisorError::NotFound(svc.id.clone()))?;

        let current = fresh.port;
        let port = self
            .ports
            .assign_port(&services, &svc.id, current, Some(&fresh.category))?;

        let mut updated = svc.clone();
        if current == Some(port) {
            return Ok(updated);
        }

        let mut moved = fresh.clone();
        self.ports.apply_port(&mut moved, current, port);
        match current {
            Some(old) => info!(service = %svc.name, old_port = old, new_port = port, "port unavailable, reassigned"),
            None => info!(service = %svc.name, port, "assigned port"),
        }
        self.registry
            .update(&svc.id, &mut |stored| stored.apply_ports(&moved))?;
        updated.apply_ports(&moved);
        Ok(updated)
    }
}
