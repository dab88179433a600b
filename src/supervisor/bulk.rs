use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StatusReport, Supervisor, SupervisorError};
use crate::config::model::PortRange;
use crate::ports::{DependentEnvUpdate, PortChange, PortInfo};
use crate::registry::ServiceStatus;

/// Result of one service in a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub id: String,
    pub name: String,
    pub ok: bool,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    fn from_report(report: StatusReport) -> Self {
        Self {
            id: report.id,
            name: report.name,
            ok: true,
            status: report.status,
            pid: report.pid,
            error: None,
        }
    }

    fn failed(id: &str, name: &str, status: ServiceStatus, error: &SupervisorError) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ok: false,
            status,
            pid: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub changes: Vec<PortChange>,
    pub dependent_env_updates: Vec<DependentEnvUpdate>,
    pub restarts: Vec<Outcome>,
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Start,
    Stop,
    Restart,
}

impl Supervisor {
    async fn run_op(&self, op: BatchOp, id: &str) -> Result<StatusReport, SupervisorError> {
        match op {
            BatchOp::Start => self.start(id).await,
            BatchOp::Stop => self.stop(id).await,
            BatchOp::Restart => self.restart(id).await,
        }
    }

    /// Run `op` over `targets` with at most `workers` in flight. One failure
    /// never stops the rest. Outcomes are ordered by name.
    async fn run_batch(&self, op: BatchOp, targets: Vec<(String, String)>) -> Vec<Outcome> {
        let mut outcomes: Vec<Outcome> = stream::iter(targets)
            .map(|(id, name)| async move {
                match self.run_op(op, &id).await {
                    Ok(report) => Outcome::from_report(report),
                    Err(e) => {
                        warn!(service = %name, ?op, error = %e, "batch operation failed");
                        let status = self
                            .registry
                            .get(&id)
                            .map(|s| s.status)
                            .unwrap_or(ServiceStatus::Error);
                        Outcome::failed(&id, &name, status, &e)
                    }
                }
            })
            .buffer_unordered(self.settings.workers)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        outcomes
    }

    /// Start every service that has a start command and is not running.
    pub async fn auto_start_all(&self) -> Result<Vec<Outcome>, SupervisorError> {
        let targets: Vec<(String, String)> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.has_start_command() && !s.is_running())
            .map(|s| (s.id, s.name))
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = targets.len(), "auto-starting services");
        let outcomes = self.run_batch(BatchOp::Start, targets).await;
        let failed = outcomes.iter().filter(|o| !o.ok).count();
        info!(started = outcomes.len() - failed, failed, "auto-start finished");
        Ok(outcomes)
    }

    /// Stop every service that has a process.
    pub async fn stop_all(&self) -> Result<Vec<Outcome>, SupervisorError> {
        let targets: Vec<(String, String)> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.process_pid.is_some())
            .map(|s| (s.id, s.name))
            .collect();
        Ok(self.run_batch(BatchOp::Stop, targets).await)
    }

    /// Give every service a port of its own, rewrite URLs and dependent env
    /// overrides, then restart the moved services that were running.
    pub async fn resolve_port_conflicts_and_restart_affected(
        &self,
    ) -> Result<ConflictReport, SupervisorError> {
        // Stale RUNNING flags would otherwise win keeper selection
        self.list().await?;

        let outcome = {
            let _ports = self.port_lock.lock().await;
            let mut services = self.registry.list()?;
            let before = services.clone();
            let outcome = self.ports.resolve_conflicts(&mut services)?;
            for (svc, old) in services.iter().zip(before.iter()) {
                if svc != old {
                    self.registry
                        .update(&svc.id, &mut |stored| stored.apply_ports(svc))?;
                }
            }
            outcome
        };

        if outcome.is_empty() {
            debug!("no port conflicts");
        }

        let targets: Vec<(String, String)> = outcome
            .changes
            .iter()
            .filter(|c| c.was_running)
            .map(|c| (c.service_id.clone(), c.name.clone()))
            .collect();
        let restarts = self.run_batch(BatchOp::Restart, targets).await;

        Ok(ConflictReport {
            changes: outcome.changes,
            dependent_env_updates: outcome.dependent_env_updates,
            restarts,
        })
    }

    /// Reconcile every service once.
    pub async fn sweep(&self) -> Result<usize, SupervisorError> {
        let services = self.list().await?;
        Ok(services.iter().filter(|s| s.is_running()).count())
    }

    /// Sweep on the configured interval until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let Some(period) = self.settings.sweep_interval else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(running) => debug!(running, "sweep finished"),
                        Err(e) => warn!(error = %e, "sweep failed"),
                    }
                }
            }
        }
    }

    /// Port map of `range`, or the default band.
    pub fn port_map(&self, range: Option<PortRange>) -> Result<Vec<PortInfo>, SupervisorError> {
        let services = self.registry.list()?;
        let range = range.unwrap_or_else(|| self.ports.default_range());
        Ok(self.ports.port_map(&services, range)?)
    }

    pub fn next_port(&self) -> Result<u16, SupervisorError> {
        let services = self.registry.list()?;
        Ok(self.ports.next_available_port(&services)?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::harness;
    use super::*;
    use crate::ports::ConflictKind;
    use std::path::PathBuf;

    #[tokio::test]
    async fn auto_start_isolates_failures() {
        let h = harness();
        let good = h.register("alpha", "sleep 30");
        let bad = h.register("beta", "sleep 30");
        let also_good = h.register("gamma", "sleep 30");
        h.register("manual", "");
        h.supervisor
            .registry()
            .update(&bad.id, &mut |s| {
                s.working_directory = Some(PathBuf::from("/no/such/dir"))
            })
            .unwrap();

        let outcomes = h.supervisor.auto_start_all().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta", "gamma"]);

        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(outcomes[1].status, ServiceStatus::Error);
        assert!(outcomes[1].error.as_ref().unwrap().contains("working directory"));
        assert!(outcomes[2].ok);

        assert!(h.stored(&good.id).is_running());
        assert!(h.stored(&also_good.id).is_running());
        assert_eq!(h.stored(&bad.id).status, ServiceStatus::Error);

        // Second pass has nothing left but the broken service
        let again = h.supervisor.auto_start_all().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, bad.id);

        let stopped = h.supervisor.stop_all().await.unwrap();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|o| o.ok && o.status == ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn duplicate_ports_resolved_and_dependents_follow() {
        let h = harness();
        let api = h.register("api", "exec sleep 30 # {PORT}");
        let other = h.register("other", "exec sleep 30 # {PORT}");
        let web = h.register("web", "");
        let registry = h.supervisor.registry();
        registry
            .update(&api.id, &mut |s| {
                s.port = Some(4000);
                s.local_url = Some("http://127.0.0.1:4000".to_string());
            })
            .unwrap();
        registry
            .update(&other.id, &mut |s| {
                s.port = Some(4000);
                s.local_url = Some("http://127.0.0.1:4000".to_string());
            })
            .unwrap();
        let api_id = api.id.clone();
        let other_id = other.id.clone();
        registry
            .update(&web.id, &mut |s| {
                s.dependencies = vec![api_id.clone(), other_id.clone()];
                s.env_overrides
                    .insert("API_URL".to_string(), "http://127.0.0.1:4000/v1".to_string());
            })
            .unwrap();

        // Lowest id keeps the port when neither runs
        let (keeper, mover) = if api.id < other.id {
            (&api, &other)
        } else {
            (&other, &api)
        };

        let report = h
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await
            .unwrap();
        assert_eq!(report.changes.len(), 1);
        let change = &report.changes[0];
        assert_eq!(change.service_id, mover.id);
        assert_eq!(change.reason, ConflictKind::Duplicate);
        assert_eq!(change.old_port, 4000);
        assert_eq!(change.new_port, 4001);
        assert!(report.restarts.is_empty());

        assert_eq!(h.stored(&keeper.id).port, Some(4000));
        let moved = h.stored(&mover.id);
        assert_eq!(moved.port, Some(4001));
        assert_eq!(moved.local_url.as_deref(), Some("http://127.0.0.1:4001"));

        // Second run finds nothing to do
        let again = h
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await
            .unwrap();
        assert!(again.changes.is_empty());
        assert!(again.dependent_env_updates.is_empty());
    }

    #[tokio::test]
    async fn running_keeper_stays_put() {
        let h = harness();
        let runner = h.register("runner", "exec sleep 30 # {PORT}");
        let idle = h.register("idle", "exec sleep 30 # {PORT}");
        h.supervisor.start(&runner.id).await.unwrap();
        h.supervisor.start(&idle.id).await.unwrap();
        h.supervisor.stop(&idle.id).await.unwrap();
        let runner_port = h.stored(&runner.id).port.unwrap();

        // Point the stopped service at the running one's port
        h.supervisor
            .registry()
            .update(&idle.id, &mut |s| s.port = Some(runner_port))
            .unwrap();
        let report = h
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await
            .unwrap();
        // The running claimant keeps the port; the stopped one moves
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].service_id, idle.id);
        assert!(!report.changes[0].was_running);
        assert!(report.restarts.is_empty());

        // The running service's own bind does not make it move
        h.probe.bind(runner_port, "sleep (PID 9)");
        let old_pid = h.stored(&runner.id).process_pid;
        h.supervisor
            .registry()
            .update(&idle.id, &mut |s| s.port = Some(runner_port))
            .unwrap();
        let report = h
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await
            .unwrap();
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].service_id, idle.id);
        assert_eq!(h.stored(&runner.id).process_pid, old_pid);
        h.stop_all().await;
    }

    #[tokio::test]
    async fn controller_port_holder_moves_and_restarts() {
        let h = harness();
        let svc = h.register("squatter", "exec sleep 30 # {PORT}");
        h.supervisor.start(&svc.id).await.unwrap();
        let old_pid = h.stored(&svc.id).process_pid.unwrap();
        h.supervisor
            .registry()
            .update(&svc.id, &mut |s| s.port = Some(5010))
            .unwrap();

        let report = h
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await
            .unwrap();
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].reason, ConflictKind::Reserved);
        assert!(report.changes[0].was_running);
        assert_eq!(report.restarts.len(), 1);
        assert!(report.restarts[0].ok);

        let stored = h.stored(&svc.id);
        assert_eq!(stored.port, Some(4000));
        assert!(stored.is_running());
        assert_ne!(stored.process_pid, Some(old_pid));
        h.stop_all().await;
    }

    #[tokio::test]
    async fn sweep_counts_running() {
        let h = harness();
        let a = h.register("a", "sleep 30");
        h.register("b", "sleep 30");
        h.supervisor.start(&a.id).await.unwrap();
        assert_eq!(h.supervisor.sweep().await.unwrap(), 1);
        h.stop_all().await;
        assert_eq!(h.supervisor.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweeper_exits_on_cancel() {
        let h = harness();
        let cancel = CancellationToken::new();
        // No interval configured: returns immediately
        h.supervisor.clone().run_sweeper(cancel.clone()).await;
        cancel.cancel();
    }

    #[test]
    fn next_port_skips_claimed() {
        let h = harness();
        let svc = h.register("a", "");
        h.supervisor
            .registry()
            .update(&svc.id, &mut |s| s.port = Some(4000))
            .unwrap();
        h.probe.bind(4001, "x");
        assert_eq!(h.supervisor.next_port().unwrap(), 4002);

        let map = h
            .supervisor
            .port_map(Some(PortRange(4000, 4002)))
            .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[0].reserved_by_service_id.as_deref(), Some(svc.id.as_str()));
        assert!(map[1].in_use_on_host);
        assert!(!map[2].in_use_on_host);
    }
}
