use serde::Serialize;
use tracing::warn;

use super::{Supervisor, SupervisorError};
use crate::registry::{Service, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The service's port is bound while the service is not running.
    PortConflict,
    MissingStartCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub services: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub ports_reserved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub totals: Totals,
    pub alerts: Vec<Alert>,
}

impl Supervisor {
    /// Status totals over every service, plus the problems worth a look.
    pub async fn summary(&self) -> Result<Summary, SupervisorError> {
        let services = self.list().await?;
        let mut summary = Summary {
            totals: Totals {
                services: services.len(),
                ..Default::default()
            },
            alerts: Vec::new(),
        };

        for svc in &services {
            match svc.status {
                ServiceStatus::Running => summary.totals.running += 1,
                ServiceStatus::Stopped => summary.totals.stopped += 1,
                ServiceStatus::Error => summary.totals.error += 1,
            }
            if let Some(port) = svc.port {
                summary.totals.ports_reserved += 1;
                if let Some(alert) = self.port_alert(svc, port) {
                    summary.alerts.push(alert);
                }
            }
            if !svc.has_start_command() {
                summary.alerts.push(Alert {
                    kind: AlertKind::MissingStartCommand,
                    message: format!("{} has no start command.", svc.name),
                    service_id: svc.id.clone(),
                });
            }
        }
        Ok(summary)
    }

    fn port_alert(&self, svc: &Service, port: u16) -> Option<Alert> {
        if svc.is_running() {
            return None;
        }
        match self.ports.in_use(port) {
            Ok(true) => {
                let holder = self
                    .ports
                    .owner(port)
                    .map(|owner| format!(" by {}", owner))
                    .unwrap_or_default();
                Some(Alert {
                    kind: AlertKind::PortConflict,
                    message: format!(
                        "Port {} is in use{} but {} is not running.",
                        port, holder, svc.name
                    ),
                    service_id: svc.id.clone(),
                })
            }
            Ok(false) => None,
            Err(e) => {
                warn!(service = %svc.name, port, error = %e, "could not probe port");
                None
            }
        }
    }
}
