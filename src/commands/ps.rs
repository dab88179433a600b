use anyhow::Result;
use is_terminal::IsTerminal;
use std::path::Path;

use crate::process::tree;
use crate::registry::{Registry, Service, ServiceStatus};
use crate::ui::summary::services_table;

use super::load_context;

pub fn run(config_file: Option<&Path>, data_dir: Option<&Path>, json: bool) -> Result<()> {
    let ctx = load_context(config_file, data_dir)?;
    let mut services: Vec<Service> = ctx
        .registry
        .list()?
        .into_iter()
        .map(live_view)
        .collect();
    services.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    if services.is_empty() {
        println!("No services registered.");
        println!("Run `nexus register --name <name> --command <cmd>` to add one.");
        return Ok(());
    }

    println!();
    println!("{}", services_table(&services, std::io::stdout().is_terminal()));
    println!();
    Ok(())
}

/// The service as the OS sees it right now. Read-only: the registry is left
/// for the controller to reconcile.
fn live_view(mut svc: Service) -> Service {
    match svc.process_pid {
        Some(pid) if tree::is_alive(pid, svc.process_start_time) => {
            svc.status = ServiceStatus::Running;
        }
        Some(_) => {
            if svc.status == ServiceStatus::Running {
                svc.status = ServiceStatus::Stopped;
            }
            svc.clear_process();
        }
        None => {
            if svc.status == ServiceStatus::Running {
                svc.status = ServiceStatus::Stopped;
            }
        }
    }
    svc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::fixtures;

    #[test]
    fn dead_pid_shown_stopped() {
        let mut svc = fixtures::service("a", "api");
        svc.status = ServiceStatus::Running;
        svc.process_pid = Some(2_000_000_000);
        let view = live_view(svc);
        assert_eq!(view.status, ServiceStatus::Stopped);
        assert!(view.process_pid.is_none());
    }

    #[test]
    fn live_pid_shown_running() {
        let mut svc = fixtures::service("a", "api");
        svc.process_pid = Some(std::process::id());
        assert_eq!(live_view(svc).status, ServiceStatus::Running);
    }

    #[test]
    fn error_kept_without_process() {
        let mut svc = fixtures::service("a", "api");
        svc.status = ServiceStatus::Error;
        assert_eq!(live_view(svc).status, ServiceStatus::Error);
    }
}
