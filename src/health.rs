use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::registry::Service;
use crate::supervisor::Supervisor;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of probing one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub id: String,
    pub name: String,
    /// `None` when the service has nothing to probe.
    pub healthy: Option<bool>,
    pub target: Option<String>,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe `healthcheck_url` over HTTP, or the service's port over TCP when no
/// URL is set. Any status below 500 counts as healthy.
pub async fn probe_service(svc: &Service, host: &str) -> ServiceHealth {
    let mut health = ServiceHealth {
        id: svc.id.clone(),
        name: svc.name.clone(),
        healthy: None,
        target: None,
        latency_ms: None,
        error: None,
    };

    let started = Instant::now();
    let result = if let Some(url) = &svc.healthcheck_url {
        health.target = Some(url.clone());
        http_probe(url).await
    } else if let Some(port) = svc.port {
        let addr = format!("{}:{}", host, port);
        health.target = Some(addr.clone());
        tcp_probe(&addr).await
    } else {
        return health;
    };

    health.latency_ms = Some(started.elapsed().as_millis() as u64);
    match result {
        Ok(()) => health.healthy = Some(true),
        Err(e) => {
            debug!(service = %svc.name, error = %e, "health probe failed");
            health.healthy = Some(false);
            health.error = Some(format!("{:#}", e));
        }
    }
    health
}

async fn http_probe(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("building HTTP client")?;
    let response = client.get(url).send().await.context("HTTP health check")?;
    if response.status().is_server_error() {
        bail!("HTTP health check returned status {}", response.status());
    }
    Ok(())
}

async fn tcp_probe(addr: &str) -> Result<()> {
    tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr))
        .await
        .context("TCP connect timed out")?
        .context("TCP connect failed")?;
    Ok(())
}

/// Controller self-check.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub ok: bool,
    pub services: usize,
    pub registry_error: Option<String>,
    pub log_dir_error: Option<String>,
}

/// The controller is healthy when the registry can be read and the log
/// directory accepts writes.
pub fn controller_health(supervisor: &Supervisor) -> ControllerHealth {
    let (services, registry_error) = match supervisor.registry().list() {
        Ok(list) => (list.len(), None),
        Err(e) => (0, Some(e.to_string())),
    };
    let log_dir_error = check_writable(supervisor.launcher().log_dir())
        .err()
        .map(|e| format!("{:#}", e));
    ControllerHealth {
        ok: registry_error.is_none() && log_dir_error.is_none(),
        services,
        registry_error,
        log_dir_error,
    }
}

fn check_writable(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating {}", dir.display()))?;
    let probe = dir.join(".nexus-write-check");
    std::fs::write(&probe, b"ok").with_context(|| format!("writing to {}", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::fixtures;

    #[tokio::test]
    async fn nothing_to_probe() {
        let svc = fixtures::service("a", "worker");
        let health = probe_service(&svc, "127.0.0.1").await;
        assert_eq!(health.healthy, None);
        assert!(health.target.is_none());
    }

    #[tokio::test]
    async fn tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let svc = fixtures::with_port("a", "db", port);

        let health = probe_service(&svc, "127.0.0.1").await;
        assert_eq!(health.healthy, Some(true));
        assert_eq!(health.target, Some(format!("127.0.0.1:{port}")));

        drop(listener);
        let health = probe_service(&svc, "127.0.0.1").await;
        assert_eq!(health.healthy, Some(false));
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn http_probe_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut svc = fixtures::service("a", "api");
        svc.healthcheck_url = Some(format!("http://127.0.0.1:{port}/health"));

        let health = probe_service(&svc, "127.0.0.1").await;
        assert_eq!(health.healthy, Some(false));
    }

    #[test]
    fn writable_dir_passes() {
        let tmp = tempfile::TempDir::new().unwrap();
        check_writable(&tmp.path().join("logs")).unwrap();
        assert!(!tmp.path().join("logs/.nexus-write-check").exists());
    }
}
