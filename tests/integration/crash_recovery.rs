#![cfg(unix)]

use crate::common::*;
use serde_json::Value;
use std::time::Duration;

async fn service(base: &str, id: &str) -> Value {
    reqwest::get(format!("{base}/api/services/{id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn restarted_controller_adopts_running_service() {
    let controller = free_port();
    let project = TestProject::with_ports(controller, (46300, 46399));
    let id = project.register("api", "sleep 60");
    let base = format!("http://127.0.0.1:{controller}");

    let mut first = project.serve();
    assert!(wait_for_port(controller, Duration::from_secs(20)).await);
    let pid = service(&base, &id).await["process_pid"].as_u64().unwrap();

    // Hard-kill the controller; the service is in its own process group
    first.kill().await.unwrap();
    assert!(pid_alive(pid as u32));

    let mut second = project.serve();
    assert!(wait_for_port(controller, Duration::from_secs(20)).await);
    let svc = service(&base, &id).await;
    assert_eq!(svc["status"], "running");
    assert_eq!(svc["process_pid"].as_u64(), Some(pid), "must adopt, not respawn");

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/services/{id}/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(!pid_alive(pid as u32));

    interrupt(&mut second).await;
}

#[tokio::test]
async fn crash_is_detected_by_sweep() {
    let controller = free_port();
    let project = TestProject::with_ports(controller, (46400, 46499));
    let id = project.register("api", "exec sleep 60");
    let base = format!("http://127.0.0.1:{controller}");

    let mut server = project.serve();
    assert!(wait_for_port(controller, Duration::from_secs(20)).await);
    let pid = service(&base, &id).await["process_pid"].as_u64().unwrap() as u32;

    kill_pid(pid);
    // Sweep runs every second in this project
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let registry: Value =
        serde_json::from_str(&std::fs::read_to_string(project.registry_path()).unwrap()).unwrap();
    let stored = &registry["services"][0];
    assert_eq!(stored["status"], "error");
    assert!(stored["process_pid"].is_null());
    assert!(stored["last_error"].as_str().unwrap().contains("signal 9"));

    interrupt(&mut server).await;
}

#[tokio::test]
async fn stop_on_exit_stops_services() {
    let controller = free_port();
    let project = TestProject::with_ports(controller, (46500, 46599));
    let id = project.register("api", "exec sleep 60");
    let base = format!("http://127.0.0.1:{controller}");

    let mut server = project.serve_with(&["--stop-on-exit"]);
    assert!(wait_for_port(controller, Duration::from_secs(20)).await);
    let svc = service(&base, &id).await;
    assert_eq!(svc["status"], "running");

    interrupt(&mut server).await;

    let registry: Value =
        serde_json::from_str(&std::fs::read_to_string(project.registry_path()).unwrap()).unwrap();
    let stored = &registry["services"][0];
    assert_eq!(stored["status"], "stopped");
    assert!(stored["process_pid"].is_null());
}
