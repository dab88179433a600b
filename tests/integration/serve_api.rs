#![cfg(unix)]

use crate::common::*;
use serde_json::Value;
use std::time::Duration;

async fn get_json(url: &str) -> Value {
    reqwest::get(url).await.unwrap().json().await.unwrap()
}

async fn post_json(url: &str) -> (u16, Value) {
    let resp = reqwest::Client::new().post(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

fn find<'a>(services: &'a Value, id: &str) -> &'a Value {
    services
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["id"] == id)
        .unwrap()
}

#[tokio::test]
async fn serve_auto_starts_and_controls_services() {
    let controller = free_port();
    let project = TestProject::with_ports(controller, (46100, 46199));
    let web = project.register("web", "echo port={PORT}; exec sleep 30");
    let broken = project.register("broken", "sleep 30");
    project
        .cmd()
        .args(["register", "--name", "idle"])
        .assert()
        .success();
    // Point one service at a directory that does not exist
    let path = project.registry_path();
    let mut file: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    for svc in file["services"].as_array_mut().unwrap() {
        if svc["id"] == broken.as_str() {
            svc["working_directory"] = "/no/such/dir".into();
        }
    }
    std::fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

    let mut server = project.serve();
    assert!(
        wait_for_port(controller, Duration::from_secs(20)).await,
        "controller did not come up"
    );
    let base = format!("http://127.0.0.1:{controller}");

    let services = get_json(&format!("{base}/api/services")).await;
    let web_svc = find(&services, &web);
    assert_eq!(web_svc["status"], "running");
    let port = web_svc["port"].as_u64().unwrap();
    assert!((46100..=46199).contains(&port));
    let pid = web_svc["process_pid"].as_u64().unwrap() as u32;
    assert!(pid_alive(pid));

    let broken_svc = find(&services, &broken);
    assert_eq!(broken_svc["status"], "error");
    assert!(broken_svc["last_error"]
        .as_str()
        .unwrap()
        .contains("working directory not found"));

    // Services without a command are left alone
    let idle = services
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == "idle")
        .unwrap();
    assert_eq!(idle["status"], "stopped");

    // The command saw its allocated port
    tokio::time::sleep(Duration::from_millis(300)).await;
    project
        .cmd()
        .args(["logs", "web", "-n", "20"])
        .assert()
        .success()
        .stdout(predicates::str::contains(format!("port={port}")));

    let (code, body) = post_json(&format!("{base}/api/services/{web}/start")).await;
    assert_eq!(code, 200);
    assert_eq!(body["pid"].as_u64(), Some(pid as u64), "double start must not spawn");

    let (code, body) = post_json(&format!("{base}/api/services/{web}/stop")).await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "stopped");
    assert!(!pid_alive(pid));

    let (code, body) = post_json(&format!("{base}/api/services/{broken}/start")).await;
    assert_eq!(code, 422);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("/no/such/dir"));

    // A stopped service keeps its port claim
    let next = get_json(&format!("{base}/api/ports/next")).await;
    let next = next["port"].as_u64().unwrap();
    assert_ne!(next, port);
    assert!((46100..=46199).contains(&next));

    interrupt(&mut server).await;
}

#[tokio::test]
async fn services_outlive_the_controller() {
    let controller = free_port();
    let project = TestProject::with_ports(controller, (46200, 46299));
    let id = project.register("api", "sleep 30");

    let mut server = project.serve();
    assert!(wait_for_port(controller, Duration::from_secs(20)).await);
    let base = format!("http://127.0.0.1:{controller}");
    let svc = get_json(&format!("{base}/api/services/{id}")).await;
    let pid = svc["process_pid"].as_u64().unwrap() as u32;

    interrupt(&mut server).await;
    assert!(pid_alive(pid), "service should keep running after shutdown");

    project
        .cmd()
        .arg("ps")
        .assert()
        .success()
        .stdout(predicates::str::contains("running"));

    kill_pid(pid);
}
