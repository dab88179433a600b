use crate::common::*;
use predicates::prelude::*;

#[test]
fn register_then_ps_lists_service() {
    let project = TestProject::new("");
    let id = project.register("api", "npm run dev -- --port {PORT}");
    assert_eq!(id.len(), 36, "expected a uuid, got {id}");

    project
        .cmd()
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("api"))
        .stdout(predicate::str::contains("stopped"));

    let out = project.cmd().args(["ps", "--json"]).output().unwrap();
    let services: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(services[0]["id"], id.as_str());
    assert_eq!(services[0]["start_command"], "npm run dev -- --port {PORT}");
    assert_eq!(services[0]["status"], "stopped");
}

#[test]
fn register_rejects_blank_name() {
    let project = TestProject::new("");
    project
        .cmd()
        .args(["register", "--name", " ", "--command", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("service name must not be empty"));
}

#[test]
fn ps_with_empty_registry() {
    let project = TestProject::new("");
    project
        .cmd()
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("No services registered"));
}

#[test]
fn ps_shows_dead_pid_as_stopped() {
    let project = TestProject::new("");
    let id = project.register("api", "sleep 30");

    // Simulate a controller that died while the service ran
    let path = project.registry_path();
    let mut file: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    file["services"][0]["status"] = "running".into();
    file["services"][0]["process_pid"] = 2_000_000_000u32.into();
    std::fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

    let out = project.cmd().args(["ps", "--json"]).output().unwrap();
    let services: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(services[0]["id"], id.as_str());
    assert_eq!(services[0]["status"], "stopped");
}

#[test]
fn logs_for_unknown_service_suggests_name() {
    let project = TestProject::new("");
    project.register("frontend", "true");
    project
        .cmd()
        .args(["logs", "fronted"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("did you mean 'frontend'"));
}

#[test]
fn logs_for_never_started_service_is_empty() {
    let project = TestProject::new("");
    project.register("api", "true");
    project
        .cmd()
        .args(["logs", "api"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
