use crate::common::*;
use predicates::prelude::*;

#[test]
fn missing_config_file_is_an_error() {
    let project = TestProject::new("");
    assert_cmd::Command::cargo_bin("nexus")
        .unwrap()
        .current_dir(project.path())
        .args(["-f", "does-not-exist.toml", "ps"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn invalid_config_lists_errors() {
    let project = TestProject::new(
        r#"
[ports]
range_start = 4000
range_end = 3000

[supervisor]
workers = 0
"#,
    );
    project
        .cmd()
        .arg("ps")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration errors"));
}

#[test]
fn data_dir_is_relative_to_config_file() {
    let project = TestProject::new("[controller]\ndata_dir = \"state\"\n");
    project.register("api", "sleep 30");
    assert!(project.path().join("state/services.json").is_file());
}

#[test]
fn data_dir_flag_overrides_config() {
    let project = TestProject::new("");
    let other = tempfile::TempDir::new().unwrap();
    project
        .cmd()
        .arg("--data-dir")
        .arg(other.path())
        .args(["register", "--name", "api", "--command", "sleep 30"])
        .assert()
        .success();
    assert!(other.path().join("services.json").is_file());
    assert!(!project.registry_path().exists());
}
