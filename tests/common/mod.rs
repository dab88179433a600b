#![allow(dead_code)]
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestProject {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProject {
    /// A project whose `nexus.toml` contains `config_toml`. The controller
    /// port and port band are randomised unless the snippet sets them.
    pub fn new(config_toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("nexus.toml");
        std::fs::write(&config_path, config_toml).unwrap();
        Self { dir, config_path }
    }

    pub fn with_ports(controller_port: u16, range: (u16, u16)) -> Self {
        Self::new(&format!(
            r#"
[controller]
port = {controller_port}

[ports]
range_start = {}
range_end = {}

[process]
grace_ms = 2000
startup_probe_ms = 300

[supervisor]
sweep_interval_secs = 1
"#,
            range.0, range.1
        ))
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.path().join(".nexus/services.json")
    }

    /// `nexus -f <config>` run from the project directory.
    pub fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("nexus").unwrap();
        cmd.current_dir(self.dir.path())
            .env_remove("NEXUS_DATA_DIR")
            .env_remove("NEXUS_HOST")
            .env_remove("NEXUS_PORT")
            .arg("-f")
            .arg(&self.config_path);
        cmd
    }

    /// Register a service and return its id.
    pub fn register(&self, name: &str, command: &str) -> String {
        let out = self
            .cmd()
            .args(["register", "--name", name, "--command", command])
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "register failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    /// Spawn `nexus serve` in the background.
    pub fn serve(&self) -> tokio::process::Child {
        self.serve_with(&[])
    }

    pub fn serve_with(&self, extra: &[&str]) -> tokio::process::Child {
        tokio::process::Command::new(env!("CARGO_BIN_EXE_nexus"))
            .current_dir(self.dir.path())
            .env_remove("NEXUS_DATA_DIR")
            .env_remove("NEXUS_HOST")
            .env_remove("NEXUS_PORT")
            .args(["-f", self.config_path.to_str().unwrap(), "serve"])
            .args(extra)
            .kill_on_drop(true)
            .spawn()
            .expect("failed to start nexus")
    }
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send SIGINT and wait for the controller to exit.
pub async fn interrupt(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGINT,
            )
            .ok();
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(15), child.wait()).await;
}

pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .ok();
    }
}
