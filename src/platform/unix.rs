use tokio::process::Command;
use tracing::{debug, warn};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// No-op handle on Unix — process group cleanup uses killpg with the leader PID.
pub struct ProcessGroupHandle;

/// Return the user's default shell from `$SHELL`, falling back to `sh`.
fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
}

/// Human-readable description of the shell for log messages.
pub fn shell_name() -> String {
    let shell = user_shell();
    format!("{} -lc", shell)
}

pub fn shell_command(command: &str) -> Command {
    let shell = user_shell();
    let mut cmd = Command::new(&shell);
    // Login shell (-l) sources the user's profile/rc files so that
    // PATH and other environment customisations are available.
    cmd.arg("-l").arg("-c").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub fn post_spawn_setup(_child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    // On Unix, process group is configured before spawn via process_group(0).
    None
}

fn signal_group(pid: u32, signal: Signal) -> bool {
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, signal) {
        Ok(()) => {
            debug!(pid, ?signal, "signalled process group");
            true
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process group already exited");
            false
        }
        Err(e) => {
            warn!(pid, ?signal, error = %e, "killpg failed");
            false
        }
    }
}

pub fn request_stop(pid: u32) -> bool {
    signal_group(pid, Signal::SIGTERM)
}

pub fn force_kill_group(pid: u32, _group_handle: Option<&ProcessGroupHandle>) {
    signal_group(pid, Signal::SIGKILL);
}

#[cfg(target_os = "linux")]
pub fn identify_port_owner(port: u16) -> Option<String> {
    let port_hex = format!("{:04X}", port);

    let mut target_inode: Option<String> = None;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            // 0A = LISTEN
            if fields[3] != "0A" {
                continue;
            }
            if let Some(addr_port) = fields[1].rsplit(':').next() {
                if addr_port == port_hex {
                    target_inode = Some(fields[9].to_string());
                    break;
                }
            }
        }
        if target_inode.is_some() {
            break;
        }
    }

    let inode = target_inode?;
    if inode == "0" {
        return None;
    }

    let needle = format!("socket:[{}]", inode);
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let pid_str = entry.file_name().to_string_lossy().to_string();
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(fds) = std::fs::read_dir(format!("/proc/{}/fd", pid_str)) else {
            continue;
        };
        for fd_entry in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd_entry.path()) else {
                continue;
            };
            if link.to_string_lossy() != needle {
                continue;
            }
            let cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid_str))
                .map(|c| c.replace('\0', " ").trim().to_string())
                .unwrap_or_default();
            if cmdline.is_empty() {
                return Some(format!("PID {}", pid_str));
            }
            if cmdline.chars().count() > 60 {
                let short: String = cmdline.chars().take(57).collect();
                return Some(format!("{}... (PID {})", short, pid_str));
            }
            return Some(format!("{} (PID {})", cmdline, pid_str));
        }
    }

    None
}

#[cfg(not(target_os = "linux"))]
pub fn identify_port_owner(_port: u16) -> Option<String> {
    None
}
