use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

/// Start times from the OS process table are whole seconds; allow for
/// rounding between two reads.
const START_TIME_TOLERANCE_SECS: u64 = 1;

fn refresh_one(pid: u32) -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys
}

/// OS start time of `pid` in seconds since the epoch.
pub fn process_start_time(pid: u32) -> Option<u64> {
    let sys = refresh_one(pid);
    sys.process(Pid::from_u32(pid)).map(|p| p.start_time())
}

/// Whether `pid` names a live process. Zombies are dead. When
/// `expected_start_time` is given, a process with a different start time is
/// a recycled PID and counts as dead.
pub fn is_alive(pid: u32, expected_start_time: Option<u64>) -> bool {
    let sys = refresh_one(pid);
    let Some(process) = sys.process(Pid::from_u32(pid)) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return false;
    }
    match expected_start_time {
        Some(expected) => process.start_time().abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
        None => true,
    }
}

fn build_parent_map(sys: &System) -> HashMap<Pid, Vec<Pid>> {
    let mut parents: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            parents.entry(parent).or_default().push(*pid);
        }
    }
    parents
}

/// Collect `pid` and its descendants, children before parents. Processes
/// that started before `root_start_time` are skipped along with their
/// subtrees: they cannot belong to this tree and their PIDs were reused.
fn collect_tree(
    sys: &System,
    parents: &HashMap<Pid, Vec<Pid>>,
    pid: Pid,
    root_start_time: u64,
    seen: &mut HashSet<Pid>,
    out: &mut Vec<Pid>,
) {
    if !seen.insert(pid) {
        return;
    }
    let Some(process) = sys.process(pid) else {
        return;
    };
    if process.start_time() + START_TIME_TOLERANCE_SECS < root_start_time {
        debug!(pid = %pid, "skipping process that predates the tree root");
        return;
    }
    if let Some(children) = parents.get(&pid) {
        for child in children {
            collect_tree(sys, parents, *child, root_start_time, seen, out);
        }
    }
    out.push(pid);
}

/// `pid` and all of its descendants, children first. Empty when `pid` is
/// gone or is not the process that started at `expected_start_time`.
fn tree_members(sys: &System, pid: u32, expected_start_time: Option<u64>) -> Vec<Pid> {
    let root = Pid::from_u32(pid);
    let Some(root_process) = sys.process(root) else {
        return Vec::new();
    };
    let root_start = root_process.start_time();
    if let Some(expected) = expected_start_time {
        if root_start.abs_diff(expected) > START_TIME_TOLERANCE_SECS {
            debug!(pid, "pid was reused, not walking its tree");
            return Vec::new();
        }
    }

    let parents = build_parent_map(sys);
    let mut out = Vec::new();
    collect_tree(sys, &parents, root, root_start, &mut HashSet::new(), &mut out);
    out
}

#[cfg(test)]
pub(crate) fn tree_pids(pid: u32, expected_start_time: Option<u64>) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    tree_members(&sys, pid, expected_start_time)
        .into_iter()
        .map(|p| p.as_u32())
        .collect()
}

/// Send `signal` to `pid` and its descendants. Blocking: scans the whole
/// process table. Returns the number of processes signalled.
pub fn signal_tree(pid: u32, expected_start_time: Option<u64>, signal: Signal) -> usize {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let members = tree_members(&sys, pid, expected_start_time);

    let mut signalled = 0;
    for member in members {
        let Some(process) = sys.process(member) else {
            continue;
        };
        match process.kill_with(signal) {
            Some(true) => {
                debug!(pid = %member, name = ?process.name(), ?signal, "signalled process");
                signalled += 1;
            }
            Some(false) => debug!(pid = %member, ?signal, "signal not delivered"),
            None => {
                // Signal unsupported on this platform; only a hard kill is portable
                if signal == Signal::Kill {
                    warn!(pid = %member, "kill unsupported");
                } else if process.kill() {
                    signalled += 1;
                }
            }
        }
    }
    signalled
}

/// [`signal_tree`] on a blocking thread.
pub async fn signal_tree_async(pid: u32, expected_start_time: Option<u64>, signal: Signal) -> usize {
    tokio::task::spawn_blocking(move || signal_tree(pid, expected_start_time, signal))
        .await
        .unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let pid = std::process::id();
        let start = process_start_time(pid).unwrap();
        assert!(is_alive(pid, None));
        assert!(is_alive(pid, Some(start)));
    }

    #[test]
    fn start_time_mismatch_means_recycled() {
        let pid = std::process::id();
        let start = process_start_time(pid).unwrap();
        assert!(!is_alive(pid, Some(start.saturating_sub(3600))));
    }

    #[test]
    fn missing_pid_is_dead() {
        assert!(!is_alive(2_000_000_000, None));
        assert!(tree_pids(2_000_000_000, None).is_empty());
    }

    #[tokio::test]
    async fn tree_includes_grandchildren_and_dies_on_kill() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let members = tree_pids(pid, None);
        assert!(members.len() >= 2, "members: {members:?}");
        assert_eq!(*members.last().unwrap(), pid);

        let signalled = signal_tree_async(pid, process_start_time(pid), Signal::Kill).await;
        assert!(signalled >= 2);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
