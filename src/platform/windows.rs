use std::ffi::c_void;
use tokio::process::Command;
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    OpenProcess, TerminateProcess, CREATE_NEW_PROCESS_GROUP, PROCESS_SET_QUOTA,
    PROCESS_TERMINATE,
};

/// Holds a Windows Job Object handle for process group management.
pub struct ProcessGroupHandle {
    job: *mut c_void,
}

impl Drop for ProcessGroupHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.job);
        }
    }
}

// SAFETY: Job object handles are thread-safe Windows kernel objects.
unsafe impl Send for ProcessGroupHandle {}
unsafe impl Sync for ProcessGroupHandle {}

pub fn shell_name() -> String {
    "cmd.exe /C".to_string()
}

pub fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub fn post_spawn_setup(child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    let pid = child_pid?;
    unsafe {
        let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
        if job.is_null() {
            warn!("CreateJobObjectW failed");
            return None;
        }

        let proc_handle = OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid);
        if proc_handle.is_null() {
            warn!(pid, "OpenProcess failed for job assignment");
            CloseHandle(job);
            return None;
        }

        let result = AssignProcessToJobObject(job, proc_handle);
        CloseHandle(proc_handle);

        if result == 0 {
            warn!(pid, "AssignProcessToJobObject failed");
            CloseHandle(job);
            return None;
        }

        Some(ProcessGroupHandle { job })
    }
}

pub fn request_stop(pid: u32) -> bool {
    unsafe {
        if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 {
            debug!(pid, "sent CTRL_BREAK_EVENT");
            return true;
        }
    }
    false
}

pub fn force_kill_group(pid: u32, group_handle: Option<&ProcessGroupHandle>) {
    unsafe {
        if let Some(handle) = group_handle {
            if TerminateJobObject(handle.job, 1) != 0 {
                debug!(pid, "terminated job object");
                return;
            }
        }
        let proc_handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if proc_handle.is_null() {
            return;
        }
        TerminateProcess(proc_handle, 1);
        CloseHandle(proc_handle);
    }
}

pub fn identify_port_owner(_port: u16) -> Option<String> {
    // TODO: implement via GetExtendedTcpTable from Win32_NetworkManagement_IpHelper
    None
}
