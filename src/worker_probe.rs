//! Sync-worker process probe
//!
//! The runner tracks its own children, but a crashed parent or a lost map
//! entry can leave a worker orphaned. This probe enumerates OS processes
//! and matches the worker's argv (`sync-worker --job-id <id>`) so zombies
//! can be found and finalized.

use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

/// Argv marker of the subprocess entry point
const WORKER_ARG: &str = "sync-worker";

fn cmdline_matches(cmd: &[std::ffi::OsString], job_id: &str) -> bool {
    let mut saw_worker = false;
    let mut saw_job_flag = false;
    let mut saw_job_id = false;
    for part in cmd {
        let s = part.to_string_lossy();
        if s.contains(WORKER_ARG) {
            saw_worker = true;
        }
        if s.contains("--job-id") {
            saw_job_flag = true;
        }
        if s.contains(job_id) {
            saw_job_id = true;
        }
    }
    saw_worker && saw_job_flag && saw_job_id
}

/// Find running sync-worker processes for a job id
pub fn find_worker_pids(job_id: &str) -> Vec<Pid> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .filter(|(_, p)| cmdline_matches(p.cmd(), job_id))
        .map(|(pid, _)| *pid)
        .collect()
}

/// Whether a worker for this job id is still alive
pub fn is_worker_running(job_id: &str) -> bool {
    !find_worker_pids(job_id).is_empty()
}

/// Terminate one process by pid (used by the runner for tracked children)
pub fn kill_pid(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(process) = sys.process(pid) {
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
    }
}

/// Terminate then kill any worker process for this job id
///
/// Returns whether any process was signalled.
pub fn kill_worker(job_id: &str) -> bool {
    let pids = find_worker_pids(job_id);
    if pids.is_empty() {
        return false;
    }

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    let mut killed_any = false;
    for pid in &pids {
        let Some(process) = sys.process(*pid) else {
            continue;
        };
        // Graceful terminate first; SIGTERM is unsupported on some platforms.
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
        killed_any = true;
    }

    std::thread::sleep(Duration::from_millis(1500));
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    for pid in &pids {
        if let Some(process) = sys.process(*pid) {
            process.kill();
        }
    }
    killed_any
}
