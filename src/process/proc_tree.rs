//! Best-effort OS process-tree inspection and termination. A process that
//! is already gone, or that we may not touch, is never an error here; the
//! run's state is reconciled by status logic either way.

use std::time::Duration;
use tokio::time::sleep;

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Full command line of a process, or `None` when it does not exist or
/// cannot be read.
#[cfg(unix)]
pub fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() { None } else { Some(joined) }
}

#[cfg(not(unix))]
pub fn cmdline(_pid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Recursively enumerated descendant pids, deepest last. Taken as a
/// snapshot of the /proc parent table, not a live graph, so enumeration
/// cannot race against termination.
#[cfg(unix)]
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut parent_of: Vec<(u32, u32)> = Vec::new();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(child) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{child}/stat")) else {
            continue;
        };
        // stat field layout: pid (comm) state ppid ...; comm may contain
        // spaces, so split after the closing paren.
        let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
            continue;
        };
        let Some(ppid) = rest.split_whitespace().nth(1).and_then(|s| s.parse().ok()) else {
            continue;
        };
        parent_of.push((child, ppid));
    }

    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(current) = frontier.pop() {
        for (child, parent) in &parent_of {
            if *parent == current && !result.contains(child) {
                result.push(*child);
                frontier.push(*child);
            }
        }
    }
    result
}

#[cfg(not(unix))]
pub fn descendants(_pid: u32) -> Vec<u32> {
    Vec::new()
}

/// Terminates a process and its whole descendant tree, with a bounded wait
/// for each to die. Missing processes and permission errors are ignored.
pub async fn kill_tree(pid: u32, timeout: Duration) {
    if pid == std::process::id() {
        tracing::warn!("Refusing to kill own process tree (pid {pid})");
        return;
    }

    #[cfg(unix)]
    {
        let mut targets = descendants(pid);
        targets.push(pid);

        for target in &targets {
            // SAFETY: plain kill(2) syscall; failure (ESRCH/EPERM) is ignored
            unsafe {
                libc::kill(*target as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if targets.iter().all(|t| !process_exists(*t)) {
                return;
            }
            sleep(KILL_POLL_INTERVAL).await;
        }

        for target in &targets {
            if process_exists(*target) {
                tracing::debug!("Process {target} survived SIGTERM, sending SIGKILL");
                unsafe {
                    libc::kill(*target as libc::pid_t, libc::SIGKILL);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = timeout;
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
}
