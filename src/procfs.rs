//! Minimal `/proc` reading: just enough to walk a PID's parent chain and
//! read each ancestor's command name, for the remote-shell ancestry check.
//! Linux-only, matching the daemon's target platform; a dedicated
//! process-inspection crate would be overkill for two fields (`PPid`, `comm`).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcfsError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed /proc/{pid}/stat")]
    MalformedStat { pid: i32 },
}

/// The command name and parent PID of a process, as read from `/proc/<pid>`.
struct ProcInfo {
    comm: String,
    ppid: i32,
}

fn read_proc_info(pid: i32) -> Result<ProcInfo, ProcfsError> {
    let comm_path = PathBuf::from(format!("/proc/{pid}/comm"));
    let comm = std::fs::read_to_string(&comm_path)
        .map_err(|source| ProcfsError::Io { path: comm_path, source })?
        .trim_end()
        .to_owned();

    let stat_path = PathBuf::from(format!("/proc/{pid}/stat"));
    let stat = std::fs::read_to_string(&stat_path)
        .map_err(|source| ProcfsError::Io { path: stat_path, source })?;

    // Format: "pid (comm) state ppid ...". `comm` can itself contain spaces
    // and parentheses, so PPid is found relative to the *last* ')', not by
    // naive whitespace splitting from the front.
    let after_comm = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or(ProcfsError::MalformedStat { pid })?;
    let ppid: i32 = after_comm
        .split_whitespace()
        .nth(1)
        .ok_or(ProcfsError::MalformedStat { pid })?
        .parse()
        .map_err(|_| ProcfsError::MalformedStat { pid })?;

    Ok(ProcInfo { comm, ppid })
}

/// Walk `pid`'s ancestor chain (parent, grandparent, ...) up to PID 1,
/// returning true if any ancestor's `comm` matches one of `remote_names`.
///
/// Best-effort: a process that exits mid-walk, or a malformed `/proc` entry,
/// simply ends the walk early rather than erroring — this check is a barrier
/// against remote-shell sessions, not a security boundary (`SPEC_FULL.md` §4.4).
pub fn has_remote_shell_ancestor(pid: i32, remote_names: &[String]) -> bool {
    let mut current = pid;
    for _ in 0..64 {
        let Ok(info) = read_proc_info(current) else {
            return false;
        };
        if remote_names.iter().any(|name| name == &info.comm) {
            return true;
        }
        if info.ppid <= 1 || info.ppid == current {
            return false;
        }
        current = info.ppid;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ancestors_match_empty_list() {
        assert!(!has_remote_shell_ancestor(std::process::id() as i32, &[]));
    }

    #[test]
    fn nonexistent_pid_returns_false() {
        assert!(!has_remote_shell_ancestor(i32::MAX - 1, &["sshd".to_owned()]));
    }
}
