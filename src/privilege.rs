//! Dropping from root to a connecting peer's identity before touching any
//! user-mutable resource (the credential file, in practice).
//!
//! A session handler that needs to persist a credential-file change does so
//! in a short-lived forked child: the child drops to the peer's uid/gid and
//! performs the write, then exits; the parent never regains root after the
//! fork and just waits on the exit status. This mirrors the out-of-process
//! pattern already used for CLI-driven reader backends, and keeps the
//! privilege drop scoped to one write instead of affecting the whole
//! multi-threaded daemon process.

use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Gid, Uid as NixUid};

/// The peer identity a session has already been associated with.
#[derive(Debug, Clone)]
pub struct DropTarget {
    pub uid: u32,
    pub gid: u32,
    pub supplementary_groups: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("dropping privileges failed: {0}")]
    Drop(nix::Error),
    #[error("waiting for privileged child failed: {0}")]
    Wait(nix::Error),
    #[error("privileged child exited abnormally")]
    AbnormalExit,
}

/// Drop the calling process to `target`'s uid/gid/supplementary groups and
/// set a restrictive umask. Must only be called in a process (or freshly
/// forked child) that will do nothing privileged afterward.
fn drop_to(target: &DropTarget) -> Result<(), nix::Error> {
    let groups: Vec<Gid> = target.supplementary_groups.iter().map(|g| Gid::from_raw(*g)).collect();
    nix::unistd::setgroups(&groups)?;
    let gid = Gid::from_raw(target.gid);
    nix::unistd::setresgid(gid, gid, gid)?;
    let uid = NixUid::from_raw(target.uid);
    nix::unistd::setresuid(uid, uid, uid)?;
    umask(Mode::from_bits_truncate(0o077));
    Ok(())
}

/// Run `write_fn` in a forked child process that has dropped to `target`'s
/// privileges first. Blocks the calling task's thread until the child exits;
/// callers on the async runtime should wrap this in `spawn_blocking`.
///
/// Returns `Ok(())` if the child reported success (exit code 0), and an error
/// otherwise — the session handler maps any error here to a `WRITEERR` wire
/// reply.
pub fn run_as_peer(target: &DropTarget, write_fn: impl FnOnce() -> bool) -> Result<(), PrivilegeError> {
    // SAFETY: the child performs only async-signal-safe work (privilege
    // syscalls and a single write+rename) before calling `_exit` without
    // returning to the async runtime or touching any multi-threaded state.
    match unsafe { nix::unistd::fork() }.map_err(PrivilegeError::Fork)? {
        ForkResult::Parent { child } => match waitpid(child, None).map_err(PrivilegeError::Wait)? {
            WaitStatus::Exited(_, 0) => Ok(()),
            _ => Err(PrivilegeError::AbnormalExit),
        },
        ForkResult::Child => {
            let ok = drop_to(target).is_ok() && write_fn();
            // `_exit` to skip running destructors for state inherited from
            // the parent (the tokio runtime, open sockets) that must not be
            // torn down twice. `std::process::exit` is not safe here: it
            // runs atexit handlers and flushes C stdio, neither of which is
            // async-signal-safe in a fork()ed child of a multithreaded process.
            nix::unistd::_exit(i32::from(!ok));
        }
    }
}
