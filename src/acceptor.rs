//! Connection Acceptor: binds the local socket, vets each incoming peer, and
//! spawns a Session Handler for the ones that pass.

use crate::coordinator::{CoordinatorMsg, PeerIdentity};
use crate::procfs;
use crate::session;
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("binding socket at '{path}': {source}")]
    Bind {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("setting socket permissions on '{path}': {source}")]
    Permissions {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bind the listening socket at `path`, removing a stale node left behind by
/// a previous crash, and set it world-read/writable per `SPEC_FULL.md` §6.
pub fn bind(path: &Path) -> Result<UnixListener, AcceptorError> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "removing stale socket node from a previous run");
        let _ = std::fs::remove_file(path);
    }
    let listener = UnixListener::bind(path).map_err(|source| AcceptorError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(|source| {
        AcceptorError::Permissions {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(listener)
}

/// Accept connections until `shutdown` fires, vetting each peer and spawning
/// a session task for the ones that pass.
pub async fn run(
    listener: UnixListener,
    coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
    remote_user_parent_process_names: Vec<String>,
    credential_file_path: std::path::PathBuf,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        handle_new_connection(
                            stream,
                            coordinator.clone(),
                            remote_user_parent_process_names.clone(),
                            credential_file_path.clone(),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

fn handle_new_connection(
    stream: UnixStream,
    coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
    remote_user_parent_process_names: Vec<String>,
    credential_file_path: std::path::PathBuf,
) {
    let Some(creds) = peer_credentials(&stream) else {
        tracing::debug!("peer credentials unavailable; closing connection");
        return;
    };

    if procfs::has_remote_shell_ancestor(creds.pid, &remote_user_parent_process_names) {
        tracing::info!(pid = creds.pid, "rejecting peer with a remote-shell ancestor");
        return;
    }

    let Some(username) = resolve_username(creds.uid) else {
        tracing::debug!(uid = creds.uid, "could not resolve peer uid to a username; closing connection");
        return;
    };

    let identity = PeerIdentity {
        pid: creds.pid,
        uid: creds.uid,
        gid: creds.gid,
        username,
    };

    tracing::info!(pid = identity.pid, user = %identity.username, "accepted session");
    tokio::spawn(session::run(stream, identity, coordinator, credential_file_path));
}

struct PeerCreds {
    pid: i32,
    uid: u32,
    gid: u32,
}

fn peer_credentials(stream: &UnixStream) -> Option<PeerCreds> {
    // SAFETY: `fd` is borrowed for the duration of this call only, and
    // `stream` (which owns it) outlives that call.
    let fd = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let creds = getsockopt(&fd, PeerCredentials).ok()?;
    Some(PeerCreds {
        pid: creds.pid(),
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

fn resolve_username(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}
