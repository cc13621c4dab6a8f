//! Session Handler: the per-client half of the wire protocol. Parses
//! request lines, forwards them to the Coordinator, and renders whatever
//! comes back onto the socket. Drops to the peer's privileges only for the
//! moment a credential-file write actually happens (see `privilege.rs`) —
//! everything else here runs at the daemon's own privilege level, since the
//! socket was already vetted by the Acceptor.

use crate::coordinator::{CoordinatorMsg, CoordinatorReply, PeerIdentity};
use crate::credential_store::CredentialStore;
use crate::privilege::{self, DropTarget};
use auth_protocol::{parse_request_line, ClientRequest, WireReply};
use nix::unistd::{getgrouplist, Uid as NixUid};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

pub async fn run(
    stream: UnixStream,
    identity: PeerIdentity,
    coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
    credential_file_path: PathBuf,
) {
    let pid = identity.pid;
    let is_root = identity.is_root();
    let peer_uid = identity.uid;
    let username = identity.username.clone();

    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = oneshot::channel();
    if coordinator
        .send(CoordinatorMsg::NewSession {
            pid,
            identity,
            replies: replies_tx,
            ack: ack_tx,
        })
        .is_err()
    {
        return;
    }
    if ack_rx.await.is_err() {
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            biased;

            reply = replies_rx.recv() => {
                let Some(reply) = reply else { return };
                if handle_reply(reply, &mut write_half, &credential_file_path, &username, peer_uid).await {
                    break;
                }
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        handle_line(&line, pid, is_root, &coordinator, &mut write_half).await;
                    }
                    Ok(None) | Err(_) => {
                        let _ = coordinator.send(CoordinatorMsg::SessionStopRequest { pid });
                        break;
                    }
                }
            }
        }
    }
}

/// Returns `true` if the session should now terminate.
async fn handle_reply(
    reply: CoordinatorReply,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    credential_file_path: &PathBuf,
    peer_username: &str,
    peer_uid: u32,
) -> bool {
    match reply {
        CoordinatorReply::AuthResult { ok, uids } => {
            let wire = if ok {
                WireReply::AuthOk(uids.unwrap_or_default())
            } else {
                WireReply::NoAuth
            };
            write_line(write_half, &wire).await;
            false
        }
        CoordinatorReply::NbUpdate { count, delta } => {
            write_line(write_half, &WireReply::NbUids { count, delta }).await;
            false
        }
        CoordinatorReply::UidsUpdate { uids } => {
            write_line(write_half, &WireReply::Uids(uids)).await;
            false
        }
        CoordinatorReply::EncrUpdate { new_entries } => {
            let wire = match persist_as_peer(credential_file_path.clone(), new_entries, peer_uid).await {
                Ok(()) => WireReply::Ok,
                Err(e) => {
                    tracing::warn!(user = peer_username, error = %e, "credential write failed");
                    WireReply::WriteErr
                }
            };
            write_line(write_half, &wire).await;
            false
        }
        CoordinatorReply::EncrUpdateErrExists => {
            write_line(write_half, &WireReply::Exists).await;
            false
        }
        CoordinatorReply::EncrUpdateErrNone => {
            write_line(write_half, &WireReply::None).await;
            false
        }
        CoordinatorReply::EncrUpdateErrTimeout => {
            write_line(write_half, &WireReply::Timeout).await;
            false
        }
        CoordinatorReply::VoidRequestTimeout => true,
        CoordinatorReply::Stop => true,
    }
}

async fn handle_line(
    line: &str,
    pid: i32,
    is_root: bool,
    coordinator: &mpsc::UnboundedSender<CoordinatorMsg>,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
) {
    let line = line.trim_end_matches(['\n', '\r']);
    match parse_request_line(line) {
        Ok(ClientRequest::WaitAuth { user, wait_secs }) => {
            let _ = coordinator.send(CoordinatorMsg::WaitAuth { pid, user, wait_secs });
        }
        Ok(ClientRequest::AddUser { user, wait_secs }) => {
            let _ = coordinator.send(CoordinatorMsg::AddUser { pid, user, wait_secs });
        }
        Ok(ClientRequest::DelUser { user, wait_secs }) => {
            let _ = coordinator.send(CoordinatorMsg::DelUser { pid, user, wait_secs });
        }
        Ok(ClientRequest::WatchCount) => {
            let _ = coordinator.send(CoordinatorMsg::WatchCount { pid });
        }
        Ok(ClientRequest::WatchUids) => {
            if is_root {
                let _ = coordinator.send(CoordinatorMsg::WatchUids { pid });
            } else {
                write_line(write_half, &WireReply::NoAuth).await;
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparsable client line");
        }
    }
}

async fn write_line(write_half: &mut tokio::net::unix::OwnedWriteHalf, reply: &WireReply) {
    let line = format!("{reply}\n");
    let _ = write_half.write_all(line.as_bytes()).await;
}

#[derive(Debug, thiserror::Error)]
enum PersistError {
    #[error("resolving peer uid {0}'s account: {1}")]
    UnknownPeer(u32, nix::Error),
    #[error(transparent)]
    Privilege(#[from] privilege::PrivilegeError),
}

/// Persist the Coordinator's proposed new credential entries, dropped to
/// the peer's privileges for the duration of the write (`SPEC_FULL.md` §4.3,
/// §9 — this is the load-bearing security boundary, not incidental). The
/// peer's account is resolved here, not at session start, so a plain
/// `WAITAUTH`/`WATCHNBUIDS` session never pays for (or can fail on) a
/// lookup it doesn't need.
async fn persist_as_peer(path: PathBuf, new_entries: Vec<(String, String)>, peer_uid: u32) -> Result<(), PersistError> {
    let target = lookup_drop_target(peer_uid).map_err(|e| PersistError::UnknownPeer(peer_uid, e))?;
    tokio::task::spawn_blocking(move || {
        privilege::run_as_peer(&target, || CredentialStore::write_entries_atomic(&path, &new_entries).is_ok())
    })
    .await
    .expect("privilege-drop task panicked")
    .map_err(PersistError::from)
}

fn lookup_drop_target(uid: u32) -> Result<DropTarget, nix::Error> {
    let nix_uid = NixUid::from_raw(uid);
    let user = nix::unistd::User::from_uid(nix_uid)?.ok_or(nix::Error::ESRCH)?;
    let groups = getgrouplist(
        &std::ffi::CString::new(user.name.as_str()).expect("username has no interior nul"),
        user.gid,
    )?;
    Ok(DropTarget {
        uid,
        gid: user.gid.as_raw(),
        supplementary_groups: groups.into_iter().map(|g| g.as_raw()).collect(),
    })
}
