//! Scenarios S3 (add requires exactly one active UID) and S4 (del-all
//! preserves order) from `SPEC_FULL.md` §8, exercised end-to-end through the
//! Coordinator and Session Handler.
//!
//! Credential-file mutation happens in a forked child dropped to the peer's
//! uid/gid (`privilege::run_as_peer`); these tests hand the session the test
//! process's own uid so the "drop" is a same-to-same no-op that succeeds
//! whether the test runs as root or an unprivileged user.

use std::time::Duration;
use tagauthd::coordinator::{Coordinator, CoordinatorMsg, CoordinatorSettings, PeerIdentity};
use tagauthd::credential_store::CredentialStore;
use tagauthd::session;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uid_core::{TranslationTable, Uid};

fn self_identity(pid: i32, username: &str) -> PeerIdentity {
    let uid = nix::unistd::Uid::current().as_raw();
    PeerIdentity {
        pid,
        uid,
        gid: uid,
        username: username.to_owned(),
    }
}

async fn spawn_coordinator(
    dir: &tempfile::TempDir,
    entries: &[(String, String)],
    max_auth_request_wait: Duration,
) -> (mpsc::UnboundedSender<CoordinatorMsg>, std::path::PathBuf) {
    let credential_file_path = dir.path().join("creds.json");
    CredentialStore::write_entries_atomic(&credential_file_path, entries).unwrap();

    let settings = CoordinatorSettings {
        max_auth_request_wait,
        client_force_close_socket_timeout: Duration::from_secs(60),
        translation_table: TranslationTable::new(),
        credential_file_path: credential_file_path.clone(),
    };
    let coordinator = Coordinator::new(settings);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(coordinator.run(inbox_rx));
    (inbox_tx, credential_file_path)
}

async fn set_active(inbox: &mpsc::UnboundedSender<CoordinatorMsg>, uids: &[&str]) {
    let set = uids.iter().filter_map(|s| Uid::normalize(s)).collect();
    inbox
        .send(CoordinatorMsg::ListenerUpdate {
            listener_id: "test",
            uids: set,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn s3_adduser_times_out_with_two_uids_then_succeeds_with_one() {
    let dir = tempfile::tempdir().unwrap();
    let (inbox, creds_path) = spawn_coordinator(&dir, &[], Duration::from_millis(60)).await;
    set_active(&inbox, &["AA", "BB"]).await;

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(server, self_identity(1, "carol"), inbox.clone(), creds_path));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"ADDUSER carol 0.05\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    // Nudge the coordinator so it re-evaluates the now-expired request; a
    // real listener would have done this via its periodic keepalive.
    inbox.send(CoordinatorMsg::ListenerKeepAlive).unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "TIMEOUT");

    set_active(&inbox, &["AA"]).await;
    write_half.write_all(b"ADDUSER carol 5\n").await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "OK");
}

#[tokio::test]
async fn s4_del_all_preserves_order_of_other_entries() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        ("alice".to_owned(), CredentialStore::hash_uid("AAAA")),
        ("dave".to_owned(), CredentialStore::hash_uid("BBBB")),
        ("bob".to_owned(), CredentialStore::hash_uid("CCCC")),
        ("dave".to_owned(), CredentialStore::hash_uid("DDDD")),
        ("dave".to_owned(), CredentialStore::hash_uid("EEEE")),
    ];
    let (inbox, creds_path) = spawn_coordinator(&dir, &entries, Duration::from_secs(5)).await;

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(server, self_identity(2, "dave"), inbox, creds_path.clone()));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"DELUSER dave -1\n").await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "OK");

    // Give the privilege-dropped writer a moment to land the rename.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (store, err) = CredentialStore::open(&creds_path);
    assert!(err.is_none());
    let users: Vec<&str> = store.entries().iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(users, vec!["alice", "bob"]);
}
