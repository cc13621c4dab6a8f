//! End-to-end exercise of the Coordinator + Session Handler pair over a real
//! (in-process) socket, covering scenarios S1 and S2 from `SPEC_FULL.md` §8.
//! The Connection Acceptor itself (peer-credential lookup, ancestry check) is
//! bypassed: each test hands `session::run` an already-constructed
//! `PeerIdentity`, the same seam the Acceptor uses in production.

use std::collections::HashSet;
use std::time::Duration;
use tagauthd::coordinator::{Coordinator, CoordinatorMsg, CoordinatorSettings, PeerIdentity};
use tagauthd::credential_store::CredentialStore;
use tagauthd::session;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uid_core::{TranslationTable, Uid};

async fn spawn_coordinator(
    dir: &tempfile::TempDir,
    entries: &[(String, String)],
) -> (mpsc::UnboundedSender<CoordinatorMsg>, std::path::PathBuf) {
    let credential_file_path = dir.path().join("creds.json");
    CredentialStore::write_entries_atomic(&credential_file_path, entries).unwrap();

    let settings = CoordinatorSettings {
        max_auth_request_wait: Duration::from_secs(5),
        client_force_close_socket_timeout: Duration::from_secs(60),
        translation_table: TranslationTable::new(),
        credential_file_path: credential_file_path.clone(),
    };
    let coordinator = Coordinator::new(settings);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(coordinator.run(inbox_rx));
    (inbox_tx, credential_file_path)
}

fn peer(pid: i32, uid: u32, username: &str) -> PeerIdentity {
    PeerIdentity {
        pid,
        uid,
        gid: uid,
        username: username.to_owned(),
    }
}

async fn set_active(inbox: &mpsc::UnboundedSender<CoordinatorMsg>, uids: &[&str]) {
    let set: HashSet<Uid> = uids.iter().filter_map(|s| Uid::normalize(s)).collect();
    inbox
        .send(CoordinatorMsg::ListenerUpdate {
            listener_id: "test",
            uids: set,
        })
        .unwrap();
    // Let the coordinator's inbox drain before a client request races it.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn s1_self_auth_discloses_uid() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![("alice".to_owned(), CredentialStore::hash_uid("DEADBEEF"))];
    let (inbox, creds_path) = spawn_coordinator(&dir, &entries).await;
    set_active(&inbox, &["DEADBEEF"]).await;

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(server, peer(1, 1000, "alice"), inbox, creds_path));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"WAITAUTH alice 5\n").await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "AUTHOK DEADBEEF");
}

#[tokio::test]
async fn s2_cross_user_auth_withholds_uid() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![("bob".to_owned(), CredentialStore::hash_uid("CAFE1234"))];
    let (inbox, creds_path) = spawn_coordinator(&dir, &entries).await;
    set_active(&inbox, &["CAFE1234"]).await;

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(server, peer(2, 1000, "alice"), inbox, creds_path));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"WAITAUTH bob 5\n").await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "AUTHOK");
}

#[tokio::test]
async fn unparsable_line_is_ignored_and_session_stays_alive() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![("alice".to_owned(), CredentialStore::hash_uid("DEADBEEF"))];
    let (inbox, creds_path) = spawn_coordinator(&dir, &entries).await;
    set_active(&inbox, &["DEADBEEF"]).await;

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(server, peer(3, 1000, "alice"), inbox, creds_path));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"GARBAGE\n").await.unwrap();
    write_half.write_all(b"WAITAUTH alice 5\n").await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "AUTHOK DEADBEEF");
}
