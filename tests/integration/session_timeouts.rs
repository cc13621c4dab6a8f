//! Scenario S6 (watcher sees every active-set transition) and the `Void`
//! request's idle-close timeout, both from `SPEC_FULL.md` §8/§4.2.

use std::time::Duration;
use tagauthd::coordinator::{Coordinator, CoordinatorMsg, CoordinatorSettings, PeerIdentity};
use tagauthd::session;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uid_core::{TranslationTable, Uid};

fn peer(pid: i32, uid: u32, username: &str) -> PeerIdentity {
    PeerIdentity {
        pid,
        uid,
        gid: uid,
        username: username.to_owned(),
    }
}

fn spawn_coordinator(
    dir: &tempfile::TempDir,
    client_force_close_socket_timeout: Duration,
) -> mpsc::UnboundedSender<CoordinatorMsg> {
    let settings = CoordinatorSettings {
        max_auth_request_wait: Duration::from_secs(5),
        client_force_close_socket_timeout,
        translation_table: TranslationTable::new(),
        credential_file_path: dir.path().join("creds.json"),
    };
    let coordinator = Coordinator::new(settings);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(coordinator.run(inbox_rx));
    inbox_tx
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
async fn s6_root_watcher_sees_each_active_set_transition() {
    let dir = tempfile::tempdir().unwrap();
    let inbox = spawn_coordinator(&dir, Duration::from_secs(60));

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(
        server,
        peer(1, 0, "root"),
        inbox.clone(),
        dir.path().join("creds.json"),
    ));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"WATCHUIDS\n").await.unwrap();

    set_active(&inbox, &["X"]).await;
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "UIDS X");

    set_active(&inbox, &["X", "Y"]).await;
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "UIDS X Y");

    set_active(&inbox, &["Y"]).await;
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "UIDS Y");
}

#[tokio::test]
async fn non_root_peer_is_refused_watchuids_without_reaching_the_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let inbox = spawn_coordinator(&dir, Duration::from_secs(60));

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(
        server,
        peer(2, 1000, "alice"),
        inbox.clone(),
        dir.path().join("creds.json"),
    ));

    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"WATCHUIDS\n").await.unwrap();

    assert_eq!(lines.next_line().await.unwrap().unwrap(), "NOAUTH");

    // The coordinator never saw a WatchUids request for this peer: a
    // subsequent active-set change produces no further output for it.
    set_active(&inbox, &["X"]).await;
    let next = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await;
    assert!(next.is_err(), "non-root peer should not receive a UIDS update");
}

#[tokio::test]
async fn void_session_is_force_closed_after_idle_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let inbox = spawn_coordinator(&dir, Duration::from_millis(50));

    let (server, client) = UnixStream::pair().unwrap();
    tokio::spawn(session::run(
        server,
        peer(3, 1000, "alice"),
        inbox.clone(),
        dir.path().join("creds.json"),
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    // A real listener's keepalive drives the expiry check; simulate one.
    inbox.send(CoordinatorMsg::ListenerKeepAlive).unwrap();

    let (read_half, _write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let closed = tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await;
    match closed {
        Ok(Ok(None)) => {}
        Ok(Ok(Some(line))) => panic!("expected socket close, got a line: {line}"),
        Ok(Err(e)) => panic!("unexpected read error: {e}"),
        Err(_) => panic!("session was not closed within the idle timeout"),
    }
}
