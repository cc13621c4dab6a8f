//! The Coordinator: single owner of the merged active-UID set, per-client
//! session state, the authentication cache, and the in-memory credential
//! store. Everything here runs on one task and is driven purely by messages
//! arriving on its inbox, so no locks are needed — ordering is whatever order
//! the inbox delivers in.

use crate::credential_store::CredentialStore;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uid_core::{TranslationTable, Uid};

/// A session's current outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Void,
    WaitAuth { user: String },
    AddUser { user: String },
    DelUser { user: String },
    DelAllUser { user: String },
    WatchCount,
    WatchUids,
}

/// Identity captured at accept time, carried along for logging and for the
/// `WATCHUIDS` superuser check.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

impl PeerIdentity {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Messages the Coordinator accepts on its inbox.
pub enum CoordinatorMsg {
    ListenerUpdate {
        listener_id: &'static str,
        uids: HashSet<Uid>,
    },
    ListenerKeepAlive,
    NewSession {
        pid: i32,
        identity: PeerIdentity,
        replies: mpsc::UnboundedSender<CoordinatorReply>,
        ack: tokio::sync::oneshot::Sender<()>,
    },
    SessionStopRequest {
        pid: i32,
    },
    WaitAuth {
        pid: i32,
        user: String,
        wait_secs: f64,
    },
    AddUser {
        pid: i32,
        user: String,
        wait_secs: f64,
    },
    DelUser {
        pid: i32,
        user: String,
        wait_secs: f64,
    },
    WatchCount {
        pid: i32,
    },
    WatchUids {
        pid: i32,
    },
}

/// Messages the Coordinator sends back to a specific session's reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorReply {
    AuthResult { ok: bool, uids: Option<Vec<String>> },
    NbUpdate { count: usize, delta: i64 },
    UidsUpdate { uids: Vec<String> },
    /// The Coordinator's proposed new credential-file contents; the session
    /// handler must persist them at the peer's privilege level and report
    /// back success or failure, not the Coordinator.
    EncrUpdate { new_entries: Vec<(String, String)> },
    EncrUpdateErrExists,
    EncrUpdateErrNone,
    EncrUpdateErrTimeout,
    VoidRequestTimeout,
    Stop,
}

struct Session {
    identity: PeerIdentity,
    request: RequestKind,
    expires_at: Option<Instant>,
    replies: mpsc::UnboundedSender<CoordinatorReply>,
}

/// Tunables the Coordinator needs that otherwise live in `Config`.
pub struct CoordinatorSettings {
    pub max_auth_request_wait: Duration,
    pub client_force_close_socket_timeout: Duration,
    pub translation_table: TranslationTable,
    pub credential_file_path: std::path::PathBuf,
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    listener_snapshots: HashMap<&'static str, HashSet<Uid>>,
    active_set: HashSet<Uid>,
    /// Whether any `ListenerUpdate` has ever landed. A watcher that
    /// subscribes before this is set has nothing to be shown yet; one that
    /// subscribes after it is set gets the current snapshot immediately.
    baseline_established: bool,
    sessions: HashMap<i32, Session>,
    credential_store: CredentialStore,
    auth_cache: HashMap<String, (bool, HashSet<Uid>)>,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        let (credential_store, err) = CredentialStore::open(&settings.credential_file_path);
        if let Some(err) = err {
            tracing::warn!(error = %err, "credential file unreadable or malformed at startup; serving with an empty store");
        }
        Coordinator {
            settings,
            listener_snapshots: HashMap::new(),
            active_set: HashSet::new(),
            baseline_established: false,
            sessions: HashMap::new(),
            credential_store,
            auth_cache: HashMap::new(),
        }
    }

    /// Drive the Coordinator until its inbox closes (all senders dropped).
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CoordinatorMsg>) {
        while let Some(msg) = inbox.recv().await {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: CoordinatorMsg) {
        let mut uids_changed = false;
        let mut prev_active_set: Option<HashSet<Uid>> = None;

        match msg {
            CoordinatorMsg::ListenerUpdate { listener_id, uids } => {
                self.baseline_established = true;
                self.listener_snapshots.insert(listener_id, uids);
                let merged = self.recompute_active_set();
                if merged != self.active_set {
                    prev_active_set = Some(std::mem::replace(&mut self.active_set, merged));
                    uids_changed = true;
                    self.auth_cache.clear();
                }
            }
            CoordinatorMsg::ListenerKeepAlive => {}
            CoordinatorMsg::NewSession {
                pid,
                identity,
                replies,
                ack,
            } => {
                self.sessions.insert(
                    pid,
                    Session {
                        identity,
                        request: RequestKind::Void,
                        expires_at: Some(Instant::now() + self.settings.client_force_close_socket_timeout),
                        replies,
                    },
                );
                let _ = ack.send(());
            }
            CoordinatorMsg::SessionStopRequest { pid } => {
                if let Some(session) = self.sessions.remove(&pid) {
                    let _ = session.replies.send(CoordinatorReply::Stop);
                }
            }
            CoordinatorMsg::WaitAuth { pid, user, wait_secs } => {
                self.set_request(pid, RequestKind::WaitAuth { user }, wait_secs);
            }
            CoordinatorMsg::AddUser { pid, user, wait_secs } => {
                self.set_request(pid, RequestKind::AddUser { user }, wait_secs);
            }
            CoordinatorMsg::DelUser { pid, user, wait_secs } => {
                if wait_secs < 0.0 {
                    self.set_del_all(pid, user);
                } else {
                    self.set_request(pid, RequestKind::DelUser { user }, wait_secs);
                }
            }
            CoordinatorMsg::WatchCount { pid } => {
                self.set_watch(pid, RequestKind::WatchCount);
            }
            CoordinatorMsg::WatchUids { pid } => {
                self.set_watch(pid, RequestKind::WatchUids);
            }
        }

        match self.credential_store.reload_if_changed() {
            Ok(true) => self.auth_cache.clear(),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "credential file reload failed; serving with an empty store");
                self.auth_cache.clear();
            }
        }

        self.step_all_sessions(uids_changed, prev_active_set.as_ref());
    }

    fn recompute_active_set(&self) -> HashSet<Uid> {
        let mut merged = HashSet::new();
        for snapshot in self.listener_snapshots.values() {
            for uid in snapshot {
                merged.insert(self.settings.translation_table.apply(uid.clone()));
            }
        }
        merged
    }

    fn set_request(&mut self, pid: i32, request: RequestKind, wait_secs: f64) {
        if let Some(session) = self.sessions.get_mut(&pid) {
            let capped = wait_secs.min(self.settings.max_auth_request_wait.as_secs_f64()).max(0.0);
            session.request = request;
            session.expires_at = Some(Instant::now() + Duration::from_secs_f64(capped));
        }
    }

    fn set_del_all(&mut self, pid: i32, user: String) {
        if let Some(session) = self.sessions.get_mut(&pid) {
            session.request = RequestKind::DelAllUser { user };
            session.expires_at = None;
        }
    }

    /// Register a `WATCHNBUIDS`/`WATCHUIDS` subscription. If a `ListenerUpdate`
    /// has ever landed (a baseline active set exists), push that snapshot to
    /// the new subscriber immediately — a client that subscribes while a tag
    /// is already present must not wait for the next physical tag event.
    fn set_watch(&mut self, pid: i32, request: RequestKind) {
        let active_set = self.active_set.clone();
        let has_baseline = self.baseline_established;
        let Some(session) = self.sessions.get_mut(&pid) else {
            return;
        };
        session.request = request.clone();
        session.expires_at = None;
        if !has_baseline {
            return;
        }
        match request {
            RequestKind::WatchCount => {
                let _ = session.replies.send(CoordinatorReply::NbUpdate {
                    count: active_set.len(),
                    delta: 0,
                });
            }
            RequestKind::WatchUids => {
                let mut uids: Vec<String> = active_set.iter().map(|u| u.as_str().to_owned()).collect();
                uids.sort();
                let _ = session.replies.send(CoordinatorReply::UidsUpdate { uids });
            }
            _ => {}
        }
    }

    fn step_all_sessions(&mut self, uids_changed: bool, prev_active_set: Option<&HashSet<Uid>>) {
        let now = Instant::now();
        let active_set = self.active_set.clone();
        let pids: Vec<i32> = self.sessions.keys().copied().collect();

        for pid in pids {
            self.step_session(pid, uids_changed, prev_active_set, &active_set, now);
        }
    }

    fn step_session(
        &mut self,
        pid: i32,
        uids_changed: bool,
        prev_active_set: Option<&HashSet<Uid>>,
        active_set: &HashSet<Uid>,
        now: Instant,
    ) {
        let Some(session) = self.sessions.get_mut(&pid) else {
            return;
        };

        let expired = session.expires_at.is_some_and(|t| now >= t);

        match session.request.clone() {
            RequestKind::WatchCount => {
                if uids_changed {
                    if let Some(prev) = prev_active_set {
                        if prev.len() != active_set.len() {
                            let delta = active_set.len() as i64 - prev.len() as i64;
                            let _ = session.replies.send(CoordinatorReply::NbUpdate {
                                count: active_set.len(),
                                delta,
                            });
                        }
                    }
                }
            }
            RequestKind::WatchUids => {
                let changed_from_prev = uids_changed
                    && prev_active_set.is_some_and(|prev| prev != active_set);
                if changed_from_prev {
                    let mut uids: Vec<String> =
                        active_set.iter().map(|u| u.as_str().to_owned()).collect();
                    uids.sort();
                    let _ = session.replies.send(CoordinatorReply::UidsUpdate { uids });
                }
            }
            RequestKind::WaitAuth { user } => {
                let (authenticated, matching) = Self::authenticate(
                    &self.credential_store,
                    &mut self.auth_cache,
                    &user,
                    active_set,
                );
                let session = self.sessions.get_mut(&pid).expect("session present");
                if authenticated || expired {
                    let uids = if authenticated && user == session.identity.username {
                        Some(matching.iter().map(|u| u.as_str().to_owned()).collect())
                    } else {
                        None
                    };
                    let _ = session.replies.send(CoordinatorReply::AuthResult {
                        ok: authenticated,
                        uids,
                    });
                    self.reset_to_void(pid);
                }
            }
            RequestKind::AddUser { user } => {
                if active_set.len() == 1 {
                    let uid = active_set.iter().next().expect("len == 1").clone();
                    let already_exists = self
                        .credential_store
                        .entries()
                        .iter()
                        .any(|(u, h)| u == &user && CredentialStore::verify_uid(uid.as_str(), h));
                    if already_exists {
                        let _ = session.replies.send(CoordinatorReply::EncrUpdateErrExists);
                    } else {
                        let mut new_entries: Vec<(String, String)> =
                            self.credential_store.entries().to_vec();
                        new_entries.push((user, CredentialStore::hash_uid(uid.as_str())));
                        let _ = session.replies.send(CoordinatorReply::EncrUpdate { new_entries });
                    }
                    self.reset_to_void(pid);
                } else if expired {
                    let session = self.sessions.get_mut(&pid).expect("session present");
                    let _ = session.replies.send(CoordinatorReply::EncrUpdateErrTimeout);
                    self.reset_to_void(pid);
                }
            }
            RequestKind::DelUser { user } => {
                if active_set.len() == 1 {
                    let uid = active_set.iter().next().expect("len == 1").clone();
                    let new_entries: Vec<(String, String)> = self
                        .credential_store
                        .entries()
                        .iter()
                        .filter(|(u, h)| !(u == &user && CredentialStore::verify_uid(uid.as_str(), h)))
                        .cloned()
                        .collect();
                    let removed = new_entries.len() != self.credential_store.entries().len();
                    let session = self.sessions.get_mut(&pid).expect("session present");
                    if removed {
                        let _ = session.replies.send(CoordinatorReply::EncrUpdate { new_entries });
                    } else {
                        let _ = session.replies.send(CoordinatorReply::EncrUpdateErrNone);
                    }
                    self.reset_to_void(pid);
                } else if expired {
                    let session = self.sessions.get_mut(&pid).expect("session present");
                    let _ = session.replies.send(CoordinatorReply::EncrUpdateErrTimeout);
                    self.reset_to_void(pid);
                }
            }
            RequestKind::DelAllUser { user } => {
                let new_entries: Vec<(String, String)> = self
                    .credential_store
                    .entries()
                    .iter()
                    .filter(|(u, _)| u != &user)
                    .cloned()
                    .collect();
                let removed = new_entries.len() != self.credential_store.entries().len();
                let session = self.sessions.get_mut(&pid).expect("session present");
                if removed {
                    let _ = session.replies.send(CoordinatorReply::EncrUpdate { new_entries });
                } else {
                    let _ = session.replies.send(CoordinatorReply::EncrUpdateErrNone);
                }
                self.reset_to_void(pid);
            }
            RequestKind::Void => {
                if expired {
                    let _ = session.replies.send(CoordinatorReply::VoidRequestTimeout);
                }
            }
        }
    }

    fn reset_to_void(&mut self, pid: i32) {
        if let Some(session) = self.sessions.get_mut(&pid) {
            session.request = RequestKind::Void;
            session.expires_at = Some(Instant::now() + self.settings.client_force_close_socket_timeout);
        }
    }

    /// Authenticate `user` against the current active set, consulting (and
    /// populating) the cache. Cache validity is tied to both the active set
    /// and the credential store being unchanged since population — both are
    /// already enforced by clearing the cache whenever either changes.
    ///
    /// Takes its dependencies as explicit disjoint borrows (rather than
    /// `&mut self`) so callers can hold an unrelated `&mut` into
    /// `self.sessions` across the call.
    fn authenticate(
        credential_store: &CredentialStore,
        auth_cache: &mut HashMap<String, (bool, HashSet<Uid>)>,
        user: &str,
        active_set: &HashSet<Uid>,
    ) -> (bool, HashSet<Uid>) {
        if let Some(cached) = auth_cache.get(user) {
            return cached.clone();
        }
        let mut matching = HashSet::new();
        for uid in active_set {
            for (entry_user, hash) in credential_store.entries() {
                if entry_user == user && CredentialStore::verify_uid(uid.as_str(), hash) {
                    matching.insert(uid.clone());
                }
            }
        }
        let result = (!matching.is_empty(), matching);
        auth_cache.insert(user.to_owned(), result.clone());
        result
    }
}
