//! Reader backends: independent tasks that each own one device and report
//! the UIDs currently visible on it. Wire dialects are out of scope
//! (`SPEC_FULL.md` §1) — each backend here is a thin, documented stand-in
//! that exercises the shared debounce/expiry contract against an injectable
//! clock and source instead of real hardware.

pub mod hid;
pub mod pcsc;
pub mod proxmark;
pub mod serial;

use std::collections::HashSet;
use tokio::sync::mpsc;
use uid_core::Uid;

/// A snapshot update a listener sends to the Coordinator.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    UidsUpdate(HashSet<Uid>),
    KeepAlive,
}

/// Shared contract every reader backend implements. The only required
/// method drives the task to completion; everything backend-specific
/// (device handles, poll cadence, parsing) lives behind it. Kept as a plain
/// (non-`dyn`) trait — `main` spawns one concrete backend type per
/// configured listener rather than storing them in a homogeneous
/// collection, so object safety is never needed.
pub trait Listener: Send + Sized + 'static {
    /// Stable identifier used as this listener's key in the Coordinator's
    /// per-backend snapshot table.
    fn id(&self) -> &'static str;

    /// Run until `shutdown` reports `true`, emitting `ListenerEvent`s on
    /// `out`. Must never propagate I/O errors to the caller — on any
    /// failure, close, back off, and retry (`SPEC_FULL.md` §4.1, §7).
    fn run(
        self,
        out: mpsc::UnboundedSender<ListenerEvent>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Debounce state shared by the "one-shot" and "push" backend families:
/// a UID stays in the reported set until `inactive_timeout` has elapsed
/// since it was last (re-)seen.
pub(crate) struct ExpiringSet {
    last_seen: std::collections::HashMap<Uid, std::time::Instant>,
    inactive_timeout: std::time::Duration,
}

impl ExpiringSet {
    pub(crate) fn new(inactive_timeout: std::time::Duration) -> Self {
        ExpiringSet {
            last_seen: std::collections::HashMap::new(),
            inactive_timeout,
        }
    }

    /// Record a fresh read of `uid`.
    pub(crate) fn touch(&mut self, uid: Uid, now: std::time::Instant) {
        self.last_seen.insert(uid, now);
    }

    /// Drop entries that have aged out as of `now`, returning whether the
    /// set's membership changed.
    pub(crate) fn expire(&mut self, now: std::time::Instant) -> bool {
        let before = self.last_seen.len();
        self.last_seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.inactive_timeout);
        self.last_seen.len() != before
    }

    pub(crate) fn current(&self) -> HashSet<Uid> {
        self.last_seen.keys().cloned().collect()
    }
}
