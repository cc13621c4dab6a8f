//! Polled card-present reader family (PC/SC, uFR in polled mode).
//!
//! The device itself reports presence directly — no debounce is needed,
//! because an absent card simply isn't in the next poll's result. The wire
//! dialect (APDU exchange, reader enumeration) is out of scope
//! (`SPEC_FULL.md` §1); this stand-in polls an injectable [`PollSource`]
//! instead of a real PC/SC context, which is exactly where the debounce-free
//! contract this backend owns is exercised.

use super::{Listener, ListenerEvent};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uid_core::Uid;

/// Something that can be polled for the UIDs currently present. Production
/// code behind a real PC/SC context would implement this against
/// `pcsc-lite`; tests implement it with a canned sequence.
pub trait PollSource: Send {
    /// Return the currently-present UIDs, or `None` on a transient I/O
    /// error (the listener logs, backs off, and retries).
    fn poll(&mut self) -> Option<Vec<String>>;
}

/// Stand-in source for a backend with no configured target: reports nothing
/// present, forever. Keeps the listener's loop, timing, and KeepAlive
/// behavior real and testable without requiring hardware.
pub struct NoHardware;

impl PollSource for NoHardware {
    fn poll(&mut self) -> Option<Vec<String>> {
        Some(Vec::new())
    }
}

pub struct PcscListener<S: PollSource> {
    source: S,
    read_every: Duration,
}

impl<S: PollSource> PcscListener<S> {
    pub fn new(source: S, read_every: Duration) -> Self {
        PcscListener { source, read_every }
    }
}

impl<S: PollSource + Send + 'static> Listener for PcscListener<S> {
    fn id(&self) -> &'static str {
        "pcsc"
    }

    async fn run(mut self, out: mpsc::UnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut last_set: HashSet<Uid> = HashSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(self.read_every) => {
                    match self.source.poll() {
                        Some(raw) => {
                            let set: HashSet<Uid> = raw.iter().filter_map(|s| Uid::normalize(s)).collect();
                            if set == last_set {
                                let _ = out.send(ListenerEvent::KeepAlive);
                            } else {
                                last_set = set.clone();
                                let _ = out.send(ListenerEvent::UidsUpdate(set));
                            }
                        }
                        None => {
                            tracing::debug!(backend = "pcsc", "transient read failure; backing off");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    }
}
