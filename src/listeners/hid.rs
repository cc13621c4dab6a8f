//! One-shot reader family (HID keyboard-wedge): each physical tap produces a
//! single burst of keystrokes decoding to one UID, then nothing — the
//! reader has no concept of "still present". `hid_simulate_uid_stays_active`
//! is what makes such a reader usable for `WAITAUTH`: every read refreshes
//! a synthetic presence window of that length. Keystroke decoding itself is
//! out of scope (`SPEC_FULL.md` §1); this stand-in takes already-decoded UID
//! strings from an injectable [`TapSource`].

use super::{ExpiringSet, Listener, ListenerEvent};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uid_core::Uid;

/// Something that yields one decoded UID per tap, or `None` when no tap has
/// occurred since the last poll.
pub trait TapSource: Send {
    fn next_tap(&mut self) -> Option<String>;
}

pub struct NoHardware;

impl TapSource for NoHardware {
    fn next_tap(&mut self) -> Option<String> {
        None
    }
}

pub struct HidListener<S: TapSource> {
    source: S,
    read_every: Duration,
    simulate_stays_active: Duration,
}

impl<S: TapSource> HidListener<S> {
    pub fn new(source: S, read_every: Duration, simulate_stays_active: Duration) -> Self {
        HidListener {
            source,
            read_every,
            simulate_stays_active,
        }
    }
}

impl<S: TapSource + Send + 'static> Listener for HidListener<S> {
    fn id(&self) -> &'static str {
        "hid"
    }

    async fn run(mut self, out: mpsc::UnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut expiring = ExpiringSet::new(self.simulate_stays_active);
        let mut last_sent = expiring.current();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(self.read_every) => {
                    let now = std::time::Instant::now();
                    if let Some(raw) = self.source.next_tap() {
                        if let Some(uid) = Uid::normalize(&raw) {
                            expiring.touch(uid, now);
                        }
                    }
                    expiring.expire(now);
                    let current = expiring.current();
                    if current == last_sent {
                        let _ = out.send(ListenerEvent::KeepAlive);
                    } else {
                        last_sent = current.clone();
                        let _ = out.send(ListenerEvent::UidsUpdate(current));
                    }
                }
            }
        }
    }
}
