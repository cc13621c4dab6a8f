//! Out-of-process CLI reader family (Proxmark3): the real backend would
//! spawn a child process talking to the device over a pseudo-terminal,
//! parse its textual output, and kill/respawn it on a communication
//! timeout. The child's protocol is out of scope (`SPEC_FULL.md` §1); this
//! stand-in models the "spawn, read lines until timeout, respawn" shape
//! against an injectable [`ChildSession`] instead of a real subprocess, and
//! otherwise behaves like the repeating-serial family (presence inferred
//! from recency, same expiry machinery).

use super::{ExpiringSet, Listener, ListenerEvent};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uid_core::Uid;

/// One "session" with the external reader process: reads whatever lines it
/// has produced since the last poll, or reports that the session died
/// (prompting a respawn).
pub trait ChildSession: Send {
    fn poll_lines(&mut self) -> Option<Vec<String>>;
    fn respawn(&mut self);
}

pub struct NoHardware;

impl ChildSession for NoHardware {
    fn poll_lines(&mut self) -> Option<Vec<String>> {
        Some(Vec::new())
    }

    fn respawn(&mut self) {}
}

pub struct ProxmarkListener<S: ChildSession> {
    session: S,
    read_every: Duration,
    comm_timeout: Duration,
}

impl<S: ChildSession> ProxmarkListener<S> {
    pub fn new(session: S, read_every: Duration, comm_timeout: Duration) -> Self {
        ProxmarkListener {
            session,
            read_every,
            comm_timeout,
        }
    }
}

impl<S: ChildSession + Send + 'static> Listener for ProxmarkListener<S> {
    fn id(&self) -> &'static str {
        "proxmark"
    }

    async fn run(mut self, out: mpsc::UnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut expiring = ExpiringSet::new(self.comm_timeout);
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
                    match self.session.poll_lines() {
                        Some(lines) => {
                            for line in lines {
                                if let Some(uid) = Uid::normalize(&line) {
                                    expiring.touch(uid, now);
                                }
                            }
                        }
                        None => {
                            tracing::debug!(backend = "proxmark", "child session died; respawning");
                            self.session.respawn();
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

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        script: std::vec::IntoIter<Option<Vec<&'static str>>>,
        respawns: usize,
    }

    impl ChildSession for Scripted {
        fn poll_lines(&mut self) -> Option<Vec<String>> {
            self.script
                .next()
                .unwrap_or(Some(Vec::new()))
                .map(|v| v.into_iter().map(str::to_owned).collect())
        }

        fn respawn(&mut self) {
            self.respawns += 1;
        }
    }

    #[tokio::test]
    async fn respawns_after_dead_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Scripted {
            script: vec![Some(vec!["AA"]), None, Some(vec!["AA"])].into_iter(),
            respawns: 0,
        };
        let listener = ProxmarkListener::new(session, Duration::from_millis(5), Duration::from_millis(50));

        let handle = tokio::spawn(listener.run(tx, shutdown_rx));
        assert!(matches!(rx.recv().await.unwrap(), ListenerEvent::UidsUpdate(_)));
        // Dead read (None) yields a KeepAlive (expiry window hasn't elapsed).
        assert!(matches!(rx.recv().await.unwrap(), ListenerEvent::KeepAlive));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
