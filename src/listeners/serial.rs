//! Repeating serial reader family: the device continuously emits UID lines
//! while a tag is present and falls silent when it's removed, so presence
//! has to be inferred from recency rather than read directly. The line
//! protocol itself (baud rate, framing) is out of scope (`SPEC_FULL.md` §1);
//! this stand-in reads from an injectable [`LineSource`] and owns exactly
//! the expiry bookkeeping the real backend would need.

use super::{ExpiringSet, Listener, ListenerEvent};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uid_core::Uid;

/// Something that can be polled for freshly-read UID lines since the last
/// call. An empty result means "nothing new", not "nothing present" — the
/// [`ExpiringSet`] is what turns silence into eventual absence.
pub trait LineSource: Send {
    fn poll_lines(&mut self) -> Option<Vec<String>>;
}

pub struct NoHardware;

impl LineSource for NoHardware {
    fn poll_lines(&mut self) -> Option<Vec<String>> {
        Some(Vec::new())
    }
}

pub struct SerialListener<S: LineSource> {
    source: S,
    read_every: Duration,
    inactive_timeout: Duration,
}

impl<S: LineSource> SerialListener<S> {
    pub fn new(source: S, read_every: Duration, inactive_timeout: Duration) -> Self {
        SerialListener {
            source,
            read_every,
            inactive_timeout,
        }
    }
}

impl<S: LineSource + Send + 'static> Listener for SerialListener<S> {
    fn id(&self) -> &'static str {
        "serial"
    }

    async fn run(mut self, out: mpsc::UnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut expiring = ExpiringSet::new(self.inactive_timeout);
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
                    match self.source.poll_lines() {
                        Some(lines) => {
                            for line in lines {
                                if let Some(uid) = Uid::normalize(&line) {
                                    expiring.touch(uid, now);
                                }
                            }
                        }
                        None => {
                            tracing::debug!(backend = "serial", "transient read failure; backing off");
                            tokio::time::sleep(Duration::from_secs(2)).await;
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

    struct Scripted(std::vec::IntoIter<Vec<&'static str>>);

    impl LineSource for Scripted {
        fn poll_lines(&mut self) -> Option<Vec<String>> {
            Some(
                self.0
                    .next()
                    .unwrap_or_default()
                    .into_iter()
                    .map(str::to_owned)
                    .collect(),
            )
        }
    }

    #[tokio::test]
    async fn uid_stays_present_until_inactive_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source = Scripted(vec![vec!["AA"], vec![], vec![], vec![]].into_iter());
        let listener = SerialListener::new(source, Duration::from_millis(5), Duration::from_millis(12));

        let handle = tokio::spawn(listener.run(tx, shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ListenerEvent::UidsUpdate(set) if set.len() == 1));

        // Still within the inactive_timeout window and unchanged: a KeepAlive,
        // not a repeated UidsUpdate.
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ListenerEvent::KeepAlive));

        // Eventually expires.
        loop {
            match rx.recv().await.unwrap() {
                ListenerEvent::UidsUpdate(set) if set.is_empty() => break,
                _ => continue,
            }
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
