//! Prefix-filtered publish/subscribe fabric for control-socket lines.
//!
//! A single dispatcher task owns the subscriber list. Publications are
//! serialized through one control channel, so every subscriber observes its
//! matching lines in publication order. Each subscriber stream has capacity
//! one: the dispatcher blocks on a full slot until the subscriber accepts
//! the line or cancels, which keeps a slow subscriber from dropping or
//! reordering its own events while never disturbing anyone else's order.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of each subscriber's stream. One is sufficient because the
/// dispatcher serializes delivery.
const SUBSCRIBER_CAPACITY: usize = 1;

enum BusMsg {
    Publish(String),
    Subscribe {
        sub: Subscriber,
        ready: oneshot::Sender<()>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Subscriber {
    prefixes: Vec<String>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// An empty prefix list matches every line.
    fn matches(&self, line: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }
}

/// Single-writer, many-reader broadcast of control lines.
pub(crate) struct CommandBus {
    tx: mpsc::Sender<BusMsg>,
    closed: AtomicBool,
}

impl CommandBus {
    /// Create the bus and spawn its dispatcher task.
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(dispatch(rx));
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver `line` to every live subscriber whose prefix set matches.
    ///
    /// Serialized with all other publications; a no-op after [`close`].
    pub(crate) async fn publish(&self, line: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(BusMsg::Publish(line)).await;
    }

    /// Register a subscription for lines starting with any of `prefixes`.
    ///
    /// The subscription is live before this returns: a line published
    /// afterwards is guaranteed to be observed (or to follow a cancel).
    /// Pass an empty slice to receive every line.
    pub(crate) async fn subscribe(&self, prefixes: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let sub = Subscriber {
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            tx,
            cancel: cancel.clone(),
        };
        // On a closed bus the send fails, the sender ends up dropped, and
        // the returned subscription yields end-of-stream immediately.
        if self
            .tx
            .send(BusMsg::Subscribe {
                sub,
                ready: ready_tx,
            })
            .await
            .is_ok()
        {
            let _ = ready_rx.await;
        }
        Subscription { rx, cancel }
    }

    /// Terminate the dispatcher and signal end-of-stream to all live
    /// subscribers. Idempotent; no line is delivered after this returns.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMsg::Close { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// A live subscription. Dropping it cancels delivery.
pub(crate) struct Subscription {
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Receive the next matching line; `None` once the bus has closed or
    /// the subscription was cancelled and its slot drained.
    pub(crate) async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop delivery. Lines already accepted into the slot may still be
    /// received; nothing new is delivered after this returns.
    #[allow(dead_code)]
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(mut rx: mpsc::Receiver<BusMsg>) {
    let mut subs: Vec<Subscriber> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            BusMsg::Publish(line) => {
                let mut i = 0;
                while i < subs.len() {
                    if deliver(&subs[i], &line).await {
                        i += 1;
                    } else {
                        subs.remove(i);
                    }
                }
            }
            BusMsg::Subscribe { sub, ready } => {
                subs.push(sub);
                let _ = ready.send(());
            }
            BusMsg::Close { done } => {
                // Dropping the senders is the end-of-stream signal.
                subs.clear();
                let _ = done.send(());
                return;
            }
        }
    }
}

/// Deliver one line to one subscriber. Returns false when the subscriber
/// should be evicted (cancelled or receiver gone).
async fn deliver(sub: &Subscriber, line: &str) -> bool {
    if sub.cancel.is_cancelled() {
        return false;
    }
    if !sub.matches(line) {
        return true;
    }
    tokio::select! {
        _ = sub.cancel.cancelled() => false,
        res = sub.tx.send(line.to_string()) => res.is_ok(),
    }
}
