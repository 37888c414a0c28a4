//! Inbound link acceptance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use varalink_core::error::{Error, Result};
use varalink_core::types::Addr;

use crate::conn::Connection;
use crate::modem::{Modem, ModemInner};

impl Modem {
    /// Enable inbound links and return the accept handle.
    ///
    /// Sends `LISTEN ON`. Inbound links arriving while no
    /// [`accept`](Listener::accept) is waiting are dropped with a
    /// `DISCONNECT` reply.
    pub async fn listen(&self) -> Result<Listener> {
        if self.inner.is_closed() {
            return Err(Error::ModemClosed);
        }
        self.inner.write_cmd("LISTEN ON").await?;
        Ok(Listener {
            inner: Arc::clone(&self.inner),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle for accepting inbound links, created by [`Modem::listen`].
pub struct Listener {
    inner: Arc<ModemInner>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl Listener {
    /// Wait for the next inbound link.
    ///
    /// Fails with [`Error::ListenerClosed`] once [`close`](Listener::close)
    /// has run or the adapter is shutting down; after a successful close
    /// this never blocks.
    pub async fn accept(&self) -> Result<Connection> {
        if self.done.is_cancelled() || self.inner.is_closed() {
            return Err(Error::ListenerClosed);
        }

        self.inner.acceptors.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut rx = self.inner.inbound_rx.lock().await;
            tokio::select! {
                conn = rx.recv() => conn.ok_or(Error::ListenerClosed),
                _ = self.done.cancelled() => Err(Error::ListenerClosed),
                _ = self.inner.shutdown.cancelled() => Err(Error::ListenerClosed),
            }
        };
        self.inner.acceptors.fetch_sub(1, Ordering::SeqCst);

        if let Ok(conn) = &result {
            tracing::debug!(from = %conn.remote_addr(), "accepted inbound link");
        }
        result
    }

    /// Stop listening. Sends `LISTEN OFF` exactly once and wakes any
    /// blocked [`accept`](Listener::accept).
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = self.inner.write_cmd("LISTEN OFF").await;
        if res.is_ok() {
            self.done.cancel();
        }
        res
    }

    /// The listening station's address.
    pub fn local_addr(&self) -> Addr {
        Addr::new(self.inner.scheme, self.inner.my_call.clone())
    }
}
