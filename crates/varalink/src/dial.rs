//! Outbound dialing with cancellation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use varalink_core::error::{Error, Result};
use varalink_core::types::{Bandwidth, LinkState};
use varalink_core::url::ConnectUrl;

use crate::conn::Connection;
use crate::modem::{abort_link, Modem};

impl Modem {
    /// Dial an outbound link to `url`'s target station.
    ///
    /// Blocks until the modem reports `CONNECTED` or `DISCONNECTED` (its
    /// own connect timeout). Use [`dial_with_cancel`](Modem::dial_with_cancel)
    /// to make the wait abortable.
    pub async fn dial(&self, url: &ConnectUrl) -> Result<Connection> {
        self.dial_with_cancel(url, CancellationToken::new()).await
    }

    /// Dial with a cancellation token.
    ///
    /// Cancelling the token sends `DISCONNECT` and waits for the link to
    /// resolve; the modem does not always honor `DISCONNECT` mid-dial, so a
    /// connection may still be returned after cancellation. Use
    /// [`abort`](Modem::abort) for immediate teardown.
    pub async fn dial_with_cancel(
        &self,
        url: &ConnectUrl,
        cancel: CancellationToken,
    ) -> Result<Connection> {
        let inner = &self.inner;
        if url.scheme() != inner.scheme {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }
        if inner.is_closed() {
            return Err(Error::ModemClosed);
        }
        if inner.link_state() != LinkState::Disconnected {
            return Err(Error::ModemBusy);
        }

        // Dial-time bandwidth override; undone on the next disconnect.
        if let Some(bw) = url.param("bw") {
            let bw: Bandwidth = bw.parse()?;
            inner.write_cmd(&bw.command()).await?;
            if inner.config.default_bandwidth.map_or(false, |d| d != bw) {
                inner.bw_overridden.store(true, Ordering::SeqCst);
            }
        }

        // HF links carry a session type; Winlink unless p2p is requested.
        if inner.scheme.is_hf() {
            let p2p = url.param("p2p") == Some("true");
            inner
                .write_cmd(if p2p { "P2P SESSION" } else { "WINLINK SESSION" })
                .await?;
        }

        inner.set_link_state(LinkState::Connecting);
        inner
            .bus
            .publish(LinkState::Connecting.wire_word().to_string())
            .await;
        let mut sub = inner.bus.subscribe(&["CONNECTED", "DISCONNECTED"]).await;
        inner
            .write_cmd(&format!("CONNECT {} {}", inner.my_call, url.target()))
            .await?;

        // Cancellation watcher: translate token cancellation into a modem
        // DISCONNECT. Stops as soon as the dial resolves.
        let done = CancellationToken::new();
        {
            let inner = Arc::clone(inner);
            let cancel = cancel.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("dial cancelled, sending DISCONNECT");
                        let _ = inner.write_cmd("DISCONNECT").await;
                    }
                    _ = done.cancelled() => {}
                }
            });
        }

        let result = match sub.recv().await {
            Some(line) if line.starts_with("CONNECTED") => {
                tracing::debug!(remote = url.target(), "link established");
                Ok(Connection::new(Arc::clone(inner), url.target().to_string()))
            }
            // DISCONNECTED after the caller cancelled.
            Some(_) if cancel.is_cancelled() => Err(Error::Canceled),
            // DISCONNECTED for any other reason: the modem's own timeout
            // fired or the remote refused.
            Some(_) => Err(Error::ConnectTimeout),
            None => Err(Error::ModemClosed),
        };
        done.cancel();
        result
    }

    /// Gracefully close any active link, blocking until it is down.
    ///
    /// A no-op when no link is up.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut sub = inner.bus.subscribe(&["DISCONNECTED"]).await;
        if inner.link_state() == LinkState::Disconnected {
            return Ok(());
        }
        inner.write_cmd("DISCONNECT").await?;
        sub.recv().await;
        Ok(())
    }

    /// Tear the link down immediately.
    pub async fn abort(&self) -> Result<()> {
        abort_link(&self.inner).await
    }
}
