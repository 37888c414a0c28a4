//! The byte-stream connection handed to callers for an established link.
//!
//! A [`Connection`] is a facade over the modem's data socket. The socket is
//! not authoritative for connection state: the `DISCONNECTED` event arrives
//! on the control socket, and payload bytes can be observed before or after
//! the event that logically bounds them. Every operation here therefore
//! subscribes to the event bus for the duration of the call and compensates
//! for the cross-socket race (tail-drain reads, settle-before-DISCONNECT
//! close, no writes once a close has begun).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use varalink_core::error::{Error, Result};
use varalink_core::types::{Addr, LinkState};

use crate::modem::{abort_link, ModemInner, DISCONNECT_TIMEOUT};
use crate::protocol;

/// Write pacing factor: a write of `n` bytes waits until the modem's
/// transmit queue holds fewer than `7 * n` bytes.
///
/// Empirical. The on-air frame size and the modem's `BUFFER` reporting
/// cadence are not externally visible, so this cannot be derived; smaller
/// values inflate idle time on the link, larger ones let the queue grow
/// until a graceful close takes minutes. This value holds up on both the
/// FM and HF operating modes.
const TX_QUEUE_FACTOR: u64 = 7;

/// Inactivity cap while waiting for `BUFFER` updates in write and flush.
const BUFFER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a read keeps polling the data socket for payload that raced a
/// `DISCONNECTED` event.
const READ_TAIL_GRACE: Duration = Duration::from_secs(2);

/// Quiet period after the last write before a close may send `DISCONNECT`.
/// The modem only drains transmit-queue bytes it has already received.
const WRITE_SETTLE: Duration = Duration::from_secs(2);

/// Read deadline for discarding straggler bytes during close.
const CLOSE_DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// A bidirectional byte stream over an established link.
///
/// Created by a successful [`dial`](crate::Modem::dial) or by
/// [`accept`](crate::Listener::accept). The adapter remains authoritative
/// over the underlying data socket; the connection borrows it.
pub struct Connection {
    inner: Arc<ModemInner>,
    remote_call: String,

    /// Set once a close has begun so concurrent writes park instead of
    /// feeding the modem's queue and stalling the teardown.
    closing: AtomicBool,
    close_latch: Mutex<bool>,
    last_write: StdMutex<Option<Instant>>,

    read_timeout: StdMutex<Option<Duration>>,
    write_timeout: StdMutex<Option<Duration>>,
}

impl Connection {
    pub(crate) fn new(inner: Arc<ModemInner>, remote_call: String) -> Self {
        Self {
            inner,
            remote_call,
            closing: AtomicBool::new(false),
            close_latch: Mutex::new(false),
            last_write: StdMutex::new(None),
            read_timeout: StdMutex::new(None),
            write_timeout: StdMutex::new(None),
        }
    }

    /// The local station address (`<scheme>://<callsign>`).
    pub fn local_addr(&self) -> Addr {
        Addr::new(self.inner.scheme, self.inner.my_call.clone())
    }

    /// The remote station address.
    pub fn remote_addr(&self) -> Addr {
        Addr::new(self.inner.scheme, self.remote_call.clone())
    }

    /// Bytes known to be outstanding in the modem's transmit pipeline.
    pub fn tx_buffer_len(&self) -> usize {
        self.inner.buffer.get() as usize
    }

    /// Set the deadline applied to each subsequent [`read`](Connection::read).
    /// `None` disables it.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock().unwrap() = timeout;
    }

    /// Set the deadline applied to each subsequent [`write`](Connection::write).
    /// `None` disables it.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock().unwrap() = timeout;
    }

    /// Set both deadlines at once.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.set_read_timeout(timeout);
        self.set_write_timeout(timeout);
    }

    /// Read payload bytes. Returns `Ok(0)` once the link has ended.
    ///
    /// A `DISCONNECTED` observed while the read is pending does not end the
    /// stream immediately: payload sent before the disconnect may still be
    /// in flight on the independent data socket, so the socket is polled
    /// for a short grace period first.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut sub = self.inner.bus.subscribe(&["DISCONNECTED"]).await;
        if self.inner.link_state() != LinkState::Connected {
            tracing::debug!("read on inactive link");
            return Ok(0);
        }

        let deadline = *self.read_timeout.lock().unwrap();
        let mut reader = self.inner.data_reader.lock().await;
        let read_fut = reader.read(buf);
        tokio::pin!(read_fut);

        let race = async {
            tokio::select! {
                res = &mut read_fut => res.map_err(Error::from),
                _ = sub.recv() => {
                    tracing::debug!("link dropped mid-read, draining stragglers");
                    match tokio::time::timeout(READ_TAIL_GRACE, &mut read_fut).await {
                        Ok(res) => res.map_err(Error::from),
                        Err(_) => Ok(0),
                    }
                }
            }
        };
        match deadline {
            Some(d) => tokio::time::timeout(d, race)
                .await
                .map_err(|_| Error::Timeout)?,
            None => race.await,
        }
    }

    /// Write payload bytes, paced against the modem's transmit queue.
    ///
    /// Blocks while the queue holds `7x` or more of this write's length,
    /// waking on each `BUFFER` report, with a 60-second inactivity cap.
    /// Once the gate passes, the local gauge is bumped immediately so
    /// [`tx_buffer_len`](Connection::tx_buffer_len) is correct before the
    /// modem's next report. The data socket's byte count is returned
    /// verbatim.
    pub async fn write(&self, b: &[u8]) -> Result<usize> {
        if b.is_empty() {
            return Ok(0);
        }
        let mut sub = self.inner.bus.subscribe(&["DISCONNECTED", "BUFFER"]).await;
        if self.inner.link_state() != LinkState::Connected {
            return Err(Error::EndOfStream);
        }

        let threshold = TX_QUEUE_FACTOR * b.len() as u64;
        let mut count = self.inner.buffer.get();
        while count >= threshold && !self.closing.load(Ordering::SeqCst) {
            tracing::trace!(count, threshold, "transmit queue full, waiting");
            match tokio::time::timeout(BUFFER_WAIT_TIMEOUT, sub.recv()).await {
                Err(_) => return Err(Error::BufferTimeout),
                Ok(None) => return Err(Error::EndOfStream),
                Ok(Some(line)) => {
                    if line.starts_with("DISCONNECTED") {
                        tracing::debug!("link dropped while waiting for buffer space");
                        return Err(Error::EndOfStream);
                    }
                    if let Some(n) = protocol::parse_buffer(&line) {
                        count = n;
                    }
                }
            }
        }

        // The modem accepts data after DISCONNECT has been sent and holds
        // the link open until its queue drains; once a close has begun no
        // further bytes may be fed. Park until the teardown completes.
        if self.closing.load(Ordering::SeqCst) && self.inner.link_state() == LinkState::Connected {
            tracing::debug!("write during close, waiting for link teardown");
            loop {
                match sub.recv().await {
                    None => break,
                    Some(line) if line.starts_with("DISCONNECTED") => break,
                    Some(_) => {}
                }
            }
            return Err(Error::EndOfStream);
        }

        self.inner.buffer.incr(b.len() as u64);
        *self.last_write.lock().unwrap() = Some(Instant::now());

        let deadline = *self.write_timeout.lock().unwrap();
        let mut writer = self.inner.data_writer.lock().await;
        let n = match deadline {
            Some(d) => tokio::time::timeout(d, writer.write(b))
                .await
                .map_err(|_| Error::Timeout)??,
            None => writer.write(b).await?,
        };
        tracing::trace!(bytes = n, "payload handed to modem");
        Ok(n)
    }

    /// Block until the modem's transmit queue is empty.
    ///
    /// Returns [`Error::EndOfStream`] if the link drops first and
    /// [`Error::FlushTimeout`] after 60 seconds without a `BUFFER` report.
    /// A concurrent close short-circuits to success.
    pub async fn flush(&self) -> Result<()> {
        let mut sub = self.inner.bus.subscribe(&["DISCONNECTED", "BUFFER"]).await;
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut count = self.inner.buffer.get();
        while count > 0 {
            match tokio::time::timeout(BUFFER_WAIT_TIMEOUT, sub.recv()).await {
                Err(_) => return Err(Error::FlushTimeout),
                Ok(None) => return Err(Error::EndOfStream),
                Ok(Some(line)) => {
                    if line.starts_with("DISCONNECTED") {
                        return Err(Error::EndOfStream);
                    }
                    if let Some(n) = protocol::parse_buffer(&line) {
                        count = n;
                    }
                }
            }
        }
        Ok(())
    }

    /// Gracefully close the link. Idempotent.
    ///
    /// Waits out the post-write settle window (the modem only drains queue
    /// bytes it has already received), sends `DISCONNECT`, and awaits the
    /// acknowledgement for up to 60 seconds before escalating to an abort.
    /// Straggler payload still in the socket is discarded on the way out.
    pub async fn close(&self) -> Result<()> {
        let mut latch = self.close_latch.lock().await;
        if *latch {
            return Ok(());
        }
        *latch = true;
        if self.inner.is_closed() {
            return Ok(());
        }

        self.closing.store(true, Ordering::SeqCst);
        let mut sub = self.inner.bus.subscribe(&["DISCONNECTED"]).await;

        let result = if self.inner.link_state() == LinkState::Disconnected {
            Ok(())
        } else {
            let since = self.last_write.lock().unwrap().map(|t| t.elapsed());
            if let Some(since) = since {
                if since < WRITE_SETTLE {
                    tokio::time::sleep(WRITE_SETTLE - since).await;
                }
            }
            let _ = self.inner.write_cmd("DISCONNECT").await;
            match tokio::time::timeout(DISCONNECT_TIMEOUT, sub.recv()).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    tracing::debug!("disconnect unacknowledged, aborting link");
                    let _ = abort_link(&self.inner).await;
                    Err(Error::DisconnectTimeout)
                }
            }
        };

        self.drain_data_socket().await;
        result
    }

    /// Discard whatever payload remains on the data socket, bounded by a
    /// one-second deadline.
    async fn drain_data_socket(&self) {
        let mut reader = self.inner.data_reader.lock().await;
        let deadline = tokio::time::Instant::now() + CLOSE_DRAIN_DEADLINE;
        let mut scratch = [0u8; 4096];
        let mut discarded = 0usize;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, reader.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
            }
        }
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "discarded trailing payload on close");
        }
    }
}
