//! Modem adapter lifecycle, command channel, and link state machine.
//!
//! [`Modem`] owns both TCP sockets to the modem program: the control socket
//! carrying CR-terminated ASCII commands and the data socket carrying raw
//! payload. A background task reads the control socket, applies each event's
//! local side effects, and republishes the line verbatim on the event bus
//! for the dialer, listener, and stream connections to consume.
//!
//! The two sockets are not mutually synchronized; the control socket is
//! authoritative for link state but not for payload boundaries. The
//! compensation for that race lives in the stream connection
//! (`crate::conn`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use varalink_core::error::{Error, Result};
use varalink_core::ptt::PttController;
use varalink_core::types::{Addr, Bandwidth, LinkState, Scheme};

use crate::buffer::BufferCount;
use crate::conn::Connection;
use crate::protocol::{self, ModemEvent};
use crate::pubsub::CommandBus;

/// Deadline for a single control-socket command write. A hung write means
/// the modem program is wedged; the adapter is marked closed.
const CMD_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Control-socket read deadline doubling as the liveness watchdog. The
/// modem is contracted to emit `IAMALIVE` every 60 seconds; twice that
/// window tolerates one missed heartbeat.
const CMD_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for establishing each TCP socket to the modem program.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a graceful teardown waits for the modem's `DISCONNECTED`
/// acknowledgement before escalating to `ABORT`.
pub(crate) const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for reaching the modem program.
///
/// Unset fields keep the modem's stock endpoints.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Host running the modem program.
    pub host: String,
    /// TCP port of the control socket.
    pub cmd_port: u16,
    /// TCP port of the data socket.
    pub data_port: u16,
    /// Preferred HF bandwidth. When a dial-time `bw` parameter overrides
    /// it, the override is undone on the next transition to disconnected.
    pub default_bandwidth: Option<Bandwidth>,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            cmd_port: 8300,
            data_port: 8301,
            default_bandwidth: None,
        }
    }
}

/// Shared adapter state. The adapter exclusively owns both sockets, the
/// state machine, the event bus, and the transmit-queue gauge; stream
/// connections borrow it.
pub(crate) struct ModemInner {
    pub(crate) scheme: Scheme,
    pub(crate) my_call: String,
    pub(crate) config: ModemConfig,

    cmd_writer: Mutex<OwnedWriteHalf>,
    pub(crate) data_reader: Mutex<OwnedReadHalf>,
    pub(crate) data_writer: Mutex<OwnedWriteHalf>,

    pub(crate) bus: CommandBus,
    pub(crate) buffer: BufferCount,

    /// Written only by the control reader and the abort/close paths.
    link_state: RwLock<LinkState>,
    busy: AtomicBool,

    closed: AtomicBool,
    close_latch: Mutex<bool>,
    /// Cancelled once the adapter shuts down; wakes blocked acceptors.
    pub(crate) shutdown: CancellationToken,

    ptt: RwLock<Option<Arc<dyn PttController>>>,

    pub(crate) inbound_tx: mpsc::Sender<Connection>,
    pub(crate) inbound_rx: Mutex<mpsc::Receiver<Connection>>,
    /// Number of `accept` calls currently waiting. Inbound links arriving
    /// with no waiter are answered with `DISCONNECT`.
    pub(crate) acceptors: AtomicUsize,

    /// Latched when a dial-time `bw` differed from the configured default.
    pub(crate) bw_overridden: AtomicBool,

    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl ModemInner {
    pub(crate) fn link_state(&self) -> LinkState {
        *self.link_state.read().unwrap()
    }

    pub(crate) fn set_link_state(&self, state: LinkState) {
        *self.link_state.write().unwrap() = state;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ptt_controller(&self) -> Option<Arc<dyn PttController>> {
        self.ptt.read().unwrap().clone()
    }

    /// Send one command over the control socket, CR-terminated.
    ///
    /// A write failure or deadline marks the adapter closed: the modem
    /// program is presumed lost and every waiter is released.
    pub(crate) async fn write_cmd(&self, cmd: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ModemClosed);
        }
        tracing::debug!(cmd, "sending modem command");
        let framed = format!("{cmd}\r");
        let mut writer = self.cmd_writer.lock().await;
        match tokio::time::timeout(CMD_WRITE_TIMEOUT, writer.write_all(framed.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(writer);
                self.lost().await;
                Err(Error::Transport(format!("command write failed: {e}")))
            }
            Err(_) => {
                drop(writer);
                self.lost().await;
                Err(Error::Transport("command write deadline exceeded".into()))
            }
        }
    }

    /// Shut the adapter down after losing the modem program.
    ///
    /// Closing the bus is what releases every blocked dial, read, write,
    /// flush, and close with a clean end-of-stream.
    pub(crate) async fn lost(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_link_state(LinkState::Disconnected);
        self.buffer.reset();
        if let Some(ptt) = self.ptt_controller() {
            let _ = ptt.set_ptt(false).await;
        }
        self.bus.close().await;
        self.shutdown.cancel();
    }
}

/// Client adapter for the modem program's two-socket TCP interface.
///
/// Created with [`Modem::new`], which opens both sockets, runs the startup
/// preamble, and spawns the control-socket reader. One adapter mediates at
/// most one over-the-air link at a time; dial with [`Modem::dial`] or
/// accept inbound links through [`Modem::listen`].
pub struct Modem {
    pub(crate) inner: Arc<ModemInner>,
}

impl Modem {
    /// Connect to the modem program and start the adapter.
    ///
    /// Opens the control and data sockets, emits the startup preamble
    /// (`PUBLIC ON`, `CWID ON` on HF, `COMPRESSION TEXT`, `MYCALL`,
    /// `LISTEN OFF`), and spawns the control-socket reader. Preamble
    /// failures propagate and tear both sockets down.
    pub async fn new(
        scheme: Scheme,
        my_call: impl Into<String>,
        config: ModemConfig,
    ) -> Result<Self> {
        let my_call = my_call.into();
        let cmd_stream = connect_tcp("command", &config.host, config.cmd_port).await?;
        let data_stream = connect_tcp("data", &config.host, config.data_port).await?;
        let (cmd_reader, cmd_writer) = cmd_stream.into_split();
        let (data_reader, data_writer) = data_stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(1);

        let inner = Arc::new(ModemInner {
            scheme,
            my_call,
            config,
            cmd_writer: Mutex::new(cmd_writer),
            data_reader: Mutex::new(data_reader),
            data_writer: Mutex::new(data_writer),
            bus: CommandBus::new(),
            buffer: BufferCount::new(),
            link_state: RwLock::new(LinkState::Disconnected),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_latch: Mutex::new(false),
            shutdown: CancellationToken::new(),
            ptt: RwLock::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            acceptors: AtomicUsize::new(0),
            bw_overridden: AtomicBool::new(false),
            reader: StdMutex::new(None),
        });

        inner.write_cmd("PUBLIC ON").await?;
        if inner.scheme.is_hf() {
            inner.write_cmd("CWID ON").await?;
        }
        inner.write_cmd("COMPRESSION TEXT").await?;
        inner.write_cmd(&format!("MYCALL {}", inner.my_call)).await?;
        inner.write_cmd("LISTEN OFF").await?;

        let handle = tokio::spawn(read_loop(Arc::clone(&inner), cmd_reader));
        *inner.reader.lock().unwrap() = Some(handle);

        tracing::debug!(
            scheme = %inner.scheme,
            my_call = %inner.my_call,
            "modem adapter started"
        );
        Ok(Self { inner })
    }

    /// Whether the channel is currently busy (not clear).
    pub fn busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// True when no link is connecting or connected.
    pub fn idle(&self) -> bool {
        self.inner.link_state() == LinkState::Disconnected
    }

    /// Liveness probe; `false` once the adapter has closed.
    pub fn ping(&self) -> bool {
        !self.inner.is_closed()
    }

    /// The local station address.
    pub fn local_addr(&self) -> Addr {
        Addr::new(self.inner.scheme, self.inner.my_call.clone())
    }

    /// Inject (or remove, with `None`) the push-to-talk controller driven
    /// by the modem's `PTT ON` / `PTT OFF` requests. With no controller the
    /// requests are ignored; VOX may still work.
    pub fn set_ptt_controller(&self, ptt: Option<Arc<dyn PttController>>) {
        *self.inner.ptt.write().unwrap() = ptt;
    }

    /// Close the RF link, then the TCP sockets. Blocks until finished.
    ///
    /// Idempotent. If a link is up, sends `DISCONNECT` and waits up to 60
    /// seconds for the acknowledgement before escalating to `ABORT`. After
    /// this returns all operations fail and [`ping`](Modem::ping) reports
    /// `false`.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut latch = inner.close_latch.lock().await;
        if *latch {
            return Ok(());
        }
        *latch = true;

        if !inner.is_closed() && inner.link_state() != LinkState::Disconnected {
            let mut sub = inner.bus.subscribe(&["DISCONNECTED"]).await;
            if inner.write_cmd("DISCONNECT").await.is_ok() {
                match tokio::time::timeout(DISCONNECT_TIMEOUT, sub.recv()).await {
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!("disconnect unacknowledged, aborting link");
                        let _ = inner.write_cmd("ABORT").await;
                    }
                }
            }
        }

        // Stop TX as a backup; the modem should already have unkeyed.
        if let Some(ptt) = inner.ptt_controller() {
            let _ = ptt.set_ptt(false).await;
        }

        inner.closed.store(true, Ordering::SeqCst);
        inner.bus.close().await;
        inner.shutdown.cancel();

        let handle = inner.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let _ = inner.cmd_writer.lock().await.shutdown().await;
        let _ = inner.data_writer.lock().await.shutdown().await;

        tracing::debug!("modem adapter closed");
        Ok(())
    }
}

async fn connect_tcp(name: &str, host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    tracing::debug!(socket = name, addr = %addr, "connecting to modem");
    let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Transport(format!("modem {name} port connect timed out: {addr}")))?
        .map_err(|e| {
            Error::Transport(format!("couldn't connect to modem {name} port {addr}: {e}"))
        })?;
    // Command/response latency matters more than throughput here.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Background task owning the control socket's read half.
///
/// Splits each read on CR, discards empty fragments, and dispatches every
/// line. The read deadline is the modem liveness watchdog.
async fn read_loop(inner: Arc<ModemInner>, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; 1 << 16];
    let mut pending = String::new();

    loop {
        if inner.is_closed() {
            return;
        }
        match tokio::time::timeout(CMD_READ_TIMEOUT, reader.read(&mut buf)).await {
            Err(_) => {
                tracing::error!("no heartbeat from modem within the liveness window");
                inner.lost().await;
                return;
            }
            Ok(Ok(0)) => {
                tracing::debug!("modem closed the control socket");
                inner.lost().await;
                return;
            }
            Ok(Err(e)) => {
                if inner.is_closed() {
                    return;
                }
                tracing::debug!(error = %e, "control socket read failed");
                inner.lost().await;
                return;
            }
            Ok(Ok(n)) => {
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\r') {
                    let line = pending[..pos].to_string();
                    pending.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    dispatch_line(&inner, &line).await;
                }
            }
        }
    }
}

/// Apply one control line's local side effects, then publish it verbatim.
///
/// This is the single path every event takes -- including the synthesized
/// `DISCONNECTED` after an abort -- so all waiters unblock uniformly.
pub(crate) async fn dispatch_line(inner: &Arc<ModemInner>, line: &str) {
    tracing::trace!(line, "modem event");
    match protocol::parse_event(line) {
        ModemEvent::Ptt(on) => {
            if let Some(ptt) = inner.ptt_controller() {
                // A failed keying request must not take down the adapter.
                let _ = ptt.set_ptt(on).await;
            }
        }
        ModemEvent::Busy(on) => inner.busy.store(on, Ordering::SeqCst),
        ModemEvent::Buffer(n) => inner.buffer.set(n),
        ModemEvent::Connected {
            source,
            destination,
        } => handle_connected(inner, &source, &destination, line).await,
        ModemEvent::Disconnected => handle_disconnected(inner).await,
        ModemEvent::Registered(id) => {
            tracing::info!(station = %id, "modem registered, full speed available");
        }
        ModemEvent::Ok
        | ModemEvent::IamAlive
        | ModemEvent::Pending
        | ModemEvent::CancelPending
        | ModemEvent::LinkRegistered
        | ModemEvent::LinkUnregistered
        | ModemEvent::Version(_) => {}
        ModemEvent::Unknown(l) => tracing::warn!(line = %l, "unexpected modem command"),
    }
    inner.bus.publish(line.to_string()).await;
}

async fn handle_connected(inner: &Arc<ModemInner>, source: &str, destination: &str, line: &str) {
    if source == inner.my_call {
        // Outbound link came up; the dialer is subscribed and consumes the
        // publication that follows.
        inner.set_link_state(LinkState::Connected);
    } else if destination == inner.my_call {
        inner.set_link_state(LinkState::Connected);
        if inner.acceptors.load(Ordering::SeqCst) > 0 {
            let conn = Connection::new(Arc::clone(inner), source.to_string());
            if inner.inbound_tx.try_send(conn).is_ok() {
                return;
            }
        }
        tracing::debug!(from = source, "no pending accept, dropping inbound connection");
        let _ = inner.write_cmd("DISCONNECT").await;
    } else {
        debug_assert!(false, "CONNECTED for a foreign link: {line}");
        tracing::error!(line, "CONNECTED names neither side of this station");
    }
}

pub(crate) async fn handle_disconnected(inner: &Arc<ModemInner>) {
    inner.set_link_state(LinkState::Disconnected);
    inner.buffer.reset();
    if inner.bw_overridden.swap(false, Ordering::SeqCst) {
        if let Some(bw) = inner.config.default_bandwidth {
            let _ = inner.write_cmd(&bw.command()).await;
        }
    }
}

/// Send `ABORT` and synthesize the `DISCONNECTED` publication locally.
///
/// The modem does not reliably echo `DISCONNECTED` after `ABORT` when it is
/// already mid-disconnect; routing the synthesized event through
/// [`dispatch_line`] keeps the waiter wake-up path identical to a real one.
pub(crate) async fn abort_link(inner: &Arc<ModemInner>) -> Result<()> {
    let res = inner.write_cmd("ABORT").await;
    dispatch_line(inner, "DISCONNECTED").await;
    res
}
