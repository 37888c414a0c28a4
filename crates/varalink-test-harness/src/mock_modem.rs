//! Mock VARA modem for protocol-level testing.
//!
//! [`MockVaraModem`] listens on two random loopback ports -- control and
//! data -- the way the real modem program does, and gives the test script
//! both sides of the conversation: assert on commands the adapter sends,
//! emit control events back, and move raw payload in either direction.
//!
//! # Example
//!
//! ```no_run
//! use varalink_test_harness::MockVaraModem;
//!
//! # async fn example() -> varalink_core::Result<()> {
//! let mut modem = MockVaraModem::start().await?;
//!
//! // ... point the adapter at modem.cmd_port() / modem.data_port() ...
//!
//! modem.expect_cmd("PUBLIC ON").await;
//! modem.emit("OK").await;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use varalink_core::error::{Error, Result};

/// How long expectation helpers wait before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A scripted stand-in for the modem program.
///
/// Accepts one connection on each socket. Commands arriving on the control
/// socket are split on CR and queued for [`next_cmd`](MockVaraModem::next_cmd) /
/// [`expect_cmd`](MockVaraModem::expect_cmd); payload chunks arriving on
/// the data socket are queued for [`next_payload`](MockVaraModem::next_payload).
pub struct MockVaraModem {
    host: String,
    cmd_port: u16,
    data_port: u16,

    cmds: mpsc::Receiver<String>,
    payloads: mpsc::Receiver<Vec<u8>>,
    cmd_out: mpsc::Sender<String>,
    data_out: mpsc::Sender<Vec<u8>>,
}

impl MockVaraModem {
    /// Bind both listeners and start serving the first client on each.
    pub async fn start() -> Result<Self> {
        let cmd_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock control port: {e}")))?;
        let data_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock data port: {e}")))?;
        let cmd_port = cmd_listener.local_addr().map_err(Error::Io)?.port();
        let data_port = data_listener.local_addr().map_err(Error::Io)?.port();

        let (cmds_tx, cmds_rx) = mpsc::channel(64);
        let (cmd_out_tx, cmd_out_rx) = mpsc::channel(64);
        let (payloads_tx, payloads_rx) = mpsc::channel(64);
        let (data_out_tx, data_out_rx) = mpsc::channel(64);

        tokio::spawn(serve_control(cmd_listener, cmds_tx, cmd_out_rx));
        tokio::spawn(serve_data(data_listener, payloads_tx, data_out_rx));

        Ok(Self {
            host: "127.0.0.1".to_string(),
            cmd_port,
            data_port,
            cmds: cmds_rx,
            payloads: payloads_rx,
            cmd_out: cmd_out_tx,
            data_out: data_out_tx,
        })
    }

    /// Host the mock is listening on (`127.0.0.1`).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the mock control socket.
    pub fn cmd_port(&self) -> u16 {
        self.cmd_port
    }

    /// Port of the mock data socket.
    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Emit one control line to the client, CR-terminated.
    pub async fn emit(&self, line: &str) {
        let _ = self.cmd_out.send(line.to_string()).await;
    }

    /// Send raw payload bytes on the data socket.
    pub async fn send_payload(&self, bytes: &[u8]) {
        let _ = self.data_out.send(bytes.to_vec()).await;
    }

    /// Receive the next command line the client sent, if any.
    pub async fn next_cmd(&mut self) -> Option<String> {
        self.cmds.recv().await
    }

    /// Receive the next payload chunk the client sent, if any.
    pub async fn next_payload(&mut self) -> Option<Vec<u8>> {
        self.payloads.recv().await
    }

    /// Assert that the next command from the client is exactly `want`.
    ///
    /// Panics on mismatch, on a closed control socket, or after five
    /// seconds of silence.
    pub async fn expect_cmd(&mut self, want: &str) {
        match tokio::time::timeout(EXPECT_TIMEOUT, self.cmds.recv()).await {
            Ok(Some(got)) => {
                assert_eq!(got, want, "command mismatch: expected {want:?}, got {got:?}");
            }
            Ok(None) => panic!("control socket closed while expecting {want:?}"),
            Err(_) => panic!("timed out waiting for command {want:?}"),
        }
    }

    /// Assert the next payload chunk is exactly `want`, with the same
    /// failure modes as [`expect_cmd`](MockVaraModem::expect_cmd).
    pub async fn expect_payload(&mut self, want: &[u8]) {
        match tokio::time::timeout(EXPECT_TIMEOUT, self.payloads.recv()).await {
            Ok(Some(got)) => {
                assert_eq!(got, want, "payload mismatch");
            }
            Ok(None) => panic!("data socket closed while expecting payload"),
            Err(_) => panic!("timed out waiting for payload"),
        }
    }

    /// Consume the adapter's startup preamble.
    pub async fn expect_preamble(&mut self, my_call: &str, hf: bool) {
        self.expect_cmd("PUBLIC ON").await;
        if hf {
            self.expect_cmd("CWID ON").await;
        }
        self.expect_cmd("COMPRESSION TEXT").await;
        self.expect_cmd(&format!("MYCALL {my_call}")).await;
        self.expect_cmd("LISTEN OFF").await;
    }
}

/// Accept one control-socket client; split inbound bytes on CR into the
/// command queue, and write queued outbound lines back CR-terminated.
async fn serve_control(
    listener: TcpListener,
    cmds_tx: mpsc::Sender<String>,
    mut cmd_out_rx: mpsc::Receiver<String>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (read, mut write) = stream.into_split();

    tokio::spawn(pump_control_lines(read, cmds_tx));

    while let Some(line) = cmd_out_rx.recv().await {
        let framed = format!("{line}\r");
        if write.write_all(framed.as_bytes()).await.is_err() {
            return;
        }
        let _ = write.flush().await;
    }
}

async fn pump_control_lines(mut read: OwnedReadHalf, cmds_tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending = String::new();
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\r') {
                    let line = pending[..pos].to_string();
                    pending.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    tracing::trace!(line, "mock modem received command");
                    if cmds_tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Accept one data-socket client; queue inbound chunks and write queued
/// outbound chunks.
async fn serve_data(
    listener: TcpListener,
    payloads_tx: mpsc::Sender<Vec<u8>>,
    mut data_out_rx: mpsc::Receiver<Vec<u8>>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (read, mut write) = stream.into_split();

    tokio::spawn(pump_payload(read, payloads_tx));

    while let Some(chunk) = data_out_rx.recv().await {
        if write.write_all(&chunk).await.is_err() {
            return;
        }
        let _ = write.flush().await;
    }
}

async fn pump_payload(mut read: OwnedReadHalf, payloads_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if payloads_tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}
