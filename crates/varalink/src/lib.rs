//! # varalink -- VARA Modem Adapter for Amateur Radio Messaging
//!
//! `varalink` turns the external VARA modem program -- which exposes a
//! line-oriented control channel and a raw byte-stream data channel on two
//! separate TCP sockets -- into a generic, connection-oriented network
//! endpoint for higher-level messaging software.
//!
//! ## Quick Start
//!
//! Add `varalink` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! varalink = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Dial a remote station and exchange payload:
//!
//! ```no_run
//! use varalink::{ConnectUrl, Modem, ModemConfig, Scheme};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let modem = Modem::new(Scheme::VaraHf, "N0CALL", ModemConfig::default()).await?;
//!
//!     let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("bw", "500");
//!     let conn = modem.dial(&url).await?;
//!     println!("connected to {}", conn.remote_addr());
//!
//!     conn.write(b"hello").await?;
//!     conn.flush().await?;
//!     conn.close().await?;
//!     modem.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |------------|--------------------------------------------------------|
//! | `modem`    | Adapter lifecycle, command channel, link state machine |
//! | `protocol` | Control-socket event parsing                           |
//! | `pubsub`   | Prefix-filtered event fan-out                          |
//! | `buffer`   | Transmit-queue byte accounting                         |
//! | `dial`     | Outbound connect with cancellation                     |
//! | `listen`   | Inbound accept queue                                   |
//! | `conn`     | Byte-stream connection over the data socket            |
//!
//! The control socket is authoritative for link state; payload rides the
//! data socket with no cross-socket ordering guarantee. The adapter
//! compensates everywhere that race is observable: reads poll briefly for
//! payload that trailed a disconnect, graceful close waits out a settle
//! window after the last write, and writes stop feeding the modem once a
//! close has begun.
//!
//! ## Diagnostics
//!
//! The library logs through [`tracing`] and stays silent unless a
//! subscriber is installed. Setting the `VARALINK_TRACE` environment
//! variable and calling [`init_debug_tracing`] sends verbose wire-level
//! diagnostics to standard error.

mod buffer;
mod conn;
mod dial;
mod listen;
mod modem;
mod protocol;
mod pubsub;

pub use conn::Connection;
pub use listen::Listener;
pub use modem::{Modem, ModemConfig};
pub use protocol::ModemEvent;

// Re-export the core types so applications depend on one crate.
pub use varalink_core::{Addr, Bandwidth, ConnectUrl, Error, LinkState, PttController, Result, Scheme};

/// Install a stderr tracing subscriber when `VARALINK_TRACE` is set.
///
/// Without the variable this is a no-op and the library emits no
/// diagnostic output. Installation is best-effort: an already-installed
/// global subscriber wins.
pub fn init_debug_tracing() {
    if std::env::var_os("VARALINK_TRACE").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            "varalink=trace,varalink_core=trace",
        ))
        .try_init();
}
