//! Error types for varalink.
//!
//! All fallible operations across the adapter return [`Result<T>`], which
//! uses [`Error`] as the error type. Configuration, precondition, remote,
//! and transport-layer failures are all captured here.

/// The error type for all varalink operations.
///
/// Variants cover the full range of failure modes encountered when driving
/// the modem program: bad dial parameters, operations against a closed or
/// busy adapter, remote timeouts, and socket I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The dial URL's scheme does not match the adapter's scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// A dial-time bandwidth outside the supported set.
    #[error("bandwidth {0} not supported")]
    UnsupportedBandwidth(String),

    /// The adapter has been closed (or the modem program was lost).
    #[error("modem closed")]
    ModemClosed,

    /// A dial was attempted while a link is connecting or connected.
    ///
    /// The underlying modem is a single-link device; wait for the current
    /// link to reach the disconnected state before dialing again.
    #[error("modem busy")]
    ModemBusy,

    /// The listener has been closed; no further inbound links will be
    /// accepted through it.
    #[error("listener closed")]
    ListenerClosed,

    /// The modem reported `DISCONNECTED` before the link was established.
    ///
    /// This is the modem's own connect timeout firing, or the remote
    /// station refusing the call.
    #[error("connect timeout")]
    ConnectTimeout,

    /// The dial was cancelled by the caller's cancellation token.
    #[error("dial canceled")]
    Canceled,

    /// The modem did not acknowledge `DISCONNECT` within the close window;
    /// the link was aborted instead.
    #[error("disconnect timeout, connection aborted")]
    DisconnectTimeout,

    /// No `BUFFER` update arrived while waiting for transmit-queue space.
    #[error("write: buffer timeout")]
    BufferTimeout,

    /// No `BUFFER` update arrived while waiting for the transmit queue to
    /// drain.
    #[error("flush: buffer timeout")]
    FlushTimeout,

    /// The link left the connected state while an operation was in flight.
    #[error("end of stream")]
    EndOfStream,

    /// A per-connection read or write deadline expired.
    #[error("timeout waiting for data")]
    Timeout,

    /// A transport-level failure (TCP connect, command write).
    ///
    /// A command-socket write failure additionally marks the adapter
    /// closed: the modem program is presumed lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// An underlying I/O error on the control or data socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
