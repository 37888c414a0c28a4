//! Protocol domain types: operating scheme, bandwidth, link state, and the
//! callsign-based endpoint address.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The modem's operating mode, doubling as the dial URL scheme.
///
/// HF mode carries extra per-dial knobs (bandwidth, session type) that FM
/// does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// VARA FM -- VHF/UHF FM operation.
    VaraFm,
    /// VARA HF -- HF operation with selectable bandwidth and session type.
    VaraHf,
}

impl Scheme {
    /// The URL scheme string (`"varafm"` / `"varahf"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::VaraFm => "varafm",
            Scheme::VaraHf => "varahf",
        }
    }

    /// Whether this is the HF variant.
    pub fn is_hf(&self) -> bool {
        matches!(self, Scheme::VaraHf)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "varafm" => Ok(Scheme::VaraFm),
            "varahf" => Ok(Scheme::VaraHf),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Channel bandwidth in hertz, from the modem's fixed set. HF only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// 500 Hz.
    B500,
    /// 2300 Hz.
    B2300,
    /// 2750 Hz.
    B2750,
}

impl Bandwidth {
    /// All supported bandwidths.
    pub fn all() -> &'static [Bandwidth] {
        &[Bandwidth::B500, Bandwidth::B2300, Bandwidth::B2750]
    }

    /// The bare hertz figure as it appears in URLs (`"500"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Bandwidth::B500 => "500",
            Bandwidth::B2300 => "2300",
            Bandwidth::B2750 => "2750",
        }
    }

    /// The modem command selecting this bandwidth (`"BW500"`, ...).
    pub fn command(&self) -> String {
        format!("BW{}", self.as_str())
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bandwidth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "500" => Ok(Bandwidth::B500),
            "2300" => Ok(Bandwidth::B2300),
            "2750" => Ok(Bandwidth::B2750),
            other => Err(Error::UnsupportedBandwidth(other.to_string())),
        }
    }
}

/// The state of the over-the-air link.
///
/// `Connected` is entered only on a `CONNECTED` event from the modem and
/// exited only on `DISCONNECTED` (real or synthesized by an abort).
/// `Connecting` is entered only by the dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link; the adapter is idle and may dial or accept.
    Disconnected,
    /// An outbound dial is in flight.
    Connecting,
    /// A link is established; payload may flow.
    Connected,
}

impl LinkState {
    /// The wire word published on the event bus for this state.
    ///
    /// These match the modem's own vocabulary so state watchers and
    /// modem-event watchers subscribe with the same prefixes.
    pub fn wire_word(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "DISCONNECTED",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_word())
    }
}

/// A link endpoint address: a callsign qualified by the operating scheme.
///
/// Stringifies as `<scheme>://<callsign>`, e.g. `varahf://W1XYZ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    scheme: Scheme,
    call: String,
}

impl Addr {
    /// Build an address from a scheme and callsign.
    pub fn new(scheme: Scheme, call: impl Into<String>) -> Self {
        Self {
            scheme,
            call: call.into(),
        }
    }

    /// The station callsign.
    pub fn call(&self) -> &str {
        &self.call
    }

    /// The operating scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.call)
    }
}
