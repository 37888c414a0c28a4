//! Pre-parsed dial target.
//!
//! URL parsing itself belongs to the host application's transport registry;
//! the adapter consumes the already-decomposed form: scheme, target
//! callsign, and query parameters.

use std::collections::HashMap;

use crate::types::Scheme;

/// A dial target: scheme, remote callsign, and optional query parameters.
///
/// Recognized parameters are `bw` (bandwidth in hertz, HF) and `p2p`
/// (`"true"` selects a peer-to-peer session instead of Winlink, HF).
/// Unknown parameters are carried but ignored by the dialer.
///
/// # Example
///
/// ```
/// use varalink_core::{ConnectUrl, Scheme};
///
/// let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("bw", "500");
/// assert_eq!(url.target(), "W1XYZ");
/// assert_eq!(url.param("bw"), Some("500"));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectUrl {
    scheme: Scheme,
    target: String,
    params: HashMap<String, String>,
}

impl ConnectUrl {
    /// Build a dial target with no parameters.
    pub fn new(scheme: Scheme, target: impl Into<String>) -> Self {
        Self {
            scheme,
            target: target.into(),
            params: HashMap::new(),
        }
    }

    /// Add a query parameter (builder style).
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The URL scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The remote station callsign.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Look up a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}
