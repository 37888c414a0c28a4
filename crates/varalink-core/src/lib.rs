//! varalink-core: Core types, traits, and error definitions for varalink.
//!
//! This crate defines the modem-agnostic abstractions shared by the adapter
//! and by applications that consume it. Messaging software depends on these
//! types without pulling in the adapter's TCP machinery.
//!
//! # Key types
//!
//! - [`Error`] / [`Result`] -- error handling
//! - [`Scheme`] / [`Bandwidth`] / [`LinkState`] -- protocol domain types
//! - [`Addr`] -- callsign-based endpoint address
//! - [`ConnectUrl`] -- pre-parsed dial target
//! - [`PttController`] -- push-to-talk capability injected by the host

pub mod error;
pub mod ptt;
pub mod types;
pub mod url;

// Re-export key types at crate root for ergonomic `use varalink_core::*`.
pub use error::{Error, Result};
pub use ptt::PttController;
pub use types::{Addr, Bandwidth, LinkState, Scheme};
pub use url::ConnectUrl;
