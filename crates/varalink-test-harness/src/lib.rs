//! varalink-test-harness: a scripted mock of the VARA modem program.
//!
//! This crate provides [`MockVaraModem`] for deterministic testing of the
//! adapter against both TCP sockets (control and data) without a real
//! modem program or radio hardware.

pub mod mock_modem;

pub use mock_modem::MockVaraModem;
