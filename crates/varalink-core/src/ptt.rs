//! Push-to-talk capability.

use async_trait::async_trait;

use crate::error::Result;

/// A push-to-talk controller, typically hooked to a transceiver's keying
/// line.
///
/// The adapter calls [`set_ptt`](PttController::set_ptt) when the modem
/// requests a TX/RX transition (`PTT ON` / `PTT OFF`). Errors are swallowed
/// by the adapter: a failed keying request must not take down the control
/// channel, and VOX setups work with no controller at all.
#[async_trait]
pub trait PttController: Send + Sync {
    /// Key (`true`) or unkey (`false`) the transmitter.
    async fn set_ptt(&self, on: bool) -> Result<()>;
}
