//! Dial a remote station and send it one line of text.
//!
//! Demonstrates the full outbound flow: starting the adapter against a
//! running modem program, dialing with an optional bandwidth, pushing
//! payload through the throttled writer, flushing the transmit queue, and
//! closing gracefully.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p varalink --example dial -- N0CALL varahf://W1XYZ
//! ```
//!
//! Set `VARALINK_TRACE=1` for wire-level diagnostics on stderr.

use std::env;

use varalink::{ConnectUrl, Modem, ModemConfig, Scheme};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    varalink::init_debug_tracing();

    let mut args = env::args().skip(1);
    let my_call = args.next().unwrap_or_else(|| "N0CALL".to_string());
    let target = args.next().unwrap_or_else(|| "varahf://W1XYZ".to_string());

    let (scheme_str, call) = target
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("target must look like varahf://CALLSIGN"))?;
    let scheme: Scheme = scheme_str.parse()?;

    println!("Starting adapter as {my_call}...");
    let modem = Modem::new(scheme, my_call, ModemConfig::default()).await?;

    let url = ConnectUrl::new(scheme, call).with_param("bw", "500");
    println!("Dialing {call}...");
    let conn = modem.dial(&url).await?;
    println!("Connected: {} -> {}", conn.local_addr(), conn.remote_addr());

    conn.write(b"Hello from varalink!\r\n").await?;
    println!(
        "Payload queued ({} bytes outstanding), flushing...",
        conn.tx_buffer_len()
    );
    conn.flush().await?;

    conn.close().await?;
    modem.close().await?;
    println!("Link closed.");
    Ok(())
}
