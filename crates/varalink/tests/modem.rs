//! Integration tests driving the adapter against a scripted mock modem
//! over real loopback sockets, covering the startup preamble, outbound and
//! inbound link establishment, payload flow with write pacing, and the
//! graceful/forced teardown paths.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use varalink::{
    Bandwidth, ConnectUrl, Connection, Error, Modem, ModemConfig, PttController, Scheme,
};
use varalink_test_harness::MockVaraModem;

/// Start the mock and an adapter pointed at it, consuming the preamble.
async fn start_modem(scheme: Scheme, my_call: &str) -> (Modem, MockVaraModem) {
    start_modem_with(scheme, my_call, None).await
}

async fn start_modem_with(
    scheme: Scheme,
    my_call: &str,
    default_bandwidth: Option<Bandwidth>,
) -> (Modem, MockVaraModem) {
    let mut mock = MockVaraModem::start().await.unwrap();
    let config = ModemConfig {
        host: mock.host().to_string(),
        cmd_port: mock.cmd_port(),
        data_port: mock.data_port(),
        default_bandwidth,
    };
    let modem = Modem::new(scheme, my_call, config).await.unwrap();
    mock.expect_preamble(my_call, scheme.is_hf()).await;
    (modem, mock)
}

/// Dial an FM link to `target` and resolve it with a `CONNECTED` event.
async fn establish_fm(modem: &Modem, mock: &mut MockVaraModem, target: &str) -> Connection {
    let url = ConnectUrl::new(Scheme::VaraFm, target);
    let (conn, _) = tokio::join!(modem.dial(&url), async {
        mock.expect_cmd(&format!("CONNECT N0CALL {target}")).await;
        mock.emit(&format!("CONNECTED N0CALL {target}")).await;
    });
    conn.unwrap()
}

/// Poll a condition for up to two seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

struct RecordingPtt(Mutex<Vec<bool>>);

#[async_trait]
impl PttController for RecordingPtt {
    async fn set_ptt(&self, on: bool) -> varalink::Result<()> {
        self.0.lock().unwrap().push(on);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Startup and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_preamble_fm() {
    let (modem, _mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    assert!(modem.ping());
    assert!(modem.idle());
    assert_eq!(modem.local_addr().to_string(), "varafm://N0CALL");
    modem.close().await.unwrap();
}

#[tokio::test]
async fn startup_preamble_hf_includes_cwid() {
    // expect_preamble asserts the CWID ON line for HF.
    let (modem, _mock) = start_modem(Scheme::VaraHf, "N0CALL").await;
    modem.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_kills_ping() {
    let (modem, _mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    modem.close().await.unwrap();
    modem.close().await.unwrap();
    assert!(!modem.ping());

    let url = ConnectUrl::new(Scheme::VaraFm, "W1XYZ");
    assert!(matches!(modem.dial(&url).await, Err(Error::ModemClosed)));
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_dial_hf_winlink_500() {
    let (modem, mut mock) = start_modem(Scheme::VaraHf, "N0CALL").await;

    let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("bw", "500");
    let (conn, _) = tokio::join!(modem.dial(&url), async {
        mock.expect_cmd("BW500").await;
        mock.expect_cmd("WINLINK SESSION").await;
        mock.expect_cmd("CONNECT N0CALL W1XYZ").await;
        mock.emit("OK").await;
        mock.emit("CONNECTED N0CALL W1XYZ").await;
    });
    let conn = conn.unwrap();

    assert_eq!(conn.remote_addr().to_string(), "varahf://W1XYZ");
    assert_eq!(conn.local_addr().to_string(), "varahf://N0CALL");
    assert!(!modem.idle());
}

#[tokio::test]
async fn dial_p2p_session() {
    let (modem, mut mock) = start_modem(Scheme::VaraHf, "N0CALL").await;

    let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("p2p", "true");
    let (conn, _) = tokio::join!(modem.dial(&url), async {
        mock.expect_cmd("P2P SESSION").await;
        mock.expect_cmd("CONNECT N0CALL W1XYZ").await;
        mock.emit("CONNECTED N0CALL W1XYZ").await;
    });
    conn.unwrap();
}

#[tokio::test]
async fn dial_rejects_wrong_scheme() {
    let (modem, _mock) = start_modem(Scheme::VaraHf, "N0CALL").await;
    let url = ConnectUrl::new(Scheme::VaraFm, "W1XYZ");
    assert!(matches!(
        modem.dial(&url).await,
        Err(Error::UnsupportedScheme(_))
    ));
}

#[tokio::test]
async fn dial_rejects_bad_bandwidth() {
    let (modem, _mock) = start_modem(Scheme::VaraHf, "N0CALL").await;
    let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("bw", "1200");
    assert!(matches!(
        modem.dial(&url).await,
        Err(Error::UnsupportedBandwidth(_))
    ));
}

#[tokio::test]
async fn dial_refused_is_connect_timeout() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    let url = ConnectUrl::new(Scheme::VaraFm, "W1XYZ");
    let (res, _) = tokio::join!(modem.dial(&url), async {
        mock.expect_cmd("CONNECT N0CALL W1XYZ").await;
        mock.emit("DISCONNECTED").await;
    });
    assert!(matches!(res, Err(Error::ConnectTimeout)));
    assert!(modem.idle());
}

#[tokio::test]
async fn dial_cancelled_sends_disconnect() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    let url = ConnectUrl::new(Scheme::VaraFm, "W1XYZ");
    let token = CancellationToken::new();
    let (res, _) = tokio::join!(modem.dial_with_cancel(&url, token.clone()), async {
        mock.expect_cmd("CONNECT N0CALL W1XYZ").await;
        token.cancel();
        mock.expect_cmd("DISCONNECT").await;
        mock.emit("DISCONNECTED").await;
    });
    assert!(matches!(res, Err(Error::Canceled)));
    assert!(modem.idle());
}

#[tokio::test]
async fn dial_while_connected_is_busy() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let _conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    let url = ConnectUrl::new(Scheme::VaraFm, "K9ABC");
    assert!(matches!(modem.dial(&url).await, Err(Error::ModemBusy)));
}

#[tokio::test]
async fn dial_bw_override_restored_on_disconnect() {
    let (modem, mut mock) =
        start_modem_with(Scheme::VaraHf, "N0CALL", Some(Bandwidth::B2300)).await;

    let url = ConnectUrl::new(Scheme::VaraHf, "W1XYZ").with_param("bw", "500");
    let (conn, _) = tokio::join!(modem.dial(&url), async {
        mock.expect_cmd("BW500").await;
        mock.expect_cmd("WINLINK SESSION").await;
        mock.expect_cmd("CONNECT N0CALL W1XYZ").await;
        mock.emit("CONNECTED N0CALL W1XYZ").await;
    });
    let _conn = conn.unwrap();

    mock.emit("DISCONNECTED").await;
    mock.expect_cmd("BW2300").await;
    wait_until(|| modem.idle()).await;
}

// ---------------------------------------------------------------------------
// Listening
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_accept() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    let listener = modem.listen().await.unwrap();
    mock.expect_cmd("LISTEN ON").await;

    let (conn, _) = tokio::join!(listener.accept(), async {
        // Give the acceptor a beat to register before the link arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.emit("CONNECTED K9ABC N0CALL").await;
    });
    let conn = conn.unwrap();
    assert_eq!(conn.remote_addr().to_string(), "varafm://K9ABC");
    assert!(!modem.idle());
}

#[tokio::test]
async fn inbound_without_acceptor_is_dropped() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    mock.emit("CONNECTED K9ABC N0CALL").await;
    mock.expect_cmd("DISCONNECT").await;
    drop(modem);
}

#[tokio::test]
async fn listener_close_sentinel_never_blocks() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    let listener = modem.listen().await.unwrap();
    mock.expect_cmd("LISTEN ON").await;

    listener.close().await.unwrap();
    mock.expect_cmd("LISTEN OFF").await;

    // Closed listener fails fast, repeatedly.
    for _ in 0..3 {
        let res = tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;
        assert!(matches!(res, Ok(Err(Error::ListenerClosed))));
    }

    // LISTEN OFF is sent exactly once.
    listener.close().await.unwrap();
    let extra = tokio::time::timeout(Duration::from_millis(300), mock.next_cmd()).await;
    assert!(extra.is_err(), "unexpected extra command after second close");
}

// ---------------------------------------------------------------------------
// Payload flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_round_trip_and_gauge() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    mock.send_payload(b"hello").await;
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let written = conn.write(b"world").await.unwrap();
    assert_eq!(written, 5);
    mock.expect_payload(b"world").await;
    assert_eq!(conn.tx_buffer_len(), 5);
}

#[tokio::test]
async fn read_returns_payload_that_raced_a_disconnect() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    let mut buf = [0u8; 64];
    let (res, _) = tokio::join!(conn.read(&mut buf), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The event arrives first; payload trails on the other socket.
        mock.emit("DISCONNECTED").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.send_payload(b"trailing").await;
    });
    let n = res.unwrap();
    assert_eq!(&buf[..n], b"trailing");

    // The link is down now; further reads end the stream immediately.
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn read_gives_up_after_disconnect_grace() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    let started = Instant::now();
    let mut buf = [0u8; 64];
    let (res, _) = tokio::join!(conn.read(&mut buf), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.emit("DISCONNECTED").await;
    });
    assert_eq!(res.unwrap(), 0);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "gave up too early: {elapsed:?}");
}

#[tokio::test]
async fn write_throttles_until_buffer_drains() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = Arc::new(establish_fm(&modem, &mut mock, "W1XYZ").await);

    mock.emit("BUFFER 700").await;
    wait_until(|| conn.tx_buffer_len() == 700).await;

    // 700 >= 7 * 100: the write must park.
    let writer = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.write(&[0u8; 100]).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!writer.is_finished(), "write proceeded against a full queue");

    // 500 < 700: the pending write unblocks and commits.
    mock.emit("BUFFER 500").await;
    let written = writer.await.unwrap().unwrap();
    assert_eq!(written, 100);
    mock.expect_payload(&[0u8; 100]).await;
    assert_eq!(conn.tx_buffer_len(), 600);
}

#[tokio::test]
async fn write_after_disconnect_is_end_of_stream() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    mock.emit("DISCONNECTED").await;
    wait_until(|| modem.idle()).await;

    assert!(matches!(
        conn.write(b"late").await,
        Err(Error::EndOfStream)
    ));
}

#[tokio::test]
async fn buffer_gauge_resets_on_disconnect() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    mock.emit("BUFFER 500").await;
    wait_until(|| conn.tx_buffer_len() == 500).await;

    mock.emit("DISCONNECTED").await;
    wait_until(|| conn.tx_buffer_len() == 0).await;
}

#[tokio::test]
async fn flush_waits_for_empty_queue() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = Arc::new(establish_fm(&modem, &mut mock, "W1XYZ").await);

    mock.emit("BUFFER 300").await;
    wait_until(|| conn.tx_buffer_len() == 300).await;

    let flusher = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.flush().await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!flusher.is_finished(), "flush returned with a non-empty queue");

    mock.emit("BUFFER 0").await;
    flusher.await.unwrap().unwrap();
}

#[tokio::test]
async fn flush_fails_on_disconnect() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = Arc::new(establish_fm(&modem, &mut mock, "W1XYZ").await);

    mock.emit("BUFFER 300").await;
    wait_until(|| conn.tx_buffer_len() == 300).await;

    let flusher = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.flush().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    mock.emit("DISCONNECTED").await;
    assert!(matches!(
        flusher.await.unwrap(),
        Err(Error::EndOfStream)
    ));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_close_waits_out_the_write_settle() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    conn.write(b"data").await.unwrap();
    mock.expect_payload(b"data").await;
    let written_at = Instant::now();

    let (res, _) = tokio::join!(conn.close(), async {
        mock.expect_cmd("DISCONNECT").await;
        let waited = written_at.elapsed();
        assert!(
            waited >= Duration::from_millis(1500),
            "DISCONNECT sent only {waited:?} after the last write"
        );
        mock.emit("DISCONNECTED").await;
    });
    res.unwrap();
    assert!(modem.idle());
}

#[tokio::test]
async fn close_emits_exactly_one_disconnect() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    let (res, _) = tokio::join!(conn.close(), async {
        mock.expect_cmd("DISCONNECT").await;
        mock.emit("DISCONNECTED").await;
    });
    res.unwrap();

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    let extra = tokio::time::timeout(Duration::from_millis(300), mock.next_cmd()).await;
    assert!(extra.is_err(), "close sent more than one DISCONNECT");
}

#[tokio::test]
async fn write_during_close_parks_until_teardown() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = Arc::new(establish_fm(&modem, &mut mock, "W1XYZ").await);

    let closer = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.close().await }
    });
    mock.expect_cmd("DISCONNECT").await;

    // The close is in flight; a concurrent write must not feed the modem.
    let writer = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.write(b"late bytes").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer.is_finished(), "write slipped through during close");

    mock.emit("DISCONNECTED").await;
    assert!(matches!(
        writer.await.unwrap(),
        Err(Error::EndOfStream)
    ));
    closer.await.unwrap().unwrap();
}

#[tokio::test]
async fn abort_synthesizes_disconnect_locally() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    modem.abort().await.unwrap();
    mock.expect_cmd("ABORT").await;

    // No modem-originated DISCONNECTED needed: state resolved locally.
    assert!(modem.idle());
    assert_eq!(conn.tx_buffer_len(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn modem_close_tears_down_active_link() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;
    let _conn = establish_fm(&modem, &mut mock, "W1XYZ").await;

    let (res, _) = tokio::join!(modem.close(), async {
        mock.expect_cmd("DISCONNECT").await;
        mock.emit("DISCONNECTED").await;
    });
    res.unwrap();
    assert!(!modem.ping());
}

// ---------------------------------------------------------------------------
// Event fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn busy_flag_follows_events() {
    let (modem, mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    assert!(!modem.busy());
    mock.emit("BUSY ON").await;
    wait_until(|| modem.busy()).await;
    mock.emit("BUSY OFF").await;
    wait_until(|| !modem.busy()).await;
}

#[tokio::test]
async fn ptt_events_drive_the_controller() {
    let (modem, mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    let ptt = Arc::new(RecordingPtt(Mutex::new(Vec::new())));
    modem.set_ptt_controller(Some(ptt.clone()));

    mock.emit("PTT ON").await;
    mock.emit("PTT OFF").await;
    wait_until(|| ptt.0.lock().unwrap().len() == 2).await;
    assert_eq!(*ptt.0.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn unknown_and_informational_events_are_ignored() {
    let (modem, mut mock) = start_modem(Scheme::VaraFm, "N0CALL").await;

    for line in [
        "OK",
        "IAMALIVE",
        "PENDING",
        "CANCELPENDING",
        "REGISTERED N0CALL",
        "LINK REGISTERED",
        "LINK UNREGISTERED",
        "VERSION 4.8.1",
        "WRONG",
    ] {
        mock.emit(line).await;
    }

    // The adapter stays idle and responsive through all of them.
    let conn = establish_fm(&modem, &mut mock, "W1XYZ").await;
    assert_eq!(conn.remote_addr().call(), "W1XYZ");
}
