//! Graceful disconnect driver: announce intent to stop accepting new work,
//! send MQTT DISCONNECT, send a WS close frame, drain whatever the peer
//! sends back for a bounded time, then tear the socket down regardless of
//! whether the peer ever answered.

use std::time::{Duration, Instant};

use crate::error::ServiceError;
use crate::log::Level;

use super::Client;

/// RFC 6455 §7.4.1 "Normal Closure".
const WS_STATUS_NORMAL_CLOSURE: u16 = 1000;

/// Four quarter-bounded steps, each given `total_timeout / 4`: drain
/// whatever was already queued before we touch anything, send DISCONNECT
/// and drain that out, send the WS close frame and drain that out, then
/// wait for the peer's own close frame (or its TCP socket dropping, which
/// is the common case — peers routinely close the connection right after
/// the MQTT DISCONNECT instead of answering with a WS close frame).
pub(crate) fn run(client: &mut Client, total_timeout: Duration) {
    let step_timeout = total_timeout / 4;

    // Step 1: stop accepting new publishes/subscribes.
    {
        let mut codecs = client.codecs.lock().unwrap();
        codecs.disconnecting = true;
    }

    // Step 2: drain any backlog that was already queued before this call,
    // so it doesn't compete with the DISCONNECT packet for ring space.
    drain_for(client, step_timeout);

    // Step 3: MQTT DISCONNECT.
    {
        let mut codecs = client.codecs.lock().unwrap();
        let _ = codecs.mqtt.disconnect();
    }
    drain_for(client, step_timeout);

    // Step 4: WS close handshake.
    {
        let mut codecs = client.codecs.lock().unwrap();
        codecs.ws.send_close(WS_STATUS_NORMAL_CLOSURE);
    }
    drain_for(client, step_timeout);

    // Step 5: wait for the peer to answer with its own close (or drop the
    // connection outright).
    let peer_closed = drain_until_peer_closes(client, step_timeout);
    if !peer_closed {
        client.log(Level::Warn, format_args!("disconnect timed out waiting for the peer's close frame"));
    }

    // Tear the socket down unconditionally.
    client.transport = None;
    client.socket_fd = None;
    {
        let mut codecs = client.codecs.lock().unwrap();
        codecs.mqtt_connected = false;
        codecs.disconnecting = false;
    }
}

fn drain_for(client: &mut Client, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        if client.service(Some(remaining)).is_err() {
            return;
        }
    }
}

fn drain_until_peer_closes(client: &mut Client, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match client.service(Some(remaining)) {
            Ok(outcome) if outcome.peer_closed.is_some() => return true,
            Ok(_) => continue,
            // The peer closing its TCP socket right after the MQTT
            // DISCONNECT is the common path, not a failure to observe a
            // close — there's nothing left to wait for either way.
            Err(ServiceError::ConnDrop(_)) => return true,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::tls::FakeTransport;
    use crate::ws::frame;

    use super::*;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_side = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client_side, server_side)
    }

    fn unmasked_close_frame(status: u16) -> Vec<u8> {
        let mut out = vec![0x80 | frame::OP_CONNECTION_CLOSE, 2];
        out.extend_from_slice(&status.to_be_bytes());
        out
    }

    /// Builds a `Client` already past the WS handshake, with its
    /// `FakeTransport` and the loopback ends that must stay alive wired in.
    fn connected_client() -> (Client, FakeTransport, TcpStream, TcpStream, Arc<Mutex<Vec<String>>>) {
        crate::test_support::init_tracing();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let lines2 = lines.clone();
        let mut client = Client::new(
            "test",
            Box::new(move |_level, msg| lines2.lock().unwrap().push(msg.to_string())),
            Box::new(|_, _, _| {}),
            Box::new(|_| {}),
        )
        .unwrap();

        let (client_side, mut server_side) = loopback_pair();
        let fake = FakeTransport::new();
        client.socket_fd = Some(client_side.as_raw_fd());
        client.transport = Some(Box::new(fake.clone()));
        client.host = Arc::from("broker.example");

        server_side.write_all(&[0u8]).unwrap();
        client.service(Some(Duration::from_millis(50))).unwrap();
        fake.take_outbound();

        fake.feed(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
        server_side.write_all(&[0u8]).unwrap();
        client.service(Some(Duration::from_millis(50))).unwrap();
        assert!(client.codecs.lock().unwrap().ws.established());

        (client, fake, client_side, server_side, lines)
    }

    #[test]
    fn idle_disconnect_sends_mqtt_disconnect_then_a_ws_close_frame() {
        let (mut client, fake, _client_side, mut server_side, lines) = connected_client();

        // The peer answers with its own close frame once the local one has
        // gone out. `total_timeout=800ms` splits into four 200ms steps:
        // backlog drain (0-200ms), DISCONNECT drain (200-400ms), WS-close
        // drain (400-600ms), wait-for-peer-close (600-800ms). Sleeping
        // 700ms keeps the feed squarely inside that last step instead of
        // being silently consumed by an earlier drain that doesn't look at
        // `peer_closed`.
        let responder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(700));
            fake.feed(&unmasked_close_frame(1000));
            server_side.write_all(&[0u8]).unwrap();
            fake
        });

        client.disconnect(Duration::from_millis(800));
        let fake = responder.join().unwrap();

        assert!(client.transport.is_none());
        assert!(client.socket_fd.is_none());
        assert!(!client.is_connected());
        assert!(
            !lines.lock().unwrap().iter().any(|l| l.contains("timed out")),
            "peer's close frame should have been observed before the budget ran out"
        );

        let sent = fake.take_outbound();
        // FIN+binary, masked (client frames always are), 2-byte DISCONNECT payload.
        let disconnect_frame_start = [0x82, 0x82];
        assert!(sent.len() >= 2, "expected at least one outbound frame");
        assert_eq!(&sent[..2], &disconnect_frame_start[..], "first frame should carry the MQTT DISCONNECT");
    }

    #[test]
    fn disconnect_tears_down_the_session_even_if_the_peer_never_answers() {
        let (mut client, _fake, _client_side, _server_side, lines) = connected_client();

        client.disconnect(Duration::from_millis(40));

        assert!(client.transport.is_none());
        assert!(client.socket_fd.is_none());
        assert!(lines.lock().unwrap().iter().any(|l| l.contains("timed out")));
    }
}
