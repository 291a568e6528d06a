//! PAL (Platform Adapter Layer) bridge: the two-function boundary gluing
//! the MQTT codec's encoded bytes to the WS codec's ring buffers.
//!
//! A short write needs to signal back into the MQTT codec so it knows not
//! to re-encode the next packet until the previous one drains. Rather than
//! a shared boolean flag threaded through the client struct, that signal
//! is returned directly from [`send_all`] (see DESIGN.md, Open Question 3).

use crate::mqtt::{MqttCodec, MqttError, MqttEvent};
use crate::ws::WsCodec;

/// A single WS binary frame carries at most this many MQTT-encoded bytes.
/// Keeps any one `send_all` call's frame comfortably inside the WS write
/// ring even when several small PUBLISHes have queued up back to back.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Everything currently queued in the MQTT codec's send buffer made it
    /// into the WS write ring.
    Complete,
    /// The WS write ring didn't have room for the next frame; nothing was
    /// consumed from the MQTT send buffer. The caller should arm POLLOUT
    /// and retry once the socket drains.
    Partial,
}

/// Moves as much of `mqtt.send_buf` as fits into `ws`'s write ring,
/// framing each chunk as a WS BINARY frame.
pub fn send_all(mqtt: &mut MqttCodec, ws: &mut WsCodec) -> SendOutcome {
    loop {
        if mqtt.send_buf.is_empty() {
            return SendOutcome::Complete;
        }
        let chunk = {
            let snapshot = mqtt.send_buf.peek_contiguous();
            let take = snapshot.len().min(MAX_FRAME_PAYLOAD);
            snapshot[..take].to_vec()
        };
        if !ws.send(crate::ws::frame::OP_BINARY, &chunk) {
            return SendOutcome::Partial;
        }
        mqtt.send_buf.bump_tail(chunk.len());
    }
}

/// Pops everything currently sitting in `ws.to_mqtt` and feeds it through
/// the MQTT codec, returning the events those bytes produced. Matches the
/// source's `mqtt_pal_recvall`, which pops up to its caller-supplied cap
/// and returns 0 to mean "nothing to read right now" — here, an empty
/// event list plus 0 bytes consumed means the same thing.
pub fn recv_all(mqtt: &mut MqttCodec, ws: &mut WsCodec) -> Result<Vec<MqttEvent>, MqttError> {
    if ws.to_mqtt.is_empty() {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; ws.to_mqtt.len()];
    let n = ws.to_mqtt.pop(&mut buf);
    mqtt.sync(&buf[..n])
}
