//! WebSocket codec: owns `reset`, `process`, `send`, and the three ring
//! buffers the service pump drives it through. Binary
//! frames carry MQTT bytes in both directions; the client also answers
//! server PINGs with a PONG and unwraps/forwards CONNECTION_CLOSE so the
//! disconnect driver can complete its own close handshake.

use crate::ringbuf::RingBuf;
use crate::ws::frame::{self, DecodeOutcome};
use crate::ws::handshake;

/// Raised when the peer sends something this client cannot make sense of:
/// a non-masked close with a truncated status code, a control frame larger
/// than 125 bytes (RFC 6455 §5.5), a frame this engine never expects to
/// receive server-masked (servers must not mask), or a handshake response
/// that never upgrades to 101.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WsError {
    #[error("server sent a masked frame")]
    ServerMaskedFrame,
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,
    #[error("close frame payload shorter than the status code")]
    TruncatedCloseFrame,
    #[error("server rejected the websocket upgrade request")]
    HandshakeRejected,
}

/// What happened during one [`WsCodec::process`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The peer sent a CONNECTION_CLOSE frame; its status code is recorded
    /// here. The caller (the service routine) treats this the same as a
    /// protocol error for the purposes of tearing the connection down,
    /// except during an in-progress graceful disconnect, where it's the
    /// expected terminal event.
    pub peer_closed: Option<u16>,
    /// True if any binary frame payload was appended to the to-MQTT ring
    /// this call — lets the caller decide whether to run the MQTT phase.
    pub delivered_to_mqtt: bool,
}

/// A monotonic, non-cryptographic mask key generator. RFC 6455 only
/// requires the key be "unpredictable" to intermediaries inspecting the
/// wire for a fixed pattern, not that it resist a determined attacker; this
/// client has no dependency elsewhere in this stack that offers randomness,
/// so it mixes the frame counter into a fixed-seed xorshift instead of
/// pulling in a new crate for it.
#[derive(Debug)]
struct MaskKeys {
    state: u64,
}

impl MaskKeys {
    fn new(seed: u64) -> Self {
        Self {
            state: seed | 1,
        }
    }

    fn next(&mut self) -> [u8; 4] {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        let bytes = x.to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3]]
    }
}

pub struct WsCodec {
    pub read: RingBuf,
    pub write: RingBuf,
    pub to_mqtt: RingBuf,
    mask_keys: MaskKeys,
    established: bool,
    handshake_sent: bool,
}

impl WsCodec {
    pub fn new(buf_capacity: usize, mask_seed: u64) -> Self {
        Self {
            read: RingBuf::with_capacity(buf_capacity),
            write: RingBuf::with_capacity(buf_capacity),
            to_mqtt: RingBuf::with_capacity(buf_capacity),
            mask_keys: MaskKeys::new(mask_seed),
            established: false,
            handshake_sent: false,
        }
    }

    /// Clears all buffered state for a fresh connection attempt, matching
    /// the source's WS-codec reset at the start of `mqtt_wss_connect`.
    pub fn reset(&mut self) {
        self.read.reset();
        self.write.reset();
        self.to_mqtt.reset();
        self.established = false;
        self.handshake_sent = false;
    }

    pub fn established(&self) -> bool {
        self.established
    }

    /// Enqueues the HTTP Upgrade request. Idempotent: a second call after
    /// the first is a no-op, since the connect driver and the first
    /// service iteration can race to kick this off.
    pub fn begin_handshake(&mut self, host: &str, path: &str, nonce: [u8; 16]) -> bool {
        if self.handshake_sent {
            return true;
        }
        let request = handshake::build_request(host, path, nonce);
        if request.len() > self.write.capacity() - self.write.len() {
            return false;
        }
        self.write.push(&request);
        self.handshake_sent = true;
        true
    }

    /// Looks for a complete HTTP response in `read`. Any bytes past the
    /// header terminator are already frame data and are left in the ring
    /// for `process` to parse once `established` flips true.
    pub fn drive_handshake(&mut self) -> Result<bool, WsError> {
        if self.established {
            return Ok(true);
        }
        let snapshot = self.read.peek_contiguous();
        match handshake::parse_response(&snapshot) {
            handshake::HandshakeOutcome::NeedMoreBytes => Ok(false),
            handshake::HandshakeOutcome::Rejected => Err(WsError::HandshakeRejected),
            handshake::HandshakeOutcome::Complete { consumed } => {
                self.read.bump_tail(consumed);
                self.established = true;
                Ok(true)
            }
        }
    }

    /// Frames `payload` under `opcode` and appends it to the write ring.
    /// Returns `false` if the frame doesn't fit, leaving the ring
    /// untouched (the caller surfaces this as a "too large" failure rather
    /// than a partial write, since frame headers are never split across
    /// a `send` call).
    pub fn send(&mut self, opcode: u8, payload: &[u8]) -> bool {
        let mask = self.mask_keys.next();
        let mut framed = Vec::with_capacity(payload.len() + 14);
        frame::encode_masked(&mut framed, opcode, payload, mask);
        if framed.len() > self.write.capacity() - self.write.len() {
            return false;
        }
        self.write.push(&framed);
        true
    }

    /// Parses as many complete frames as are currently buffered in `read`,
    /// forwarding binary-frame payloads to `to_mqtt` and answering
    /// server PINGs with a PONG written back into `write`.
    pub fn process(&mut self) -> Result<ProcessOutcome, WsError> {
        let mut outcome = ProcessOutcome::default();

        loop {
            if self.read.is_empty() {
                break;
            }
            // A frame header or payload may straddle the ring's wrap
            // point; `peek_contiguous` stitches the two segments together
            // so the parser always sees one flat slice.
            let snapshot = self.read.peek_contiguous();
            match frame::decode_header(&snapshot) {
                DecodeOutcome::NeedMoreBytes => break,
                DecodeOutcome::Header(header) => {
                    if header.mask.is_some() {
                        return Err(WsError::ServerMaskedFrame);
                    }
                    let total = header.header_len + header.payload_len;
                    let payload = snapshot[header.header_len..total].to_vec();

                    match header.opcode {
                        frame::OP_BINARY | frame::OP_CONTINUATION => {
                            self.to_mqtt.push(&payload);
                            outcome.delivered_to_mqtt = true;
                        }
                        frame::OP_PING => {
                            if payload.len() > 125 {
                                return Err(WsError::ControlFrameTooLarge);
                            }
                            self.send(frame::OP_PONG, &payload);
                        }
                        frame::OP_PONG => {}
                        frame::OP_CONNECTION_CLOSE => {
                            if !payload.is_empty() && payload.len() < 2 {
                                return Err(WsError::TruncatedCloseFrame);
                            }
                            let status = if payload.len() >= 2 {
                                u16::from_be_bytes([payload[0], payload[1]])
                            } else {
                                1005 // RFC 6455 §7.1.5: "no status code present"
                            };
                            outcome.peer_closed = Some(status);
                        }
                        _ => {}
                    }

                    self.read.bump_tail(total);
                }
            }
        }

        Ok(outcome)
    }

    /// Encodes a CONNECTION_CLOSE frame with the given status code, as the
    /// last step of the disconnect driver's close handshake.
    pub fn send_close(&mut self, status: u16) -> bool {
        self.send(frame::OP_CONNECTION_CLOSE, &status.to_be_bytes())
    }
}
