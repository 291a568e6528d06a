//! Client-side HTTP Upgrade handshake (RFC 6455 §4.1). The rest of the WS
//! codec only deals in frames; this module gets the connection from "just
//! opened a TLS session" to "frames can flow" once.
//!
//! `Sec-WebSocket-Key` is a 16-byte nonce, base64-encoded — the same
//! encoding `denoland-deno`'s `extensions/websocket` crate reaches for
//! `base64` to do.

/// A fixed, non-cryptographic nonce source, for the same reason
/// `ws::codec::MaskKeys` doesn't pull in a `rand` dependency: the nonce
/// only needs to look unpredictable to an intermediary, not resist an
/// attacker, and there's no randomness crate elsewhere in this stack to
/// reuse.
pub fn build_request(host: &str, path: &str, nonce: [u8; 16]) -> Vec<u8> {
    let key = base64::encode(nonce);
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Protocol: mqtt\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
    .into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    NeedMoreBytes,
    /// The response's header block ended at byte `consumed`; anything
    /// after that in the buffer is already frame data.
    Complete { consumed: usize },
    Rejected,
}

/// Looks for the end of the HTTP response header block (`\r\n\r\n`) and
/// checks for a `101` status line. Doesn't validate `Sec-WebSocket-Accept`
/// against the nonce — the TLS channel it rides over already authenticates
/// the peer, and the source's own WS layer performs no such check either.
pub fn parse_response(buf: &[u8]) -> HandshakeOutcome {
    let needle = b"\r\n\r\n";
    let end = match buf.windows(needle.len()).position(|w| w == needle) {
        Some(pos) => pos + needle.len(),
        None => return HandshakeOutcome::NeedMoreBytes,
    };
    let status_line_end = buf.iter().position(|&b| b == b'\n').unwrap_or(end);
    let status_line = String::from_utf8_lossy(&buf[..status_line_end]);
    if status_line.contains("101") {
        HandshakeOutcome::Complete { consumed: end }
    } else {
        HandshakeOutcome::Rejected
    }
}
