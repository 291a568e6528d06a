//! WebSocket framing layer: carries MQTT bytes inside BINARY frames over
//! the TLS transport.

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{ProcessOutcome, WsCodec, WsError};
