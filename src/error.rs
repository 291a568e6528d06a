//! Crate-wide error types.
//!
//! The original engine reports failure as small integer codes (see
//! `mqtt_wss_connect`/`mqtt_wss_service` in the C source). Each family below
//! corresponds to one of those integer codes, but carries a message and,
//! where one exists, the underlying `io::Error` as `source()`.

use std::io;
use thiserror::Error;

/// Failures from [`crate::Client::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not resolve host: {0}")]
    Resolve(#[from] crate::dns::ResolveError),
    #[error("tcp connect failed: {0}")]
    TcpConnect(#[source] io::Error),
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("mqtt codec rejected CONNECT parameters")]
    MqttEncode,
    #[error("connection dropped waiting for CONNACK")]
    Rejected(#[from] ServiceError),
}

/// Failures from [`crate::Client::service`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("poll failed: {0}")]
    PollFailed(#[source] io::Error),
    #[error("connection dropped")]
    ConnDrop(#[source] Option<io::Error>),
    #[error("websocket protocol error")]
    ProtoWs,
    #[error("mqtt protocol error")]
    ProtoMqtt,
}

/// Failures from `publish`/`publish_pid`/`subscribe`.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("not connected")]
    NotConnected,
    #[error("disconnect in progress")]
    Disconnecting,
    #[error("message does not fit in the send buffer")]
    TooLarge,
    #[error("mqtt codec rejected the request")]
    CodecRejected,
}

/// Top-level error type covering every fallible entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}
