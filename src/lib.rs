//! Single-connection MQTT-over-WebSocket-over-TLS client engine.
//!
//! A caller creates a [`Client`], calls [`Client::connect`] once, then
//! drives the connection by calling [`Client::service`] in a loop (from
//! whatever thread owns the event loop) while `publish`/`publish_pid`/
//! `subscribe` may be called concurrently from other threads. A call to
//! [`Client::disconnect`] ends the session gracefully.

mod client;
mod dns;
mod error;
mod log;
mod mqtt;
mod pal;
mod poll;
mod ringbuf;
mod tls;
mod wakeup;
mod ws;

#[cfg(test)]
mod test_support;

pub use client::{Client, ConnectOptions, MessageCallback, PubAckCallback, ServiceOutcome};
pub use error::{ConnectError, Error, PubSubError, ServiceError};
pub use log::{Level, LogCallback};
pub use mqtt::QoS;
pub use tls::Transport;

#[cfg(any(test, feature = "test-fixtures"))]
pub use tls::FakeTransport;
