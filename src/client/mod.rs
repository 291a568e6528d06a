//! Client lifecycle: the `Client` struct plus `new`,
//! `publish`/`publish_pid`/`subscribe`, and `Drop`. The connect, service,
//! and disconnect drivers live in their own submodules but operate
//! directly on `Client`'s fields, matching the source's
//! `mqtt_wss_connect`/`mqtt_wss_service`/`mqtt_wss_disconnect` acting on one
//! `struct mqtt_wss_client`.

mod connect;
mod disconnect;
mod service;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::PubSubError;
use crate::log::{log_warn, Level, LogCallback, LogSink};
use crate::mqtt::{packet::QOS_MASK, MqttCodec};
use crate::tls::Transport;
use crate::wakeup::Wakeup;
use crate::ws::WsCodec;

pub use connect::ConnectOptions;
pub use service::ServiceOutcome;

/// Default MQTT/WS buffer capacity, matching the source's
/// `MQTT_BUFFER_SIZE` (`1024 * 1024 * 3`).
pub const DEFAULT_BUF_CAPACITY: usize = 3 * 1024 * 1024;
/// Keep-alive used when the caller passes 0, matching the source's
/// fallback in `mqtt_wss_connect`.
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 400;

pub type MessageCallback = Box<dyn FnMut(&str, &[u8], u8) + Send>;
pub type PubAckCallback = Box<dyn FnMut(u16) + Send>;

/// Codec state shared between the service loop and producer threads
/// (`publish`/`publish_pid`/`subscribe`/`disconnect`), guarded by one
/// mutex per DESIGN.md's resolution of the first design note.
pub(crate) struct Codecs {
    pub mqtt: MqttCodec,
    pub ws: WsCodec,
    pub mqtt_connected: bool,
    pub disconnecting: bool,
    pub didnt_finish_write: bool,
}

pub struct Client {
    host: Arc<str>,
    port: u16,
    /// Raw fd of the currently-open socket, kept alongside `transport`
    /// (which owns the `TcpStream`) purely so `service`/`disconnect` can
    /// hand it to `poll` without borrowing through the `Transport` trait
    /// object. `None` when no connection is open.
    socket_fd: Option<std::os::unix::io::RawFd>,
    transport: Option<Box<dyn Transport + Send>>,
    wakeup: Wakeup,
    pub(crate) codecs: Mutex<Codecs>,
    log_sink: Mutex<LogSink>,
    on_message: Mutex<MessageCallback>,
    on_puback: Mutex<PubAckCallback>,
    last_send: Mutex<Instant>,
    keep_alive: Mutex<Duration>,
}

impl Client {
    pub fn new(
        log_prefix: impl Into<String>,
        log_callback: LogCallback,
        on_message: MessageCallback,
        on_puback: PubAckCallback,
    ) -> io::Result<Self> {
        let wakeup = Wakeup::new()?;
        Ok(Self {
            host: Arc::from(""),
            port: 0,
            socket_fd: None,
            transport: None,
            wakeup,
            codecs: Mutex::new(Codecs {
                mqtt: MqttCodec::new(DEFAULT_BUF_CAPACITY),
                ws: WsCodec::new(DEFAULT_BUF_CAPACITY, 0x5EED),
                mqtt_connected: false,
                disconnecting: false,
                didnt_finish_write: false,
            }),
            log_sink: Mutex::new(LogSink::new(log_prefix, log_callback)),
            on_message: Mutex::new(on_message),
            on_puback: Mutex::new(on_puback),
            last_send: Mutex::new(Instant::now()),
            keep_alive: Mutex::new(Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS as u64)),
        })
    }

    pub fn connect(&mut self, host: &str, port: u16, options: &ConnectOptions) -> Result<(), crate::error::ConnectError> {
        connect::run(self, host, port, options)
    }

    pub fn service(&mut self, timeout: Option<Duration>) -> Result<ServiceOutcome, crate::error::ServiceError> {
        service::pump(self, timeout)
    }

    pub fn disconnect(&mut self, total_timeout: Duration) {
        disconnect::run(self, total_timeout)
    }

    /// Encodes and enqueues a PUBLISH, returning its assigned packet id
    /// (0 for QoS 0). Mirrors `mqtt_wss_publish_pid`.
    pub fn publish_pid(&mut self, topic: &str, payload: &[u8], flags: u8) -> Result<u16, PubSubError> {
        let mut codecs = self.codecs.lock().unwrap();
        if !codecs.mqtt_connected {
            return Err(PubSubError::NotConnected);
        }
        let pid = codecs
            .mqtt
            .publish_pid(topic, payload, flags)
            .map_err(|_| PubSubError::TooLarge)?;
        drop(codecs);
        self.wakeup.wakeup();
        Ok(pid)
    }

    /// Same as [`Self::publish_pid`] but reports only success/failure,
    /// matching the source's `mqtt_wss_publish`. Unlike `publish_pid`, this
    /// also refuses once a graceful disconnect is underway.
    pub fn publish(&mut self, topic: &str, payload: &[u8], flags: u8) -> Result<(), PubSubError> {
        if self.codecs.lock().unwrap().disconnecting {
            return Err(PubSubError::Disconnecting);
        }
        self.publish_pid(topic, payload, flags).map(|_| ())
    }

    pub fn subscribe(&mut self, topic: &str, max_qos: u8) -> Result<u16, PubSubError> {
        let mut codecs = self.codecs.lock().unwrap();
        if !codecs.mqtt_connected || codecs.disconnecting {
            return Err(PubSubError::NotConnected);
        }
        let pid = codecs
            .mqtt
            .subscribe(topic, max_qos & QOS_MASK)
            .map_err(|_| PubSubError::CodecRejected)?;
        drop(codecs);
        self.wakeup.wakeup();
        Ok(pid)
    }

    pub fn is_connected(&self) -> bool {
        self.codecs.lock().unwrap().mqtt_connected
    }

    pub(crate) fn log(&self, level: Level, args: std::fmt::Arguments<'_>) {
        self.log_sink.lock().unwrap().log(level, args);
    }
}

impl Drop for Client {
    /// Releases fields in the source's documented order: WS codec before
    /// the host string. With `host` now an
    /// `Arc<str>` (DESIGN.md, Open Question 2) this ordering is
    /// documentation fidelity, not a correctness requirement.
    fn drop(&mut self) {
        log_warn!(self.log_sink.lock().unwrap(), "client dropped (host={})", self.host);
    }
}
