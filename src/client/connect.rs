//! Connect driver: resolve, open a TCP socket, kick off the TLS handshake,
//! send CONNECT, then block in the service loop until CONNACK arrives (or
//! the connection drops first).

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;

use crate::client::{Client, DEFAULT_KEEP_ALIVE_SECS};
use crate::dns;
use crate::error::ConnectError;
use crate::log::Level;
use crate::mqtt::ConnectParams;
use crate::tls::{self, TlsTransport};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters for [`Client::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will_topic: Option<String>,
    pub will_msg: Option<Vec<u8>>,
    pub will_flags: u8,
    pub keep_alive_secs: u16,
    /// Opt into the accept-all certificate verifier. Only takes effect
    /// when compiled with the `insecure-tls` feature.
    pub insecure_tls: bool,
}

pub(crate) fn run(client: &mut Client, host: &str, port: u16, options: &ConnectOptions) -> Result<(), ConnectError> {
    // Step 1: reset state + WS codec. The MQTT codec is reset too (see
    // DESIGN.md, Open Question 3).
    {
        let mut codecs = client.codecs.lock().unwrap();
        codecs.ws.reset();
        codecs.mqtt.reset();
        codecs.mqtt_connected = false;
        codecs.disconnecting = false;
        codecs.didnt_finish_write = false;
    }

    // Step 2: copy host.
    client.host = Arc::from(host);
    client.port = port;

    // Step 3: resolve.
    let addr = dns::resolve(host)?;

    // Step 4: close old socket, open + connect + TCP_NODELAY (warn, not
    // fail, on error) + non-blocking.
    client.transport = None;
    client.socket_fd = None;

    let sockaddr = SocketAddr::new(addr, port);
    let tcp = TcpStream::connect_timeout(&sockaddr, TCP_CONNECT_TIMEOUT).map_err(ConnectError::TcpConnect)?;
    if let Err(e) = tcp.set_nodelay(true) {
        client.log(Level::Warn, format_args!("failed to set TCP_NODELAY: {}", e));
    }
    client.socket_fd = Some(tcp.as_raw_fd());

    // Step 5: open a non-blocking TLS session over the socket. The WS HTTP
    // Upgrade handshake and the MQTT CONNACK wait both happen inside the
    // `service` calls below, not here — `service` kicks the WS handshake
    // off itself the first time it sees an established `socket_fd` with an
    // unestablished WS codec.
    let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
        ConnectError::TlsHandshake(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })?;
    let config = tls::client_config(options.insecure_tls);
    if options.insecure_tls {
        client.log(Level::Warn, format_args!("connecting with TLS certificate verification disabled"));
    }
    let transport = TlsTransport::new(tcp, server_name, config).map_err(ConnectError::TlsHandshake)?;
    client.transport = Some(Box::new(transport));

    // Step 6: build CONNECT flags from will_flags, encode CONNECT.
    let keep_alive_secs = if options.keep_alive_secs == 0 {
        DEFAULT_KEEP_ALIVE_SECS
    } else {
        options.keep_alive_secs
    };
    *client.keep_alive.lock().unwrap() = Duration::from_secs(keep_alive_secs as u64);
    *client.last_send.lock().unwrap() = std::time::Instant::now();

    let params = ConnectParams {
        client_id: &options.client_id,
        username: options.username.as_deref(),
        password: options.password.as_deref(),
        will_topic: options.will_topic.as_deref(),
        will_msg: options.will_msg.as_deref(),
        will_flags: options.will_flags,
        keep_alive_secs,
    };
    {
        let mut codecs = client.codecs.lock().unwrap();
        codecs.mqtt.connect(&params).map_err(|_| ConnectError::MqttEncode)?;
    }

    client.log(Level::Debug, format_args!("connecting to {}:{}", host, port));

    // Step 7: block in the service loop until CONNACK or a hard failure.
    loop {
        if client.is_connected() {
            return Ok(());
        }
        client.service(None).map_err(ConnectError::Rejected)?;
        if client.is_connected() {
            return Ok(());
        }
    }
}
