//! TLS transport: a non-blocking `rustls` session layered directly over a
//! non-blocking `TcpStream`, classifying every read/write into
//! ok/want-read/want-write/fatal the way an OpenSSL-backed transport would
//! via `SSL_get_error`.
//!
//! `rustls` is driven manually here (`read_tls`/`write_tls` +
//! `process_new_packets`) rather than through `tokio-rustls`, since there
//! is no async runtime in this engine.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, RootCertStore};

/// What happened on one `read`/`write` attempt against a [`Transport`].
#[derive(Debug)]
pub enum IoOutcome {
    Progress(usize),
    WantRead,
    WantWrite,
    Fatal(io::Error),
}

/// Abstraction over "a thing with TLS-shaped non-blocking read/write",
/// so the service pump can run against either a real TLS session or
/// [`FakeTransport`] in tests.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome;
    fn write(&mut self, buf: &[u8]) -> IoOutcome;
}

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate chain. Only installed when the `insecure-tls`
/// feature is enabled; every connection using it logs a warning (see
/// `client::connect`).
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds the `rustls::ClientConfig` used for every connection: native
/// root store by default, or an accept-all verifier when `insecure-tls`
/// is both compiled in and requested by the caller at connect time.
pub fn client_config(insecure: bool) -> Arc<ClientConfig> {
    ensure_crypto_provider();

    if insecure {
        #[cfg(feature = "insecure-tls")]
        {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let mut config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(provider)))
                .with_no_client_auth();
            config.enable_sni = true;
            return Arc::new(config);
        }
        #[cfg(not(feature = "insecure-tls"))]
        {
            tracing::warn!("insecure TLS requested but the `insecure-tls` feature is not compiled in; using the native root store");
        }
    }

    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// A non-blocking TLS session over a non-blocking TCP socket.
pub struct TlsTransport {
    socket: TcpStream,
    conn: ClientConnection,
}

impl TlsTransport {
    pub fn new(socket: TcpStream, server_name: ServerName<'static>, config: Arc<ClientConfig>) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self { socket, conn })
    }

    fn pump_io(&mut self) -> Result<(), io::Error> {
        if self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        if let Err(e) = self.pump_io() {
            return IoOutcome::Fatal(e);
        }

        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return IoOutcome::Progress(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // rustls has no more plaintext buffered; try to pull
                    // more ciphertext off the wire.
                    match self.conn.read_tls(&mut self.socket) {
                        Ok(0) => return IoOutcome::Fatal(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
                        Ok(_) => {
                            if let Err(e) = self.conn.process_new_packets() {
                                return IoOutcome::Fatal(io::Error::new(io::ErrorKind::InvalidData, e));
                            }
                            continue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::WantRead,
                        Err(e) => return IoOutcome::Fatal(e),
                    }
                }
                Err(e) => return IoOutcome::Fatal(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return IoOutcome::Fatal(e),
        };
        match self.conn.write_tls(&mut self.socket) {
            Ok(_) => IoOutcome::Progress(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WantWrite,
            Err(e) => IoOutcome::Fatal(e),
        }
    }
}

/// An in-memory `Transport` over two byte queues, for exercising
/// `Client::service`'s pump logic without a real socket or TLS handshake.
///
/// State lives behind a shared `Arc<Mutex<_>>` rather than owned fields:
/// once a `FakeTransport` is boxed into `Client::transport`, a test still
/// needs a handle to feed inbound bytes and inspect what got written, so
/// every clone refers to the same underlying queues.
#[cfg(any(test, feature = "test-fixtures"))]
#[derive(Default)]
struct FakeState {
    inbound: std::collections::VecDeque<u8>,
    outbound: Vec<u8>,
    block_reads: bool,
    block_writes: bool,
    fail_reads: bool,
}

#[cfg(any(test, feature = "test-fixtures"))]
#[derive(Clone, Default)]
pub struct FakeTransport(Arc<std::sync::Mutex<FakeState>>);

#[cfg(any(test, feature = "test-fixtures"))]
impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes for a later `read` to hand back, as if the peer had
    /// sent them.
    pub fn feed(&self, bytes: &[u8]) {
        self.0.lock().unwrap().inbound.extend(bytes);
    }

    /// Drains and returns everything written so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap().outbound)
    }

    pub fn set_block_reads(&self, block: bool) {
        self.0.lock().unwrap().block_reads = block;
    }

    pub fn set_block_writes(&self, block: bool) {
        self.0.lock().unwrap().block_writes = block;
    }

    /// Makes every subsequent `read` report a fatal error, as if the peer
    /// had reset the connection.
    pub fn set_fail_reads(&self, fail: bool) {
        self.0.lock().unwrap().fail_reads = fail;
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
impl Transport for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        let mut state = self.0.lock().unwrap();
        if state.fail_reads {
            return IoOutcome::Fatal(io::Error::new(io::ErrorKind::ConnectionReset, "peer closed"));
        }
        if state.block_reads || state.inbound.is_empty() {
            return IoOutcome::WantRead;
        }
        let n = buf.len().min(state.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.inbound.pop_front().unwrap();
        }
        IoOutcome::Progress(n)
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        let mut state = self.0.lock().unwrap();
        if state.block_writes {
            return IoOutcome::WantWrite;
        }
        state.outbound.extend_from_slice(buf);
        IoOutcome::Progress(buf.len())
    }
}
