//! Non-blocking mTLS socket: connect, frame-boundary assembly, ping scheduling.
//!
//! One [`Socket`] is a single connection epoch. The buffering and frame assembly here are
//! ours; the handshake and record-layer crypto are `rustls`'s (see the module docs for why
//! that split exists).

use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant as StdInstant};

use flux_timing::Nanos;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::{ClientConfig, ClientConnection};
use rustls_pki_types::ServerName;
use tracing::{debug, warn};

use crate::chain::{ChainFile, TrustAnchors};
use crate::codec::{self, DecodeResult, PacketType};
use crate::error::{ConfigError, ConnectionError};
use crate::identity;
use crate::ids::IdAllocator;

const PORT: u16 = 2408;
/// Default non-blocking read chunk size, overridable via `UplinkConfig::read_chunk_size`.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 512;
const STREAM: Token = Token(0);

static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider_installed() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Liveness probe interval, measured from the last successful read.
pub const PING_INTERVAL: Nanos = Nanos::from_secs(30);
const HANDSHAKE_TIMEOUT: StdDuration = StdDuration::from_secs(10);

struct Live {
    stream: MioTcpStream,
    tls: ClientConnection,
    poll: Poll,
    events: Events,
}

pub struct Socket {
    key_file: PathBuf,
    anchors: TrustAnchors,
    host: String,
    allocator: IdAllocator,
    ping_in_flight: Option<u16>,
    ping_interval: Nanos,
    read_chunk_size: usize,
    last_read: Nanos,
    read_buf: Vec<u8>,
    chain_file: ChainFile,
    live: Option<Live>,
    /// Set only by integration tests, to point `connect()` at an in-process TLS peer on
    /// loopback instead of the environment-derived production hostname.
    connect_override: Option<(String, u16, String)>,
}

impl Socket {
    /// Resolve identity, write the chain file, and initialise buffers. Performs no I/O.
    pub fn new(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        anchors: TrustAnchors,
        ping_interval: Nanos,
        read_chunk_size: usize,
    ) -> Result<Self, ConfigError> {
        let cert_file = cert_file.as_ref();
        let key_file = key_file.as_ref().to_path_buf();

        let device_cert_pem = std::fs::read(cert_file).map_err(|source| ConfigError::Unreadable {
            what: "device certificate",
            path: cert_file.display().to_string(),
            source,
        })?;
        let identity = identity::device_info(&device_cert_pem)?;
        let host = identity::hostname_for_environment(identity.environment).to_string();
        debug!(device_id = %identity.device_id, environment = identity.environment, %host, "resolved device identity");

        let chain_file = ChainFile::write(&device_cert_pem, &anchors).map_err(|source| {
            ConfigError::Unreadable { what: "chain file", path: "<tempfile>".to_string(), source }
        })?;

        Ok(Self {
            key_file,
            anchors,
            host,
            allocator: IdAllocator::new(),
            ping_in_flight: None,
            ping_interval,
            read_chunk_size,
            last_read: Nanos::now(),
            read_buf: Vec::new(),
            chain_file,
            live: None,
            connect_override: None,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Point `connect()` at `host:port`, verifying the peer against `server_name` instead of
    /// the environment-derived production hostname. Exists so the integration tests can drive
    /// this socket against an in-process TLS peer on loopback; production callers never need
    /// it, since the real hostname comes from the device certificate's environment OID.
    #[cfg(feature = "test-support")]
    pub fn set_connect_override(&mut self, host: String, port: u16, server_name: String) {
        self.connect_override = Some((host, port, server_name));
    }

    /// Open the TCP connection, drive the TLS handshake to completion, and register for
    /// readiness polling. Any socket or TLS error is reported as [`ConnectionError`].
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        let (resolve_host, port, server_name) = match &self.connect_override {
            Some((host, port, server_name)) => (host.as_str(), *port, server_name.clone()),
            None => (self.host.as_str(), PORT, self.host.clone()),
        };

        let addr = (resolve_host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConnectionError::Handshake(format!("couldn't resolve {resolve_host}")))?;

        let mut stream = MioTcpStream::connect(addr)?;
        let mut poll = Poll::new()?;
        poll.registry().register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;

        let config = self.build_client_config()?;
        let server_name = ServerName::try_from(server_name)
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        let mut tls = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        drive_handshake(&mut stream, &mut tls, &mut poll)?;
        debug!(host = %self.host, "tls handshake complete");

        self.live = Some(Live { stream, tls, poll, events: Events::with_capacity(4) });
        self.last_read = Nanos::now();
        Ok(())
    }

    fn build_client_config(&self) -> Result<ClientConfig, ConnectionError> {
        ensure_crypto_provider_installed();

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &self.anchors.root_ca_pem[..]) {
            let cert = cert.map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            roots.add(cert).map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        }

        let cert_chain = load_certs(self.chain_file.path())?;
        let key = load_key(&self.key_file)?;

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| ConnectionError::Handshake(e.to_string()))
    }

    /// Queue a frame and attempt one non-blocking flush. Partially written bytes stay
    /// buffered inside `rustls` until the next `try_send`/`recv_frame`.
    pub fn send_frame(
        &mut self,
        tid: u16,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let encoded = codec::encode(tid, packet_type, payload);
        {
            let live = self.live.as_mut().expect("send_frame requires a live connection");
            live.tls.writer().write_all(&encoded)?;
        }
        self.try_send()
    }

    /// Opportunistically drain whatever is queued for write. A would-block is a no-op.
    pub fn try_send(&mut self) -> Result<(), ConnectionError> {
        let live = self.live.as_mut().expect("try_send requires a live connection");
        while live.tls.wants_write() {
            match live.tls.write_tls(&mut live.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Keep the pipe flowing, attempt one non-blocking read, and try to decode one frame.
    pub fn recv_frame(&mut self) -> Result<Option<(u16, PacketType, Vec<u8>)>, ConnectionError> {
        self.try_send()?;

        let live = self.live.as_mut().expect("recv_frame requires a live connection");
        match live.tls.read_tls(&mut live.stream) {
            Ok(0) => return Err(ConnectionError::Closed),
            Ok(_) => {
                let state = live
                    .tls
                    .process_new_packets()
                    .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
                drain_plaintext(live, &mut self.read_buf, state.plaintext_bytes_to_read(), self.read_chunk_size)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        match codec::decode(&self.read_buf) {
            DecodeResult::NeedMore => Ok(None),
            DecodeResult::Frame(frame) => {
                let result = (frame.tid, frame.packet_type, frame.payload.to_vec());
                self.read_buf.drain(..frame.consumed);
                self.last_read = Nanos::now();
                Ok(Some(result))
            }
            DecodeResult::UnknownType { packet_type, consumed } => {
                warn!(packet_type, "dropping frame with unknown packet type");
                self.read_buf.drain(..consumed);
                self.last_read = Nanos::now();
                Ok(None)
            }
            DecodeResult::TooLarge(length) => Err(crate::error::InvalidFrame::TooLarge(length).into()),
        }
    }

    /// Emit a PING if the connection has been quiet for longer than this socket's configured
    /// ping interval and no ping is already outstanding.
    pub fn try_ping(&mut self) -> Result<(), ConnectionError> {
        if self.ping_in_flight.is_some() || self.last_read.elapsed() <= self.ping_interval {
            return Ok(());
        }
        let Ok(tid) = self.allocator.allocate() else {
            warn!("skipping ping: no free transaction ids");
            return Ok(());
        };
        self.send_frame(tid, PacketType::Ping, b"")?;
        self.ping_in_flight = Some(tid);
        Ok(())
    }

    /// Clear the in-flight ping if `tid` matches. Mismatches are ignored rather than
    /// clobbering a still-outstanding ping.
    pub fn got_ping(&mut self, tid: u16) {
        if self.ping_in_flight == Some(tid) {
            self.allocator.free(tid);
            self.ping_in_flight = None;
        }
    }

    pub fn ping_in_flight(&self) -> Option<u16> {
        self.ping_in_flight
    }

    pub fn allocate_tid(&mut self) -> Result<u16, crate::ids::NoFreeIds> {
        self.allocator.allocate()
    }

    pub fn free_tid(&mut self, tid: u16) {
        self.allocator.free(tid)
    }

    /// Block until the socket is readable/writable or `timeout` elapses.
    pub fn wait_readiness(&mut self, timeout: StdDuration) -> Result<bool, ConnectionError> {
        let live = self.live.as_mut().expect("wait_readiness requires a live connection");
        live.poll.poll(&mut live.events, Some(timeout))?;
        Ok(!live.events.is_empty())
    }

    /// Idempotent. Deregisters and drops the stream; the chain file is released when `self`
    /// is dropped.
    pub fn disconnect(&mut self) {
        if let Some(mut live) = self.live.take() {
            let _ = live.poll.registry().deregister(&mut live.stream);
        }
    }
}

fn drain_plaintext(
    live: &mut Live,
    read_buf: &mut Vec<u8>,
    hint: usize,
    read_chunk_size: usize,
) -> Result<(), ConnectionError> {
    let mut chunk = vec![0u8; read_chunk_size];
    let mut remaining = hint.max(1);
    loop {
        let want = remaining.min(read_chunk_size);
        match live.tls.reader().read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => {
                read_buf.extend_from_slice(&chunk[..n]);
                remaining = remaining.saturating_sub(n);
                if remaining == 0 {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn drive_handshake(
    stream: &mut MioTcpStream,
    tls: &mut ClientConnection,
    poll: &mut Poll,
) -> Result<(), ConnectionError> {
    let deadline = StdInstant::now() + HANDSHAKE_TIMEOUT;
    let mut events = Events::with_capacity(4);

    while tls.is_handshaking() {
        let remaining = deadline.saturating_duration_since(StdInstant::now());
        if remaining.is_zero() {
            return Err(ConnectionError::HandshakeTimedOut);
        }
        poll.poll(&mut events, Some(remaining))?;

        if tls.wants_write() {
            match tls.write_tls(stream) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        if tls.wants_read() {
            match tls.read_tls(stream) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(_) => {
                    tls.process_new_packets().map_err(|e| ConnectionError::Handshake(e.to_string()))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<rustls_pki_types::CertificateDer<'static>>, ConnectionError> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::certs(&mut &bytes[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectionError::Handshake(e.to_string()))
}

fn load_key(path: &Path) -> Result<rustls_pki_types::PrivateKeyDer<'static>, ConnectionError> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut &bytes[..])
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?
        .ok_or_else(|| ConnectionError::Handshake(format!("no private key found in {}", path.display())))
}
