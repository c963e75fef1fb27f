//! Shared fixtures for the integration tests: a device cert chain carrying the NGTP identity
//! OIDs, and a scripted in-process TLS peer standing in for the control plane.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, KeyPair};
use rustls::server::{ServerConfig, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// `1.3.6.1.4.1.55338.0.0` — DeviceID, mirrored from the crate's identity module since
/// integration tests only see the crate's public surface.
const DEVICE_ID_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 55338, 0, 0];
/// `1.3.6.1.4.1.55338.0.1` — Environment.
const ENVIRONMENT_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 55338, 0, 1];

static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider_installed() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn der_utf8_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(0x0c); // UTF8String tag
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    out
}

fn der_u8_integer(v: u8) -> Vec<u8> {
    vec![0x02, 0x01, v] // INTEGER tag, length 1
}

/// A device cert chain plus the server-side material needed to terminate TLS for it.
pub struct TestIdentity {
    pub device_cert_pem: Vec<u8>,
    pub device_key_pem: Vec<u8>,
    pub dev_ca_pem: Vec<u8>,
    pub root_ca_pem: Vec<u8>,
    pub server_cert_chain: Vec<CertificateDer<'static>>,
    pub server_key: PrivateKeyDer<'static>,
}

/// Build a fresh (root CA -> device CA -> device cert) chain carrying `environment` and
/// `device_id` in the NGTP custom OIDs, plus a server leaf cert for `server_name` signed by the
/// same root — so a client trusting `root_ca_pem` can verify the test peer.
pub fn build_identity(environment: u8, device_id: &str, server_name: &str) -> TestIdentity {
    ensure_crypto_provider_installed();

    let root_key = KeyPair::generate().expect("generate root key");
    let mut root_params = CertificateParams::new(Vec::<String>::new()).expect("root params");
    root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    root_params.distinguished_name.push(DnType::CommonName, "ngtp-test-root");
    let root_cert = root_params.self_signed(&root_key).expect("self-sign root");

    let dev_ca_key = KeyPair::generate().expect("generate dev-ca key");
    let mut dev_ca_params = CertificateParams::new(Vec::<String>::new()).expect("dev-ca params");
    dev_ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    dev_ca_params.distinguished_name.push(DnType::CommonName, "ngtp-test-device-ca");
    let dev_ca_cert = dev_ca_params.signed_by(&dev_ca_key, &root_cert, &root_key).expect("sign dev-ca");

    let device_key = KeyPair::generate().expect("generate device key");
    let mut device_params = CertificateParams::new(Vec::<String>::new()).expect("device params");
    device_params.distinguished_name.push(DnType::CommonName, device_id);
    device_params.custom_extensions = vec![
        CustomExtension::from_oid_content(DEVICE_ID_OID, der_utf8_string(device_id)),
        CustomExtension::from_oid_content(ENVIRONMENT_OID, der_u8_integer(environment)),
    ];
    let device_cert = device_params.signed_by(&device_key, &dev_ca_cert, &dev_ca_key).expect("sign device cert");

    let server_key = KeyPair::generate().expect("generate server key");
    let mut server_params = CertificateParams::new(vec![server_name.to_string()]).expect("server params");
    server_params.distinguished_name.push(DnType::CommonName, server_name);
    let server_cert = server_params.signed_by(&server_key, &root_cert, &root_key).expect("sign server cert");

    TestIdentity {
        device_cert_pem: device_cert.pem().into_bytes(),
        device_key_pem: device_key.serialize_pem().into_bytes(),
        dev_ca_pem: dev_ca_cert.pem().into_bytes(),
        root_ca_pem: root_cert.pem().into_bytes(),
        server_cert_chain: vec![server_cert.der().clone()],
        server_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
    }
}

/// A TCP listener plus the TLS server config needed to accept mTLS connections from a device
/// cert chain rooted at `identity.root_ca_pem`.
pub struct TestPeer {
    pub listener: TcpListener,
    pub addr: std::net::SocketAddr,
    server_config: Arc<ServerConfig>,
}

pub fn start_peer(identity: &TestIdentity) -> TestPeer {
    ensure_crypto_provider_installed();

    let mut client_roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &identity.root_ca_pem[..]) {
        client_roots.add(cert.expect("parse root ca")).expect("add root ca");
    }
    let client_verifier =
        WebPkiClientVerifier::builder(Arc::new(client_roots)).build().expect("build client verifier");

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(identity.server_cert_chain.clone(), identity.server_key.clone_key())
        .expect("build server config");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    TestPeer { listener, addr, server_config: Arc::new(server_config) }
}

/// One accepted, handshaken mTLS connection. Blocking: each operation waits for the
/// counterpart's side of the exchange, which is fine for a single dedicated test thread driving
/// a deliberately scripted scenario.
pub struct PeerConnection {
    stream: TcpStream,
    tls: ServerConnection,
}

impl TestPeer {
    /// Accept the next inbound connection and drive the TLS handshake to completion.
    pub fn accept(&self) -> PeerConnection {
        let (stream, _) = self.listener.accept().expect("accept connection");
        stream.set_nodelay(true).expect("set nodelay");
        let mut tls = ServerConnection::new(self.server_config.clone()).expect("new server connection");
        let mut stream = stream;
        while tls.is_handshaking() {
            if tls.wants_write() {
                tls.write_tls(&mut stream).expect("write handshake bytes");
            }
            if tls.wants_read() {
                let n = tls.read_tls(&mut stream).expect("read handshake bytes");
                assert!(n > 0, "peer closed during handshake");
                tls.process_new_packets().expect("process handshake packets");
            }
        }
        PeerConnection { stream, tls }
    }
}

impl PeerConnection {
    /// Read the next complete NGTP frame off the wire, blocking until it arrives.
    pub fn read_frame(&mut self) -> (u16, u16, Vec<u8>) {
        let mut buf = Vec::new();
        loop {
            if let Some(frame) = try_take_frame(&mut buf) {
                return frame;
            }
            let n = self.tls.read_tls(&mut self.stream).expect("read tls bytes");
            assert!(n > 0, "peer closed mid-frame");
            self.tls.process_new_packets().expect("process packets");
            let mut chunk = [0u8; 4096];
            loop {
                match self.tls.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("plaintext read failed: {e}"),
                }
            }
        }
    }

    /// Write one NGTP frame.
    pub fn write_frame(&mut self, tid: u16, packet_type: u16, payload: &[u8]) {
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&tid.to_be_bytes());
        buf.extend_from_slice(&packet_type.to_be_bytes());
        buf.extend_from_slice(payload);
        self.tls.writer().write_all(&buf).expect("queue frame");
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.stream).expect("flush frame");
        }
    }

    /// Close the connection abruptly, simulating a dropped link (the client observes a
    /// zero-byte read and treats it as `ConnectionFailed`).
    pub fn kill(self) {
        drop(self.stream);
    }
}

fn try_take_frame(buf: &mut Vec<u8>) -> Option<(u16, u16, Vec<u8>)> {
    if buf.len() < 8 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 8 + len {
        return None;
    }
    let tid = u16::from_be_bytes([buf[4], buf[5]]);
    let packet_type = u16::from_be_bytes([buf[6], buf[7]]);
    let payload = buf[8..8 + len].to_vec();
    buf.drain(..8 + len);
    Some((tid, packet_type, payload))
}

pub mod packet_type {
    pub const PING: u16 = 0;
    pub const ORDER: u16 = 1;
    pub const ORDER_CONFIRM: u16 = 2;
    #[allow(dead_code)]
    pub const LOGS: u16 = 3;
    pub const DATA_STREAM: u16 = 4;
    pub const DATA_STREAM_CONFIRM: u16 = 5;
    pub const DATA_STREAM_REJECT: u16 = 6;
}
