//! Persistent mTLS uplink client multiplexing the NGTP framing protocol.
//!
//! A single worker thread owns one TLS connection at a time, frames NGTP packets over it,
//! tracks outstanding request/response transactions by tid, and replays in-flight operations
//! across reconnects. Everything outside that worker thread talks to it through
//! [`UplinkClient`], a cheap cloneable handle.
//!
//! Start with [`UplinkConfig`]: supply the device cert/key paths and trust anchors, register
//! an [`Order`] callback, then [`UplinkConfig::spawn`].

mod chain;
mod codec;
mod completion;
mod engine;
mod error;
mod identity;
mod ids;
mod order;
mod socket;
mod transaction;

pub use chain::TrustAnchors;
pub use codec::PacketType;
pub use completion::Awaiting;
pub use error::{ConfigError, ConnectionError, IdentityError, InvalidFrame, UplinkError};
pub use identity::{DeviceIdentity, hostname_for_environment};
pub use ids::{IdAllocator, NoFreeIds};
pub use order::Order;
pub use socket::{DEFAULT_READ_CHUNK_SIZE, PING_INTERVAL};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use crossbeam_channel::{Sender, bounded};
use flux_timing::Nanos;

use crate::completion::pair;
use crate::engine::{EngineConfig, Submission};
use crate::socket::Socket;

const SUBMISSION_QUEUE_DEPTH: usize = 256;
const DEFAULT_RECONNECT_BACKOFF: StdDuration = StdDuration::from_secs(2);

/// Builder for an [`UplinkClient`]. Cert/key paths and trust anchors are required up front;
/// the order callback, ping interval, reconnect backoff, and read chunk size are set through
/// builder methods before [`spawn`](UplinkConfig::spawn) — the last three default to the
/// values this crate's design calls out.
pub struct UplinkConfig {
    cert_file: PathBuf,
    key_file: PathBuf,
    anchors: TrustAnchors,
    on_new_order: Option<Box<dyn Fn(Order) + Send + 'static>>,
    ping_interval: Nanos,
    reconnect_backoff: StdDuration,
    read_chunk_size: usize,
    #[cfg(feature = "test-support")]
    connect_override: Option<(String, u16, String)>,
}

impl UplinkConfig {
    pub fn new(
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        anchors: TrustAnchors,
    ) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            anchors,
            on_new_order: None,
            ping_interval: PING_INTERVAL,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            #[cfg(feature = "test-support")]
            connect_override: None,
        }
    }

    /// Callback invoked on the worker thread for every inbound ORDER, serially. Required:
    /// [`spawn`](Self::spawn) fails with [`ConfigError::MissingOrderCallback`] if this is
    /// never set.
    pub fn on_new_order(mut self, callback: impl Fn(Order) + Send + 'static) -> Self {
        self.on_new_order = Some(Box::new(callback));
        self
    }

    /// Liveness probe interval, measured from the last successful read. Defaults to
    /// [`PING_INTERVAL`] (30s).
    pub fn ping_interval(mut self, interval: Nanos) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Delay between failed connection attempts during the prepare loop. Defaults to 2s.
    pub fn reconnect_backoff(mut self, backoff: StdDuration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Size of the non-blocking read chunk the socket layer pulls from the TLS stream per
    /// attempt. Defaults to [`DEFAULT_READ_CHUNK_SIZE`].
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Test-only: point every connection attempt at `host:port`, verifying the peer against
    /// `server_name` instead of the environment-derived production hostname. Lets the
    /// integration tests drive the worker against an in-process TLS peer on loopback.
    #[cfg(feature = "test-support")]
    pub fn connect_override(
        mut self,
        host: impl Into<String>,
        port: u16,
        server_name: impl Into<String>,
    ) -> Self {
        self.connect_override = Some((host.into(), port, server_name.into()));
        self
    }

    /// Validate the configuration, spawn the worker thread, and return a handle to it.
    ///
    /// Fails fast, before any thread is spawned, if the cert/key pair can't be read or doesn't
    /// carry a valid device identity, or if no order callback was configured. Once the worker
    /// is running, transport failures are swallowed and retried per the reconnect policy
    /// instead of propagating — see the crate's error handling notes.
    pub fn spawn(self) -> Result<UplinkClient, ConfigError> {
        let on_new_order = self.on_new_order.ok_or(ConfigError::MissingOrderCallback)?;

        // Construct (and immediately drop) a socket up front so builder misuse — an unreadable
        // cert/key file, a certificate missing the identity extensions — is reported to the
        // caller here rather than retried silently forever inside the worker thread.
        Socket::new(
            &self.cert_file,
            &self.key_file,
            self.anchors.clone(),
            self.ping_interval,
            self.read_chunk_size,
        )?;

        let (submissions_tx, submissions_rx) = bounded(SUBMISSION_QUEUE_DEPTH);
        let terminate = Arc::new(AtomicBool::new(false));

        let engine_config = EngineConfig {
            cert_file: self.cert_file,
            key_file: self.key_file,
            anchors: self.anchors,
            on_new_order,
            ping_interval: self.ping_interval,
            reconnect_backoff: self.reconnect_backoff,
            read_chunk_size: self.read_chunk_size,
            #[cfg(feature = "test-support")]
            connect_override: self.connect_override,
        };

        let worker_terminate = Arc::clone(&terminate);
        let worker_submissions_tx = submissions_tx.clone();
        let worker = std::thread::Builder::new()
            .name("ngtp-uplink".to_string())
            .spawn(move || engine::run(engine_config, submissions_rx, worker_submissions_tx, worker_terminate))
            .expect("couldn't spawn the uplink worker thread");

        Ok(UplinkClient {
            inner: Arc::new(ClientInner { submissions: submissions_tx, terminate, worker: Mutex::new(Some(worker)) }),
        })
    }
}

struct ClientInner {
    submissions: Sender<Submission>,
    terminate: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A cheap, cloneable, thread-safe front door onto a running uplink worker.
///
/// Cloning shares the same submission channel, terminate flag, and join handle — dropping one
/// clone doesn't stop the worker, only [`stop`](Self::stop) does.
#[derive(Clone)]
pub struct UplinkClient {
    inner: Arc<ClientInner>,
}

impl UplinkClient {
    /// Submit pathpoints for sync. Resolves `Ok(())` on `DATA_STREAM_CONFIRM`, `Err(SyncFailed)`
    /// on `DATA_STREAM_REJECT`. Registered in the pending list: the operation is replayed with
    /// a fresh tid on every reconnect until it's acknowledged or the client is stopped.
    pub fn sync_pathpoints(&self, pathpoints: &serde_json::Value) -> Awaiting<()> {
        let payload = serde_json::to_vec(pathpoints).expect("Value serialization cannot fail");
        let (completion, awaiting) = pair();
        let _ = self.inner.submissions.send(Submission::SyncPathpoints { payload, handle: completion });
        awaiting
    }

    /// Request a BAOB sync against `local_versions` (a map of blob name to local version).
    /// Resolves `Ok(value)` with `{"download": [...], "upload": [...]}` fields on
    /// `SYNC_BAOB_RESPONSE`.
    pub fn sync_baobs(&self, local_versions: &serde_json::Value) -> Awaiting<serde_json::Value> {
        let payload = serde_json::to_vec(local_versions).expect("Value serialization cannot fail");
        let (completion, awaiting) = pair();
        let _ = self.inner.submissions.send(Submission::SyncBaobs { payload, handle: completion });
        awaiting
    }

    /// Fire-and-forget log upload. Sent with tid=0, never placed in the pending list — a loss
    /// across a reconnect is never reported back to the caller.
    pub fn stream_logs(&self, logs: &serde_json::Value) {
        let payload = serde_json::to_vec(logs).expect("Value serialization cannot fail");
        let _ = self.inner.submissions.send(Submission::StreamLogs { payload });
    }

    /// Request termination. If `wait` is true, blocks until the worker thread exits. Safe to
    /// call from any clone or more than once; only the first caller that observes a live
    /// handle actually joins the thread.
    pub fn stop(&self, wait: bool) {
        self.inner.terminate.store(true, Ordering::Relaxed);
        if wait {
            let handle = self.inner.worker.lock().expect("worker mutex poisoned").take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}
