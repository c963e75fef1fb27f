//! The worker thread: connects, drains submissions, dispatches inbound frames, reconnects.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use crossbeam_channel::{Receiver, Sender};
use flux_timing::Nanos;
use tracing::{debug, info, warn};

use crate::chain::TrustAnchors;
use crate::codec::PacketType;
use crate::completion::Completion;
use crate::error::{ConnectionError, UplinkError};
use crate::order::Order;
use crate::socket::Socket;
use crate::transaction::{Handle, Outcome, TransactionTable};

const READINESS_CEILING: StdDuration = StdDuration::from_secs(5);

/// Work posted to the engine from other threads.
pub enum Submission {
    SyncPathpoints { payload: Vec<u8>, handle: Completion<()> },
    SyncBaobs { payload: Vec<u8>, handle: Completion<serde_json::Value> },
    StreamLogs { payload: Vec<u8> },
    AckOrder { tid: u16, epoch: u64 },
}

pub struct EngineConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub anchors: TrustAnchors,
    pub on_new_order: Box<dyn Fn(Order) + Send + 'static>,
    pub ping_interval: Nanos,
    pub reconnect_backoff: StdDuration,
    pub read_chunk_size: usize,
    /// Set only by integration tests; see [`crate::socket::Socket::set_connect_override`].
    #[cfg(feature = "test-support")]
    pub connect_override: Option<(String, u16, String)>,
}

/// Runs until `terminate` is observed. Owns the socket, transaction table, and allocator for
/// its whole life; nothing outside this function touches protocol state.
pub fn run(
    config: EngineConfig,
    submissions: Receiver<Submission>,
    submissions_tx: Sender<Submission>,
    terminate: Arc<AtomicBool>,
) {
    let mut table = TransactionTable::new();
    let epoch = Arc::new(AtomicU64::new(0));

    'epochs: loop {
        if terminate.load(Ordering::Relaxed) {
            break;
        }

        let mut socket = match Socket::new(
            &config.cert_file,
            &config.key_file,
            config.anchors.clone(),
            config.ping_interval,
            config.read_chunk_size,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "couldn't construct socket, terminating worker");
                break;
            }
        };
        #[cfg(feature = "test-support")]
        if let Some((host, port, server_name)) = config.connect_override.clone() {
            socket.set_connect_override(host, port, server_name);
        }

        // Prepare: connect until success or termination, backing off between attempts.
        loop {
            if terminate.load(Ordering::Relaxed) {
                break 'epochs;
            }
            match socket.connect() {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, host = socket.host(), "connection attempt failed, retrying");
                    std::thread::sleep(config.reconnect_backoff);
                }
            }
        }

        epoch.fetch_add(1, Ordering::SeqCst);
        table.rebind_all(&mut socket);
        info!(host = socket.host(), epoch = epoch.load(Ordering::SeqCst), "connected");

        let reconnect = run_epoch(&mut socket, &mut table, &submissions, &submissions_tx, &terminate, &epoch, &config);
        socket.disconnect();

        if !reconnect {
            break;
        }
    }

    table.abandon_all();
}

/// One connection epoch's worth of loop iterations. Returns `true` if the caller should
/// reconnect, `false` if the worker is terminating.
fn run_epoch(
    socket: &mut Socket,
    table: &mut TransactionTable,
    submissions: &Receiver<Submission>,
    submissions_tx: &Sender<Submission>,
    terminate: &Arc<AtomicBool>,
    epoch: &Arc<AtomicU64>,
    config: &EngineConfig,
) -> bool {
    let current_epoch = epoch.load(Ordering::SeqCst);

    loop {
        if terminate.load(Ordering::Relaxed) {
            return false;
        }

        while let Ok(submission) = submissions.try_recv() {
            if let Err(e) = handle_submission(socket, table, current_epoch, submission) {
                warn!(error = %e, "submission failed, reconnecting");
                return true;
            }
        }

        if let Err(e) = socket.try_ping() {
            warn!(error = %e, "ping failed, reconnecting");
            return true;
        }

        match socket.wait_readiness(READINESS_CEILING) {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "readiness wait failed, reconnecting");
                return true;
            }
        }

        match socket.recv_frame() {
            Ok(None) => continue,
            Ok(Some((tid, packet_type, payload))) => {
                if let Err(e) = dispatch(socket, table, submissions_tx, current_epoch, config, tid, packet_type, payload) {
                    warn!(error = %e, "dispatch failed, reconnecting");
                    return true;
                }
            }
            Err(e) => {
                debug!(error = %e, "recv failed, reconnecting");
                return true;
            }
        }
    }
}

fn handle_submission(
    socket: &mut Socket,
    table: &mut TransactionTable,
    current_epoch: u64,
    submission: Submission,
) -> Result<(), ConnectionError> {
    match submission {
        Submission::SyncPathpoints { payload, handle } => {
            // `register`'s only failure mode is allocator exhaustion; the handle is already
            // settled with `UplinkError::NoFreeIds` by the time it returns, so surfacing this
            // as transport back-pressure just drives the usual reconnect path.
            if table.register(socket, PacketType::DataStream, payload, Handle::Ack(handle)).is_err() {
                return Err(ConnectionError::BackPressure);
            }
        }
        Submission::SyncBaobs { payload, handle } => {
            if table.register(socket, PacketType::SyncBaobRequest, payload, Handle::Baob(handle)).is_err() {
                return Err(ConnectionError::BackPressure);
            }
        }
        Submission::StreamLogs { payload } => {
            TransactionTable::send_untracked(socket, PacketType::Logs, &payload)?;
        }
        Submission::AckOrder { tid, epoch } => {
            if epoch == current_epoch {
                socket.send_frame(tid, PacketType::OrderConfirm, b"{}")?;
            } else {
                debug!(tid, "dropping order ack from a stale epoch");
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    socket: &mut Socket,
    table: &mut TransactionTable,
    submissions_tx: &Sender<Submission>,
    current_epoch: u64,
    config: &EngineConfig,
    tid: u16,
    packet_type: PacketType,
    payload: Vec<u8>,
) -> Result<(), ConnectionError> {
    match packet_type {
        PacketType::Ping => {
            if socket.ping_in_flight().is_some() {
                socket.got_ping(tid);
            } else {
                socket.send_frame(tid, PacketType::Ping, b"")?;
            }
        }
        PacketType::Order => {
            let data: serde_json::Value = serde_json::from_slice(&payload).map_err(|e| {
                ConnectionError::Handshake(format!("malformed ORDER payload: {e}"))
            })?;
            let order = Order::new(data, tid, current_epoch, submissions_tx.clone());
            (config.on_new_order)(order);
        }
        PacketType::OrderConfirm => {
            debug!("ignoring inbound ORDER_CONFIRM");
        }
        PacketType::DataStreamConfirm => {
            table.complete(socket, tid, Outcome::Ack);
        }
        PacketType::DataStreamReject => {
            table.complete(socket, tid, Outcome::Rejected);
        }
        PacketType::SyncBaobResponse => match serde_json::from_slice(&payload) {
            Ok(value) => table.complete(socket, tid, Outcome::Baob(value)),
            Err(e) => warn!(error = %e, "malformed SYNC_BAOB_RESPONSE payload, dropping"),
        },
        PacketType::Logs => {
            debug!("dropping unexpected inbound LOGS frame");
        }
        PacketType::DataStream | PacketType::SyncBaobRequest => {
            debug!(?packet_type, "ignoring outbound-only packet type received inbound");
        }
    }
    Ok(())
}

/// Surfaced to callers so they can map transport failures registering a submission.
impl From<crate::ids::NoFreeIds> for UplinkError {
    fn from(_: crate::ids::NoFreeIds) -> Self {
        UplinkError::NoFreeIds
    }
}
