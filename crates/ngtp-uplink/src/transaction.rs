use std::collections::HashMap;

use tracing::debug;

use crate::codec::PacketType;
use crate::completion::Completion;
use crate::error::UplinkError;
use crate::socket::Socket;

/// The two shapes of reply a pending operation can resolve to.
pub enum Handle {
    /// Resolved by DATA_STREAM_CONFIRM / DATA_STREAM_REJECT.
    Ack(Completion<()>),
    /// Resolved by SYNC_BAOB_RESPONSE.
    Baob(Completion<serde_json::Value>),
}

impl Handle {
    fn settle_err(self, err: UplinkError) {
        match self {
            Handle::Ack(c) => c.settle(Err(err)),
            Handle::Baob(c) => c.settle(Err(err)),
        }
    }

    fn settle_abandoned(self) {
        self.settle_err(UplinkError::Abandoned)
    }
}

struct PendingEntry {
    tid: u16,
    packet_type: PacketType,
    payload: Vec<u8>,
}

/// `pending_list` paired with a `tid -> handle` index. Every tid present in `handles` has
/// exactly one entry in `pending`, and vice versa — see the crate-level invariants.
#[derive(Default)]
pub struct TransactionTable {
    pending: Vec<PendingEntry>,
    handles: HashMap<u16, Handle>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a tid on `socket`, record the operation, and write its frame. Survives
    /// reconnects via [`rebind_all`](Self::rebind_all).
    pub fn register(
        &mut self,
        socket: &mut Socket,
        packet_type: PacketType,
        payload: Vec<u8>,
        handle: Handle,
    ) -> Result<u16, UplinkError> {
        let tid = match socket.allocate_tid() {
            Ok(tid) => tid,
            Err(_) => {
                handle.settle_err(UplinkError::NoFreeIds);
                return Err(UplinkError::NoFreeIds);
            }
        };
        if let Err(e) = socket.send_frame(tid, packet_type, &payload) {
            socket.free_tid(tid);
            debug!(?e, "send failed during registration, will replay on reconnect anyway");
        }
        self.pending.push(PendingEntry { tid, packet_type, payload });
        self.handles.insert(tid, handle);
        Ok(tid)
    }

    /// Fire-and-forget send: not placed in the pending list, no completion, tid is not
    /// allocator-tracked (the wire tid is fixed at 0).
    pub fn send_untracked(
        socket: &mut Socket,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), crate::error::ConnectionError> {
        socket.send_frame(0, packet_type, payload)
    }

    /// Remove the entry for `tid` from both structures in the same step and settle its
    /// handle. A no-op (not an error) if `tid` is unknown — e.g. a duplicate confirm after a
    /// replay.
    pub fn complete(&mut self, socket: &mut Socket, tid: u16, outcome: Outcome) {
        let Some(index) = self.pending.iter().position(|e| e.tid == tid) else {
            debug!(tid, "completion for unknown tid, dropping");
            return;
        };
        let entry = self.pending.swap_remove(index);
        socket.free_tid(entry.tid);
        let Some(handle) = self.handles.remove(&tid) else {
            return;
        };
        match (handle, outcome) {
            (Handle::Ack(c), Outcome::Ack) => c.settle(Ok(())),
            (Handle::Ack(c), Outcome::Rejected) => c.settle(Err(UplinkError::SyncFailed)),
            (Handle::Baob(c), Outcome::Baob(value)) => c.settle(Ok(value)),
            // Mismatched handle/outcome shapes can't happen through the dispatch table, but
            // if they ever did, abandon rather than silently drop.
            (Handle::Baob(c), _) => c.settle(Err(UplinkError::Abandoned)),
            (Handle::Ack(c), Outcome::Baob(_)) => c.settle(Err(UplinkError::Abandoned)),
        }
    }

    /// Re-allocate a tid for every pending entry on `new_socket`, resend its frame, and
    /// rebuild the tid index. Order is preserved; no handle is resolved or dropped.
    pub fn rebind_all(&mut self, new_socket: &mut Socket) {
        let mut rebuilt = HashMap::with_capacity(self.handles.len());
        for entry in &mut self.pending {
            let old_tid = entry.tid;
            let Ok(new_tid) = new_socket.allocate_tid() else {
                debug!(tid = old_tid, "couldn't reallocate tid during replay, will retry next reconnect");
                if let Some(handle) = self.handles.remove(&old_tid) {
                    rebuilt.insert(old_tid, handle);
                }
                continue;
            };
            if let Err(e) = new_socket.send_frame(new_tid, entry.packet_type, &entry.payload) {
                debug!(?e, tid = new_tid, "replay send failed, will retry next reconnect");
            }
            if let Some(handle) = self.handles.remove(&old_tid) {
                rebuilt.insert(new_tid, handle);
            }
            entry.tid = new_tid;
        }
        self.handles = rebuilt;
    }

    /// Settle every outstanding handle with a transport-abandoned error. Called once on
    /// worker termination.
    pub fn abandon_all(&mut self) {
        self.pending.clear();
        for (_, handle) in self.handles.drain() {
            handle.settle_abandoned();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The settlement a dispatched inbound frame carries for a given tid.
pub enum Outcome {
    Ack,
    Rejected,
    Baob(serde_json::Value),
}
