//! Server-initiated work items delivered to the embedding application.

use crossbeam_channel::Sender;

use crate::engine::Submission;

/// An ORDER frame handed to the application callback.
///
/// `data` is the decoded JSON payload. `acknowledge` tells the server the order was received;
/// it's silently dropped if the connection that carried the order has since been replaced by a
/// reconnect, since the tid it refers to no longer means anything to the new epoch.
pub struct Order {
    pub data: serde_json::Value,
    tid: u16,
    epoch: u64,
    submissions: Sender<Submission>,
}

impl Order {
    pub(crate) fn new(data: serde_json::Value, tid: u16, epoch: u64, submissions: Sender<Submission>) -> Self {
        Self { data, tid, epoch, submissions }
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }

    /// Send ORDER_CONFIRM for this order. A no-op if the worker has already moved past the
    /// epoch this order arrived on, or has terminated.
    pub fn acknowledge(self) {
        let _ = self.submissions.try_send(Submission::AckOrder { tid: self.tid, epoch: self.epoch });
    }
}

impl std::fmt::Debug for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Order").field("tid", &self.tid).field("data", &self.data).finish()
    }
}
