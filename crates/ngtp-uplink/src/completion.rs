use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

use crate::error::UplinkError;

/// The writer half of a one-shot, settle-once sink. Held by the engine's transaction table
/// until the matching reply (or a terminal transport event) settles it exactly once.
pub struct Completion<T> {
    tx: Sender<Result<T, UplinkError>>,
}

/// The reader half, returned to whichever caller submitted the operation.
pub struct Awaiting<T> {
    rx: Receiver<Result<T, UplinkError>>,
}

/// Construct a fresh one-shot pair.
pub fn pair<T>() -> (Completion<T>, Awaiting<T>) {
    let (tx, rx) = bounded(1);
    (Completion { tx }, Awaiting { rx })
}

impl<T> Completion<T> {
    /// Settle the sink. A second call (the sink is one-shot) is a logic error in the caller —
    /// the transaction table guarantees it never happens by removing the entry before
    /// settling.
    pub fn settle(self, outcome: Result<T, UplinkError>) {
        let _ = self.tx.send(outcome);
    }
}

impl<T> Awaiting<T> {
    /// Block until the operation completes.
    pub fn wait(self) -> Result<T, UplinkError> {
        self.rx.recv().unwrap_or(Err(UplinkError::Abandoned))
    }

    /// Poll without blocking.
    pub fn try_wait(&self) -> Option<Result<T, UplinkError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(UplinkError::Abandoned)),
        }
    }
}
