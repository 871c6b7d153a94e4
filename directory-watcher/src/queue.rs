//! Completion queue shared by every directory of one watcher.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::handle::ReadBuffer;
use crate::state::WatchState;

/// Work for the dispatch thread.
pub(crate) enum Packet {
    /// Wake-up after a state change requested by another thread.
    Signal(Arc<WatchState>),

    /// A read finished, successfully or not.
    Completion {
        key: Arc<WatchState>,
        result: io::Result<usize>,
        buffer: ReadBuffer,
    },

    /// Ends the dispatch loop.
    Shutdown,
}

/// Sending side of the queue. The dispatch thread owns the receiver.
#[derive(Clone)]
pub(crate) struct CompletionQueue {
    tx: mpsc::UnboundedSender<Packet>,
}

impl CompletionQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Route every read `state` issues to this queue, keyed by `state`.
    pub(crate) fn associate(&self, state: &Arc<WatchState>) -> io::Result<()> {
        let key = Arc::downgrade(state);
        let tx = self.tx.clone();
        state.handle().bind_completion(Arc::new(move |result, buffer| {
            let Some(key) = key.upgrade() else {
                return;
            };
            if tx.send(Packet::Completion { key, result, buffer }).is_err() {
                debug!("Completion queue is closed; dropping a read completion");
            }
        }))
    }

    /// Wake the dispatch thread for `state`. Returns `false` if the thread is
    /// gone.
    pub(crate) fn signal(&self, state: &Arc<WatchState>) -> bool {
        self.tx.send(Packet::Signal(Arc::clone(state))).is_ok()
    }

    /// Ask the dispatch thread to exit.
    pub(crate) fn shutdown(&self) -> bool {
        self.tx.send(Packet::Shutdown).is_ok()
    }
}
