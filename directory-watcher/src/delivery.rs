//! Delivery of notifications on the thread that created the watcher.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::event::Notification;
use crate::filter::FilterDecorator;

/// A notification waiting for the pump, with the decorator that will filter
/// and deliver it.
pub(crate) struct PostedNotification {
    pub(crate) target: Arc<FilterDecorator>,
    pub(crate) notification: Notification,
}

impl PostedNotification {
    fn deliver(self) {
        self.target.dispatch(self.notification);
    }
}

pub(crate) type PumpSender = mpsc::UnboundedSender<PostedNotification>;

/// Receives notifications posted by a watcher configured with
/// [`DeliveryMode::CreatorThread`](crate::DeliveryMode::CreatorThread) and
/// runs the handler callbacks on the calling thread.
///
/// Filters, including the handler's own filter hook, are evaluated here and
/// not on the dispatch thread.
pub struct NotificationPump {
    rx: mpsc::UnboundedReceiver<PostedNotification>,
}

impl NotificationPump {
    pub(crate) fn channel() -> (PumpSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Deliver everything already queued without blocking. Returns how many
    /// notifications were processed.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(posted) = self.rx.try_recv() {
            posted.deliver();
            count += 1;
        }
        count
    }

    /// Block until one notification arrives and deliver it. Returns `false`
    /// once the watcher is gone and the queue is empty.
    ///
    /// Must not be called from async code; use
    /// [`dispatch_next`](Self::dispatch_next) there.
    pub fn dispatch_blocking(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(posted) => {
                posted.deliver();
                true
            }
            None => false,
        }
    }

    /// Wait for one notification and deliver it. Returns `false` once the
    /// watcher is gone and the queue is empty.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(posted) => {
                posted.deliver();
                true
            }
            None => false,
        }
    }

    /// Number of notifications waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl std::fmt::Debug for NotificationPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPump")
            .field("pending", &self.len())
            .finish()
    }
}
