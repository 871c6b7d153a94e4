//! Handler callbacks and the object that registers them with a watcher.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::event::ChangeAction;
use crate::watcher::WatcherShared;

/// Callbacks for changes in watched directories.
///
/// Every method has a default that only logs, so implementors override what
/// they care about. Callbacks run on the watcher's dispatch thread or, with
/// [`DeliveryMode::CreatorThread`](crate::DeliveryMode::CreatorThread), on
/// whichever thread drains the [`NotificationPump`](crate::NotificationPump).
///
/// Names travel as UTF-16, so a name that is not valid Unicode reaches the
/// callbacks with U+FFFD in place of the bad bytes and a warning is logged.
/// A rename whose new name is outside the watched directory arrives as
/// [`on_file_removed`](Self::on_file_removed); one whose old name is outside
/// arrives as [`on_file_added`](Self::on_file_added).
pub trait DirectoryChangeHandler: Send + Sync {
    /// A file or directory was created.
    fn on_file_added(&self, path: &Path) {
        info!("File added: {}", path.display());
    }

    /// A file or directory was deleted.
    fn on_file_removed(&self, path: &Path) {
        info!("File removed: {}", path.display());
    }

    /// A file or directory changed.
    fn on_file_modified(&self, path: &Path) {
        info!("File modified: {}", path.display());
    }

    /// A file or directory was renamed.
    fn on_file_name_changed(&self, old_path: &Path, new_path: &Path) {
        info!(
            "File renamed: {} -> {}",
            old_path.display(),
            new_path.display()
        );
    }

    /// Reading changes failed. The directory is no longer watched and no
    /// `on_watch_stopped` follows.
    fn on_read_directory_changes_error(&self, err: &io::Error, directory: &Path) {
        error!(
            "Reading changes for {} failed, directory is no longer watched: {err}",
            directory.display()
        );
    }

    /// Watching `directory` began, or failed to begin when `err` is set.
    fn on_watch_started(&self, err: Option<&io::Error>, directory: &Path) {
        match err {
            None => info!("Watch started: {}", directory.display()),
            Some(err) => info!("Watch failed to start for {}: {err}", directory.display()),
        }
    }

    /// Watching `directory` ended.
    fn on_watch_stopped(&self, directory: &Path) {
        info!("Watch stopped: {}", directory.display());
    }

    /// Last chance to drop a notification. `new_path` is set for renames.
    fn on_filter_notification(
        &self,
        _action: ChangeAction,
        _path: &Path,
        _new_path: Option<&Path>,
    ) -> bool {
        true
    }
}

/// A handler that keeps every default: each notification is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl DirectoryChangeHandler for LoggingHandler {}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Client-owned registration for a set of callbacks.
///
/// One `Handler` may watch any number of directories on one watcher at a
/// time. Passing it to a second watcher first unwatches its directories on
/// the first. Dropping it unwatches every directory it handles.
pub struct Handler {
    core: Arc<HandlerCore>,
}

impl Handler {
    /// Register callbacks.
    pub fn new(callbacks: impl DirectoryChangeHandler + 'static) -> Self {
        Self::from_shared(Arc::new(callbacks))
    }

    /// Register callbacks the caller keeps a reference to.
    pub fn from_shared(callbacks: Arc<dyn DirectoryChangeHandler>) -> Self {
        Self {
            core: Arc::new(HandlerCore {
                id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
                callbacks,
                references: AtomicUsize::new(0),
                link: Mutex::new(EngineLink::default()),
            }),
        }
    }

    /// Number of watched directories holding this handler.
    pub fn ref_count(&self) -> usize {
        self.core.references.load(Ordering::Acquire)
    }

    /// Number of directories the current watcher watches with this handler.
    pub fn engine_ref_count(&self) -> usize {
        self.core.link.lock().count
    }

    /// Whether a watcher currently uses this handler.
    pub fn is_attached(&self) -> bool {
        self.core.link.lock().engine.is_some()
    }

    /// The registered callbacks.
    pub fn callbacks(&self) -> &Arc<dyn DirectoryChangeHandler> {
        &self.core.callbacks
    }

    /// Unwatch every directory this handler handles. Returns `true` if any
    /// directory was unwatched.
    pub fn unwatch_directories(&self) -> bool {
        self.core.unwatch_from_current_engine() > 0
    }

    pub(crate) fn core(&self) -> &Arc<HandlerCore> {
        &self.core
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.core.unwatch_from_current_engine();
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.core.id)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// The watcher a handler is bound to and how many of its directories use it.
#[derive(Default)]
struct EngineLink {
    engine: Option<(u64, Weak<WatcherShared>)>,
    count: usize,
}

/// Shared part of a [`Handler`], held by every directory it watches.
pub(crate) struct HandlerCore {
    id: u64,
    callbacks: Arc<dyn DirectoryChangeHandler>,
    references: AtomicUsize,
    link: Mutex<EngineLink>,
}

impl HandlerCore {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn callbacks(&self) -> &dyn DirectoryChangeHandler {
        self.callbacks.as_ref()
    }

    /// Record that `engine` watches one more directory with this handler.
    /// A handler bound to a different watcher is unwatched there first.
    pub(crate) fn attach(&self, engine: &Arc<WatcherShared>) -> usize {
        let previous = {
            let link = self.link.lock();
            match &link.engine {
                Some((id, weak)) if *id != engine.id() => Some(weak.clone()),
                _ => None,
            }
        };
        if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
            info!(
                "Handler {} moves from watcher {} to watcher {}; unwatching its directories on the old one",
                self.id,
                previous.id(),
                engine.id()
            );
            previous.unwatch_handler(self.id);
        }

        self.references.fetch_add(1, Ordering::AcqRel);
        let mut link = self.link.lock();
        match &link.engine {
            Some((id, _)) if *id == engine.id() => link.count += 1,
            _ => {
                link.engine = Some((engine.id(), Arc::downgrade(engine)));
                link.count = 1;
            }
        }
        link.count
    }

    /// Undo one [`attach`](Self::attach) made by the watcher `engine_id`.
    pub(crate) fn release(&self, engine_id: u64) -> usize {
        let _ = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let mut link = self.link.lock();
        if matches!(&link.engine, Some((id, _)) if *id == engine_id) {
            link.count = link.count.saturating_sub(1);
            if link.count == 0 {
                link.engine = None;
            }
        }
        link.count
    }

    fn unwatch_from_current_engine(&self) -> usize {
        let engine = self
            .link
            .lock()
            .engine
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade());
        engine.map_or(0, |engine| engine.unwatch_handler(self.id))
    }
}
