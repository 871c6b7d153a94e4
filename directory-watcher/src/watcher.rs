//! The directory change watcher and its dispatch thread.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ChangeMask, DeliveryMode, FilterFlags, WatchOptions, WatcherConfig};
use crate::delivery::{NotificationPump, PumpSender};
use crate::error::{Result, WatcherError};
use crate::filter::{Delivery, FilterDecorator, FilterSpec};
use crate::handle::DirectoryHandle;
use crate::handler::Handler;
use crate::privilege::MonitorPrivileges;
use crate::queue::{CompletionQueue, Packet};
use crate::state::{DirectoryKey, WatchState};

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Watches directories and reports their changes to [`Handler`]s.
///
/// All directories share one completion queue and one dispatch thread,
/// created by the first successful watch and torn down by
/// [`unwatch_all_directories`](Self::unwatch_all_directories). Dropping the
/// watcher unwatches everything.
pub struct DirectoryChangeWatcher {
    shared: Arc<WatcherShared>,
}

impl DirectoryChangeWatcher {
    /// Create a watcher. `privileges` comes from [`MonitorPrivileges::ensure`].
    pub fn new(config: WatcherConfig, privileges: MonitorPrivileges) -> Result<Self> {
        config.validate()?;
        let (pump_tx, pump) = match config.delivery {
            DeliveryMode::DispatchThread => (None, None),
            DeliveryMode::CreatorThread => {
                let (tx, pump) = NotificationPump::channel();
                (Some(tx), Some(pump))
            }
        };
        let shared = Arc::new(WatcherShared {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            filter_flags: Mutex::new(config.filter_flags.normalized()),
            config,
            watches: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
            pump_tx,
            pump: Mutex::new(pump),
        });
        debug!(
            "Created directory change watcher {} ({:?})",
            shared.id, privileges
        );
        Ok(Self { shared })
    }

    /// Watch `directory`, replacing any existing watch on it.
    ///
    /// Returns once the first read has been issued. Caller errors are
    /// reported before any resource is touched; every later failure is
    /// unwound before returning.
    pub fn watch_directory(
        &self,
        directory: impl AsRef<Path>,
        change_mask: ChangeMask,
        handler: &Handler,
        options: WatchOptions,
    ) -> Result<()> {
        self.shared
            .watch_directory(directory.as_ref(), change_mask, handler, options)
    }

    /// Stop watching `directory`. Returns `false` if it was not watched.
    pub fn unwatch_directory(&self, directory: impl AsRef<Path>) -> bool {
        self.shared.unwatch_directory(directory.as_ref())
    }

    /// Stop watching everything and shut the dispatch thread down.
    pub fn unwatch_all_directories(&self) -> bool {
        self.shared.unwatch_all_directories()
    }

    /// Whether `directory` is currently watched.
    pub fn is_watching_directory(&self, directory: impl AsRef<Path>) -> bool {
        self.shared.is_watching_directory(directory.as_ref())
    }

    /// Number of watched directories.
    pub fn num_watched_directories(&self) -> usize {
        self.shared.num_watched_directories()
    }

    /// Set the filter flags used by later `watch_directory` calls without
    /// an override. Returns the previous flags.
    pub fn set_filter_flags(&self, flags: FilterFlags) -> FilterFlags {
        let mut current = self.shared.filter_flags.lock();
        std::mem::replace(&mut *current, flags.normalized())
    }

    /// The filter flags used when a watch has no override.
    pub fn filter_flags(&self) -> FilterFlags {
        self.shared.filter_flags()
    }

    /// The pump to drain on the creating thread. Only available once, and
    /// only with [`DeliveryMode::CreatorThread`].
    pub fn take_notification_pump(&self) -> Option<NotificationPump> {
        self.shared.pump.lock().take()
    }

    /// A weak handle usable from inside callbacks.
    pub fn handle(&self) -> WatcherRef {
        WatcherRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.shared.config
    }
}

impl Drop for DirectoryChangeWatcher {
    fn drop(&mut self) {
        if !self.shared.unwatch_all_directories() {
            warn!(
                "Directory change watcher {} dropped without a clean shutdown",
                self.shared.id
            );
        }
    }
}

impl fmt::Debug for DirectoryChangeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryChangeWatcher")
            .field("id", &self.shared.id)
            .field("watched", &self.num_watched_directories())
            .finish()
    }
}

/// Weak reference to a [`DirectoryChangeWatcher`].
///
/// Handlers can keep one to unwatch directories from inside their callbacks;
/// doing so on the dispatch thread does not block.
#[derive(Clone, Debug)]
pub struct WatcherRef {
    shared: Weak<WatcherShared>,
}

impl WatcherRef {
    /// Whether the watcher still exists.
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn unwatch_directory(&self, directory: impl AsRef<Path>) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.unwatch_directory(directory.as_ref()))
    }

    pub fn unwatch_all_directories(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.unwatch_all_directories())
    }

    pub fn is_watching_directory(&self, directory: impl AsRef<Path>) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_watching_directory(directory.as_ref()))
    }

    pub fn num_watched_directories(&self) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.num_watched_directories())
    }
}

struct Dispatcher {
    queue: CompletionQueue,
    thread: JoinHandle<()>,
}

/// State shared by a watcher, its weak handles and the handlers bound to it.
pub(crate) struct WatcherShared {
    id: u64,
    config: WatcherConfig,
    filter_flags: Mutex<FilterFlags>,
    watches: Mutex<Vec<Option<Arc<WatchState>>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    pump_tx: Option<PumpSender>,
    pump: Mutex<Option<NotificationPump>>,
}

impl fmt::Debug for WatcherShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherShared").field("id", &self.id).finish()
    }
}

impl WatcherShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn filter_flags(&self) -> FilterFlags {
        *self.filter_flags.lock()
    }

    fn watch_directory(
        self: &Arc<Self>,
        directory: &Path,
        change_mask: ChangeMask,
        handler: &Handler,
        options: WatchOptions,
    ) -> Result<()> {
        if directory.as_os_str().is_empty() {
            return Err(WatcherError::InvalidParameter(
                "directory path is empty".to_string(),
            ));
        }
        if change_mask.is_empty() {
            return Err(WatcherError::InvalidParameter(
                "change mask is empty".to_string(),
            ));
        }
        if !directory.is_dir() {
            return Err(WatcherError::NotADirectory(directory.to_path_buf()));
        }
        let filter = FilterSpec::new(&options.include_filter, &options.exclude_filter)?;
        let flags = options
            .filter_flags
            .unwrap_or_else(|| self.filter_flags())
            .normalized();

        if self.unwatch_directory(directory) {
            info!("Replacing existing watch on {}", directory.display());
        }

        let handle = DirectoryHandle::open(directory, change_mask, options.watch_subtree)?;
        let delivery = match &self.pump_tx {
            Some(tx) => Delivery::Posted(tx.clone()),
            None => Delivery::Inline,
        };
        let decorator = Arc::new(FilterDecorator::new(
            Arc::clone(handler.core()),
            directory.to_path_buf(),
            filter,
            flags,
            delivery,
        ));
        let state = Arc::new(WatchState::new(
            directory.to_path_buf(),
            change_mask,
            options.watch_subtree,
            handle,
            decorator,
            self.config.aligned_buffer_size(),
        ));

        let queue = self.ensure_dispatcher()?;
        queue.associate(&state)?;

        handler.core().attach(self);
        self.insert(Arc::clone(&state));

        if let Err(err) = state.start_monitor(&queue, self.on_dispatch_thread()) {
            if self.remove(&state) {
                state.handler().release(self.id);
            }
            state.handle().close();
            return Err(WatcherError::Io(err));
        }

        info!(
            "Watching directory: {} ({} watched)",
            directory.display(),
            self.num_watched_directories()
        );
        Ok(())
    }

    fn unwatch_directory(&self, directory: &Path) -> bool {
        let key = DirectoryKey::new(directory);
        let state = {
            let mut watches = self.watches.lock();
            watches
                .iter_mut()
                .find(|slot| matches!(slot, Some(s) if s.key().matches(&key)))
                .and_then(Option::take)
        };
        let Some(state) = state else {
            return false;
        };

        if self.begin_stop(&state) && !self.on_dispatch_thread() {
            state.wait_for_shutdown();
        }
        info!("Unwatched directory: {}", state.directory().display());
        true
    }

    /// Unwatch every directory handled by the handler `handler_id`.
    pub(crate) fn unwatch_handler(&self, handler_id: u64) -> usize {
        let states: Vec<Arc<WatchState>> = {
            let mut watches = self.watches.lock();
            watches
                .iter_mut()
                .filter(|slot| matches!(slot, Some(s) if s.handler().id() == handler_id))
                .filter_map(Option::take)
                .collect()
        };
        self.stop_all(&states);
        for state in &states {
            info!("Unwatched directory: {}", state.directory().display());
        }
        states.len()
    }

    fn unwatch_all_directories(&self) -> bool {
        let states: Vec<Arc<WatchState>> = {
            let mut watches = self.watches.lock();
            watches.drain(..).flatten().collect()
        };
        self.stop_all(&states);
        if !states.is_empty() {
            info!("Unwatched {} directories", states.len());
        }

        if self.on_dispatch_thread() {
            warn!("unwatch_all_directories called on the dispatch thread; it keeps running");
            return false;
        }
        let Some(dispatcher) = self.dispatcher.lock().take() else {
            return true;
        };
        dispatcher.queue.shutdown();
        match dispatcher.thread.join() {
            Ok(()) => {
                debug!("Dispatch thread for watcher {} joined", self.id);
                true
            }
            Err(_) => {
                error!("Dispatch thread for watcher {} panicked", self.id);
                false
            }
        }
    }

    fn is_watching_directory(&self, directory: &Path) -> bool {
        let key = DirectoryKey::new(directory);
        self.watches
            .lock()
            .iter()
            .flatten()
            .any(|state| state.key().matches(&key))
    }

    fn num_watched_directories(&self) -> usize {
        self.watches.lock().iter().flatten().count()
    }

    /// Drop a watch whose read failed. The state has already stopped itself.
    pub(crate) fn forget_failed(&self, state: &Arc<WatchState>) {
        if self.remove(state) {
            state.handler().release(self.id);
            info!(
                "Unwatched directory after a read error: {}",
                state.directory().display()
            );
        }
    }

    /// Release handlers, request every stop, then wait for all of them.
    fn stop_all(&self, states: &[Arc<WatchState>]) {
        let mut must_wait = false;
        for state in states {
            must_wait |= self.begin_stop(state);
        }
        if must_wait && !self.on_dispatch_thread() {
            for state in states {
                state.wait_for_shutdown();
            }
        }
    }

    fn begin_stop(&self, state: &Arc<WatchState>) -> bool {
        state.handler().release(self.id);
        if let Some(err) = state.last_error() {
            debug!(
                "Stopping {} after earlier error: {err}",
                state.directory().display()
            );
        }
        let queue = self.dispatcher.lock().as_ref().map(|d| d.queue.clone());
        state.request_stop(queue.as_ref())
    }

    fn insert(&self, state: Arc<WatchState>) {
        let mut watches = self.watches.lock();
        match watches.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(state),
            None => watches.push(Some(state)),
        }
    }

    fn remove(&self, state: &Arc<WatchState>) -> bool {
        let mut watches = self.watches.lock();
        watches
            .iter_mut()
            .find(|slot| matches!(slot, Some(s) if Arc::ptr_eq(s, state)))
            .and_then(Option::take)
            .is_some()
    }

    fn on_dispatch_thread(&self) -> bool {
        let current = thread::current().id();
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|d| d.thread.thread().id() == current)
    }

    fn ensure_dispatcher(self: &Arc<Self>) -> Result<CompletionQueue> {
        let mut dispatcher = self.dispatcher.lock();
        if let Some(dispatcher) = dispatcher.as_ref() {
            return Ok(dispatcher.queue.clone());
        }

        let (queue, rx) = CompletionQueue::new();
        let engine = Arc::downgrade(self);
        let thread = thread::Builder::new()
            .name(format!("dwatch-dispatch-{}", self.id))
            .spawn(move || run_dispatch_loop(rx, engine))
            .map_err(WatcherError::ThreadSpawn)?;
        debug!("Started dispatch thread for watcher {}", self.id);

        *dispatcher = Some(Dispatcher {
            queue: queue.clone(),
            thread,
        });
        Ok(queue)
    }
}

fn run_dispatch_loop(mut rx: mpsc::UnboundedReceiver<Packet>, engine: Weak<WatcherShared>) {
    while let Some(packet) = rx.blocking_recv() {
        let (state, completed) = match packet {
            Packet::Shutdown => break,
            Packet::Signal(state) => (state, None),
            Packet::Completion { key, result, buffer } => (key, Some((result, buffer))),
        };
        let woke = catch_unwind(AssertUnwindSafe(|| state.on_wake(completed, &engine)));
        if woke.is_err() {
            error!(
                "A handler panicked while processing changes for {}",
                state.directory().display()
            );
        }
    }
    debug!("Dispatch thread exiting");
}
