//! Per-directory watch state.
//!
//! Every transition except the stop request runs on the dispatch thread:
//!
//! ```text
//! Unset ──start──► Starting ──first read issued──► Normal ◄──► Draining
//!   ▲                  │                              │           │
//!   └──issue failed────┘                       stop requested ◄───┘
//!                                                     ▼
//!                           Stopped ◄── StoppingDrain ◄── Stopping
//! ```
//!
//! A read error while `Normal` goes straight to `Stopped` and reports the
//! error instead of a stop.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::ChangeMask;
use crate::event::{Notification, duplicate_io_error};
use crate::filter::FilterDecorator;
use crate::handle::{DirectoryHandle, ReadBuffer};
use crate::handler::HandlerCore;
use crate::queue::CompletionQueue;
use crate::record::{RecordDecoder, drain_records, link_carried_record};
use crate::watcher::WatcherShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunningState {
    Unset,
    Starting,
    Normal,
    Draining,
    Stopping,
    StoppingDrain,
    Stopped,
}

/// How a watched directory is recognized by later calls.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryKey {
    normalized: PathBuf,
    canonical: Option<PathBuf>,
}

impl DirectoryKey {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            normalized: path.components().collect(),
            canonical: std::fs::canonicalize(path).ok(),
        }
    }

    pub(crate) fn matches(&self, other: &DirectoryKey) -> bool {
        same_path(&self.normalized, &other.normalized)
            || matches!((&self.canonical, &other.canonical), (Some(a), Some(b)) if a == b)
    }
}

#[cfg(windows)]
fn same_path(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

#[cfg(not(windows))]
fn same_path(a: &Path, b: &Path) -> bool {
    a == b
}

struct Props {
    running: RunningState,
    last_error: Option<io::Error>,
    start_error: Option<io::Error>,
    start_finished: bool,
    shut_down: bool,
}

impl Props {
    /// Release a `start_monitor` caller still waiting for the first read.
    fn abort_start(&mut self) {
        if !self.start_finished {
            self.start_finished = true;
            self.start_error.get_or_insert_with(stopped_before_start);
        }
    }
}

fn stopped_before_start() -> io::Error {
    io::Error::new(
        io::ErrorKind::Interrupted,
        "watch was stopped before it started",
    )
}

#[derive(Default)]
struct ReadSlot {
    buffer: Option<ReadBuffer>,
    pending_offset: usize,
}

/// One watched directory.
pub(crate) struct WatchState {
    directory: PathBuf,
    key: DirectoryKey,
    change_mask: ChangeMask,
    watch_subtree: bool,
    handle: DirectoryHandle,
    decorator: Arc<FilterDecorator>,
    props: Mutex<Props>,
    changed: Condvar,
    read: Mutex<ReadSlot>,
}

impl WatchState {
    pub(crate) fn new(
        directory: PathBuf,
        change_mask: ChangeMask,
        watch_subtree: bool,
        handle: DirectoryHandle,
        decorator: Arc<FilterDecorator>,
        buffer_size: usize,
    ) -> Self {
        Self {
            key: DirectoryKey::new(&directory),
            directory,
            change_mask,
            watch_subtree,
            handle,
            decorator,
            props: Mutex::new(Props {
                running: RunningState::Unset,
                last_error: None,
                start_error: None,
                start_finished: false,
                shut_down: false,
            }),
            changed: Condvar::new(),
            read: Mutex::new(ReadSlot {
                buffer: Some(vec![0u8; buffer_size].into_boxed_slice()),
                pending_offset: 0,
            }),
        }
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn key(&self) -> &DirectoryKey {
        &self.key
    }

    pub(crate) fn handle(&self) -> &DirectoryHandle {
        &self.handle
    }

    pub(crate) fn handler(&self) -> &Arc<HandlerCore> {
        self.decorator.handler()
    }

    pub(crate) fn running_state(&self) -> RunningState {
        self.props.lock().running
    }

    /// The last read error, if any.
    pub(crate) fn last_error(&self) -> Option<io::Error> {
        self.props.lock().last_error.as_ref().map(duplicate_io_error)
    }

    /// Issue the first read and report whether it could be issued. Blocks
    /// until the dispatch thread has done so unless called on it.
    pub(crate) fn start_monitor(
        self: &Arc<Self>,
        queue: &CompletionQueue,
        on_dispatch_thread: bool,
    ) -> io::Result<()> {
        {
            let mut props = self.props.lock();
            if props.shut_down {
                return Err(stopped_before_start());
            }
            props.running = RunningState::Starting;
            props.start_finished = false;
            props.start_error = None;
        }
        debug!(
            "Starting to watch {} (mask {:?}, subtree {})",
            self.directory.display(),
            self.change_mask,
            self.watch_subtree
        );

        if on_dispatch_thread {
            self.begin_reading();
        } else if queue.signal(self) {
            let mut props = self.props.lock();
            self.changed.wait_while(&mut props, |props| !props.start_finished);
        } else {
            let mut props = self.props.lock();
            props.running = RunningState::Unset;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "dispatch thread is not running",
            ));
        }

        match self.props.lock().start_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark the watch as stopping and wake the dispatch thread. Returns
    /// whether the caller has to wait for the shutdown signal.
    pub(crate) fn request_stop(self: &Arc<Self>, queue: Option<&CompletionQueue>) -> bool {
        {
            let mut props = self.props.lock();
            let running = props.running;
            match running {
                RunningState::Stopping | RunningState::StoppingDrain => return true,
                RunningState::Unset | RunningState::Stopped => {
                    props.running = RunningState::Stopped;
                    props.shut_down = true;
                    props.abort_start();
                    drop(props);
                    self.changed.notify_all();
                    return false;
                }
                RunningState::Starting | RunningState::Normal | RunningState::Draining => {
                    props.running = RunningState::Stopping;
                }
            }
        }

        if queue.is_some_and(|queue| queue.signal(self)) {
            return true;
        }
        debug!(
            "No dispatch thread for {}; stopping inline",
            self.directory.display()
        );
        self.handle.close();
        self.finish_stop();
        false
    }

    /// Block until the watch has fully stopped.
    pub(crate) fn wait_for_shutdown(&self) {
        let mut props = self.props.lock();
        self.changed.wait_while(&mut props, |props| !props.shut_down);
    }

    /// Dispatch thread entry point for a wake-up or a completed read.
    pub(crate) fn on_wake(
        self: &Arc<Self>,
        completed: Option<(io::Result<usize>, ReadBuffer)>,
        engine: &Weak<WatcherShared>,
    ) {
        let running = self.running_state();
        match (running, completed) {
            (RunningState::Starting, None) => self.begin_reading(),
            (RunningState::Normal, Some((Ok(read_len), buffer))) => {
                self.drain(buffer, read_len, engine)
            }
            (RunningState::Normal, Some((Err(err), buffer))) => {
                self.stash(buffer);
                self.fail(err, engine);
            }
            (RunningState::Stopping, completed) => {
                if let Some((_, buffer)) = completed {
                    self.stash(buffer);
                }
                self.close_for_stop();
            }
            (RunningState::StoppingDrain, Some((_, buffer))) => {
                self.stash(buffer);
                self.finish_stop();
            }
            (running, Some((_, buffer))) => {
                trace!(
                    "Ignoring completion for {} in state {running:?}",
                    self.directory.display()
                );
                self.stash(buffer);
            }
            (_, None) => {}
        }
    }

    fn begin_reading(self: &Arc<Self>) {
        let buffer = self.read.lock().buffer.take();
        let issued = match buffer {
            Some(buffer) => {
                self.read.lock().pending_offset = 0;
                self.handle.read_changes(buffer, 0).map_err(|(err, buffer)| {
                    self.stash(buffer);
                    err
                })
            }
            None => Err(io::Error::other("read buffer is already in use")),
        };

        match issued {
            Ok(()) => {
                {
                    let mut props = self.props.lock();
                    if props.running == RunningState::Starting {
                        props.running = RunningState::Normal;
                    }
                    props.last_error = None;
                }
                debug!("Watching {}", self.directory.display());
                self.decorator.notify(Notification::WatchStarted(None));
            }
            Err(err) => {
                warn!(
                    "Could not start reading changes for {}: {err}",
                    self.directory.display()
                );
                {
                    let mut props = self.props.lock();
                    if props.running == RunningState::Starting {
                        props.running = RunningState::Unset;
                    }
                    props.last_error = Some(duplicate_io_error(&err));
                    props.start_error = Some(duplicate_io_error(&err));
                }
                self.decorator.notify(Notification::WatchStarted(Some(err)));
            }
        }

        self.props.lock().start_finished = true;
        self.changed.notify_all();
    }

    /// Deliver the records of a completed read and issue the next one.
    fn drain(self: &Arc<Self>, mut buffer: ReadBuffer, read_len: usize, engine: &Weak<WatcherShared>) {
        let carried = std::mem::take(&mut self.read.lock().pending_offset);
        {
            let mut props = self.props.lock();
            if props.running == RunningState::Normal {
                props.running = RunningState::Draining;
            }
        }

        let filled = carried.saturating_add(read_len).min(buffer.len());
        link_carried_record(&mut buffer, carried, read_len);
        let carry = drain_records(&mut buffer, filled, carried > 0, &self.directory, |change| {
            if self.running_state() == RunningState::Stopping {
                return ControlFlow::Break(());
            }
            self.decorator.notify(change.into());
            ControlFlow::Continue(())
        });

        let resume = {
            let mut props = self.props.lock();
            if props.running == RunningState::Draining {
                props.running = RunningState::Normal;
                true
            } else {
                false
            }
        };
        self.read.lock().pending_offset = carry;
        if !resume {
            trace!(
                "Stop requested while draining {}; not issuing another read",
                self.directory.display()
            );
            self.stash(buffer);
            self.close_for_stop();
            return;
        }

        if let Err((err, buffer)) = self.handle.read_changes(buffer, carry) {
            self.stash(buffer);
            self.fail(err, engine);
        }
    }

    fn close_for_stop(self: &Arc<Self>) {
        if self.handle.close() {
            let mut props = self.props.lock();
            if props.running == RunningState::Stopping {
                props.running = RunningState::StoppingDrain;
            }
        } else {
            self.finish_stop();
        }
    }

    fn finish_stop(self: &Arc<Self>) {
        self.props.lock().running = RunningState::Stopped;
        debug!("Stopped watching {}", self.directory.display());
        self.flush_carried();
        self.decorator.notify(Notification::WatchStopped);

        {
            let mut props = self.props.lock();
            props.shut_down = true;
            props.abort_start();
        }
        self.changed.notify_all();
    }

    /// Deliver a rename half still waiting at the front of the buffer as a
    /// removal.
    fn flush_carried(self: &Arc<Self>) {
        let mut read = self.read.lock();
        let carried = std::mem::take(&mut read.pending_offset);
        let record = match &read.buffer {
            Some(buffer) if carried > 0 => {
                RecordDecoder::new(&buffer[..carried.min(buffer.len())]).record(&self.directory)
            }
            _ => None,
        };
        drop(read);
        if let Some(record) = record {
            debug!(
                "Rename of {} never completed; reporting a removal",
                record.absolute_path.display()
            );
            self.decorator
                .notify(Notification::FileRemoved(record.absolute_path));
        }
    }

    /// Runtime error: forget the watch and report the error instead of a stop.
    fn fail(self: &Arc<Self>, err: io::Error, engine: &Weak<WatcherShared>) {
        warn!(
            "Reading changes for {} failed, unwatching: {err}",
            self.directory.display()
        );
        self.handle.close();
        if let Some(engine) = engine.upgrade() {
            engine.forget_failed(self);
        }
        self.flush_carried();
        {
            let mut props = self.props.lock();
            props.running = RunningState::Stopped;
            props.last_error = Some(duplicate_io_error(&err));
            props.shut_down = true;
            props.abort_start();
        }
        self.changed.notify_all();
        self.decorator.notify(Notification::ReadError(err));
    }

    fn stash(&self, buffer: ReadBuffer) {
        self.read.lock().buffer = Some(buffer);
    }
}
