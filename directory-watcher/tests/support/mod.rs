//! Shared helpers for the watcher integration tests.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dwatch_directory_watcher::{DirectoryChangeHandler, Handler};
use parking_lot::Mutex;

/// How long to wait for the platform to report a change.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// One callback as seen by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Added(PathBuf),
    Removed(PathBuf),
    Modified(PathBuf),
    Renamed(PathBuf, PathBuf),
    ReadError(PathBuf),
    Started(PathBuf),
    StartFailed(PathBuf),
    Stopped(PathBuf),
}

/// Records every callback and the thread it ran on.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    threads: Mutex<Vec<ThreadId>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler registering this recorder.
    pub fn handler(self: &Arc<Self>) -> Handler {
        Handler::from_shared(Arc::clone(self) as Arc<dyn DirectoryChangeHandler>)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn count(&self, wanted: &Seen) -> usize {
        self.seen.lock().iter().filter(|seen| *seen == wanted).count()
    }

    pub fn contains(&self, wanted: &Seen) -> bool {
        self.count(wanted) > 0
    }

    /// Whether any callback mentioned a path ending in `name`.
    pub fn mentions(&self, name: &str) -> bool {
        self.seen.lock().iter().any(|seen| match seen {
            Seen::Added(p) | Seen::Removed(p) | Seen::Modified(p) => p.ends_with(name),
            Seen::Renamed(a, b) => a.ends_with(name) || b.ends_with(name),
            _ => false,
        })
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    pub fn record(&self, seen: Seen) {
        self.threads.lock().push(thread::current().id());
        self.seen.lock().push(seen);
    }
}

impl DirectoryChangeHandler for Recorder {
    fn on_file_added(&self, path: &Path) {
        self.record(Seen::Added(path.to_path_buf()));
    }

    fn on_file_removed(&self, path: &Path) {
        self.record(Seen::Removed(path.to_path_buf()));
    }

    fn on_file_modified(&self, path: &Path) {
        self.record(Seen::Modified(path.to_path_buf()));
    }

    fn on_file_name_changed(&self, old_path: &Path, new_path: &Path) {
        self.record(Seen::Renamed(old_path.to_path_buf(), new_path.to_path_buf()));
    }

    fn on_read_directory_changes_error(&self, _err: &io::Error, directory: &Path) {
        self.record(Seen::ReadError(directory.to_path_buf()));
    }

    fn on_watch_started(&self, err: Option<&io::Error>, directory: &Path) {
        match err {
            None => self.record(Seen::Started(directory.to_path_buf())),
            Some(_) => self.record(Seen::StartFailed(directory.to_path_buf())),
        }
    }

    fn on_watch_stopped(&self, directory: &Path) {
        self.record(Seen::Stopped(directory.to_path_buf()));
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
