//! Directory handles backed by the platform watcher.
//!
//! A [`DirectoryHandle`] turns `notify` callbacks into overlapped-style
//! reads: the owner hands a buffer in with [`DirectoryHandle::read_changes`],
//! and once change records are available they are encoded into the buffer
//! and the read completes through the bound completion routine. Records that
//! arrive while no read is outstanding wait in a bounded backlog.
//!
//! The old name of a rename is held back until its new name arrives, so the
//! two halves always sit next to each other in the backlog. An old name with
//! no partner within [`RENAME_PAIR_TIMEOUT`] left the directory and becomes a
//! removal.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use notify::event::{CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ChangeMask;
use crate::event::ChangeAction;
use crate::record::{RecordWriter, record_len};

/// Buffer a read fills with change records.
pub(crate) type ReadBuffer = Box<[u8]>;

/// Called once per completed read with its result and the buffer.
pub(crate) type CompletionRoutine = Arc<dyn Fn(io::Result<usize>, ReadBuffer) + Send + Sync>;

/// Records kept while no read is outstanding.
const MAX_PENDING_RECORDS: usize = 16 * 1024;

/// How long the old name of a rename waits for its new name.
pub(crate) const RENAME_PAIR_TIMEOUT: Duration = Duration::from_millis(100);

const METADATA_CHANGES: ChangeMask = ChangeMask::ATTRIBUTES
    .union(ChangeMask::LAST_WRITE)
    .union(ChangeMask::LAST_ACCESS)
    .union(ChangeMask::CREATION)
    .union(ChangeMask::SECURITY);

const ANY_MODIFICATION: ChangeMask = METADATA_CHANGES.union(ChangeMask::SIZE);

/// An open directory delivering change records.
pub(crate) struct DirectoryHandle {
    watcher: Mutex<Option<RecommendedWatcher>>,
    port: Arc<ReadPort>,
}

impl DirectoryHandle {
    /// Start receiving changes for `directory`.
    pub(crate) fn open(directory: &Path, mask: ChangeMask, subtree: bool) -> notify::Result<Self> {
        let canonical_root =
            std::fs::canonicalize(directory).unwrap_or_else(|_| directory.to_path_buf());
        let port = ReadPort::new(WatchScope {
            root: directory.to_path_buf(),
            canonical_root,
            mask,
            subtree,
        });

        let callback_port = Arc::clone(&port);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| callback_port.on_event(res),
            notify::Config::default(),
        )?;
        let mode = if subtree {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(directory, mode)?;
        debug!("Opened {} for change notifications", directory.display());

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            port,
        })
    }

    /// Route completed reads to `routine`.
    pub(crate) fn bind_completion(&self, routine: CompletionRoutine) -> io::Result<()> {
        self.port.bind_completion(routine)
    }

    /// Issue an asynchronous read into `buffer[offset..]`. On failure the
    /// buffer is handed back.
    pub(crate) fn read_changes(
        &self,
        buffer: ReadBuffer,
        offset: usize,
    ) -> Result<(), (io::Error, ReadBuffer)> {
        self.port.read_changes(buffer, offset)
    }

    /// Stop watching. An outstanding read completes with an aborted error;
    /// returns whether there was one.
    pub(crate) fn close(&self) -> bool {
        if let Some(watcher) = self.watcher.lock().take() {
            drop(watcher);
            debug!("Closed {}", self.port.scope.root.display());
        }
        self.port.close()
    }
}

/// What a handle reports and where names are relative to.
#[derive(Debug, Clone)]
struct WatchScope {
    root: PathBuf,
    canonical_root: PathBuf,
    mask: ChangeMask,
    subtree: bool,
}

/// Whether a name change passes the mask.
#[derive(Debug, Clone, Copy)]
enum Gate {
    /// Creation, deletion or rename; `Some(true)` when known to be a directory.
    Name(Option<bool>),
    /// Any of these change kinds.
    Changes(ChangeMask),
}

impl WatchScope {
    /// Translate one backend event into change records. An error means the
    /// watched directory itself went away.
    fn records_for(&self, event: &Event) -> io::Result<Vec<PendingRecord>> {
        let (action, gate) = match event.kind {
            EventKind::Create(CreateKind::Folder) => (ChangeAction::Added, Gate::Name(Some(true))),
            EventKind::Create(CreateKind::File) => (ChangeAction::Added, Gate::Name(Some(false))),
            EventKind::Create(_) => (ChangeAction::Added, Gate::Name(None)),
            EventKind::Remove(RemoveKind::Folder) => {
                (ChangeAction::Removed, Gate::Name(Some(true)))
            }
            EventKind::Remove(RemoveKind::File) => (ChangeAction::Removed, Gate::Name(Some(false))),
            EventKind::Remove(_) => (ChangeAction::Removed, Gate::Name(None)),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                (ChangeAction::RenamedFrom, Gate::Name(None))
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                (ChangeAction::RenamedTo, Gate::Name(None))
            }
            // Both halves were already reported on their own.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Ok(Vec::new()),
            EventKind::Modify(ModifyKind::Name(_)) => {
                let exists = event.paths.first().is_some_and(|path| path.exists());
                let action = if exists {
                    ChangeAction::Added
                } else {
                    ChangeAction::Removed
                };
                (action, Gate::Name(None))
            }
            EventKind::Modify(ModifyKind::Data(DataChange::Size)) => {
                (ChangeAction::Modified, Gate::Changes(ChangeMask::SIZE))
            }
            EventKind::Modify(ModifyKind::Data(_)) => (
                ChangeAction::Modified,
                Gate::Changes(ChangeMask::LAST_WRITE | ChangeMask::SIZE),
            ),
            EventKind::Modify(ModifyKind::Metadata(kind)) => {
                let mask = match kind {
                    MetadataKind::AccessTime => ChangeMask::LAST_ACCESS,
                    MetadataKind::WriteTime => ChangeMask::LAST_WRITE,
                    MetadataKind::Permissions => ChangeMask::ATTRIBUTES | ChangeMask::SECURITY,
                    MetadataKind::Ownership => ChangeMask::SECURITY,
                    MetadataKind::Extended => ChangeMask::ATTRIBUTES,
                    _ => METADATA_CHANGES,
                };
                (ChangeAction::Modified, Gate::Changes(mask))
            }
            EventKind::Modify(_) => (ChangeAction::Modified, Gate::Changes(ANY_MODIFICATION)),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {
                if event.need_rescan() {
                    warn!(
                        "Change events for {} were lost by the platform watcher",
                        self.root.display()
                    );
                }
                return Ok(Vec::new());
            }
        };

        let mut records = Vec::with_capacity(event.paths.len());
        for path in &event.paths {
            let Some(relative) = self.relative(path) else {
                trace!("Ignoring change outside {}: {}", self.root.display(), path.display());
                continue;
            };
            if relative.as_os_str().is_empty() {
                if matches!(action, ChangeAction::Removed | ChangeAction::RenamedFrom) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("watched directory {} was removed", self.root.display()),
                    ));
                }
                continue;
            }
            if !self.subtree && relative.components().count() > 1 {
                continue;
            }
            if self.passes(action, gate, path) {
                records.push(PendingRecord::new(action, relative));
            }
        }
        Ok(records)
    }

    fn passes(&self, action: ChangeAction, gate: Gate, path: &Path) -> bool {
        let names = ChangeMask::FILE_NAME | ChangeMask::DIR_NAME;
        match gate {
            Gate::Name(Some(true)) => self.mask.contains(ChangeMask::DIR_NAME),
            Gate::Name(Some(false)) => self.mask.contains(ChangeMask::FILE_NAME),
            Gate::Name(None) if action == ChangeAction::Added => {
                if path.is_dir() {
                    self.mask.contains(ChangeMask::DIR_NAME)
                } else {
                    self.mask.contains(ChangeMask::FILE_NAME)
                }
            }
            Gate::Name(None) => self.mask.intersects(names),
            Gate::Changes(kinds) => self.mask.intersects(kinds),
        }
    }

    fn relative<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        path.strip_prefix(&self.root)
            .or_else(|_| path.strip_prefix(&self.canonical_root))
            .ok()
    }

    fn is_root(&self, path: &Path) -> bool {
        self.relative(path)
            .is_some_and(|relative| relative.as_os_str().is_empty())
    }
}

/// A change record waiting to be written into a read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRecord {
    action: ChangeAction,
    name: Vec<u16>,
}

impl PendingRecord {
    fn new(action: ChangeAction, relative: &Path) -> Self {
        let name = match relative.to_str() {
            Some(name) => name.encode_utf16().collect(),
            None => {
                warn!(
                    "{} is not valid Unicode; it is reported with replacement characters",
                    relative.display()
                );
                relative.to_string_lossy().encode_utf16().collect()
            }
        };
        Self { action, name }
    }

    /// Size of the record once written into a buffer.
    fn encoded_len(&self) -> usize {
        record_len(self.name.len() * 2)
    }

    fn into_removed(self) -> Self {
        Self {
            action: ChangeAction::Removed,
            ..self
        }
    }
}

/// The old half of a rename waiting for its new half.
struct HeldRename {
    record: PendingRecord,
    tracker: Option<usize>,
    generation: u64,
}

struct OutstandingRead {
    buffer: ReadBuffer,
    offset: usize,
}

#[derive(Default)]
struct PortState {
    pending: VecDeque<PendingRecord>,
    held: Option<HeldRename>,
    generation: u64,
    outstanding: Option<OutstandingRead>,
    completion: Option<CompletionRoutine>,
    failure: Option<io::Error>,
    closed: bool,
}

/// A read that is ready to complete.
type Ready = (CompletionRoutine, io::Result<usize>, ReadBuffer);

/// Shared between a handle and its platform watcher callback.
struct ReadPort {
    this: Weak<ReadPort>,
    scope: WatchScope,
    state: Mutex<PortState>,
}

impl ReadPort {
    fn new(scope: WatchScope) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            scope,
            state: Mutex::new(PortState::default()),
        })
    }

    fn bind_completion(&self, routine: CompletionRoutine) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        state.completion = Some(routine);
        Ok(())
    }

    fn read_changes(&self, buffer: ReadBuffer, offset: usize) -> Result<(), (io::Error, ReadBuffer)> {
        let ready = {
            let mut state = self.state.lock();
            if state.closed {
                return Err((closed_error(), buffer));
            }
            if state.completion.is_none() {
                return Err((
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "directory handle is not bound to a completion queue",
                    ),
                    buffer,
                ));
            }
            if state.outstanding.is_some() {
                return Err((
                    io::Error::new(io::ErrorKind::WouldBlock, "a read is already outstanding"),
                    buffer,
                ));
            }
            if offset >= buffer.len() {
                return Err((
                    io::Error::new(io::ErrorKind::InvalidInput, "read offset is past the buffer"),
                    buffer,
                ));
            }
            if let Some(err) = state.failure.take() {
                return Err((err, buffer));
            }
            state.outstanding = Some(OutstandingRead { buffer, offset });
            self.take_ready(&mut state)
        };
        finish(ready);
        Ok(())
    }

    fn on_event(&self, res: notify::Result<Event>) {
        let mut held_generation = None;
        let ready = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match res {
                Ok(event) => match self.scope.records_for(&event) {
                    Ok(records) => {
                        let tracker = event.attrs.tracker();
                        for record in records {
                            if let Some(generation) = self.enqueue(&mut state, record, tracker) {
                                held_generation = Some(generation);
                            }
                        }
                    }
                    Err(err) => state.failure = Some(err),
                },
                Err(err) if err.paths.iter().any(|path| !self.scope.is_root(path)) => {
                    warn!(
                        "Platform watcher error below {}: {err}",
                        self.scope.root.display()
                    );
                }
                Err(err) => state.failure = Some(notify_to_io(err)),
            }
            self.take_ready(&mut state)
        };
        finish(ready);
        if let Some(generation) = held_generation {
            self.arm_rename_timer(generation);
        }
    }

    /// Queue one record, pairing rename halves. Returns the generation of an
    /// old name that is now held and needs a timer.
    fn enqueue(
        &self,
        state: &mut PortState,
        record: PendingRecord,
        tracker: Option<usize>,
    ) -> Option<u64> {
        match record.action {
            ChangeAction::RenamedFrom => {
                self.release_held(state);
                state.generation += 1;
                state.held = Some(HeldRename {
                    record,
                    tracker,
                    generation: state.generation,
                });
                return Some(state.generation);
            }
            ChangeAction::RenamedTo => match state.held.take() {
                Some(held) if matches!((held.tracker, tracker), (Some(a), Some(b)) if a != b) => {
                    self.push_pending(state, held.record.into_removed());
                }
                Some(held) => self.push_pending(state, held.record),
                None => {}
            },
            _ => self.release_held(state),
        }
        self.push_pending(state, record);
        None
    }

    /// Report a held old name that never got its new name as removed.
    fn release_held(&self, state: &mut PortState) {
        if let Some(held) = state.held.take() {
            trace!(
                "Rename of {} has no new name in {}; reporting a removal",
                String::from_utf16_lossy(&held.record.name),
                self.scope.root.display()
            );
            self.push_pending(state, held.record.into_removed());
        }
    }

    fn push_pending(&self, state: &mut PortState, record: PendingRecord) {
        if state.pending.len() >= MAX_PENDING_RECORDS {
            state.pending.pop_front();
            warn!(
                "Change backlog for {} is full; dropping the oldest record",
                self.scope.root.display()
            );
        }
        state.pending.push_back(record);
    }

    fn arm_rename_timer(&self, generation: u64) {
        let port = self.this.clone();
        let spawned = thread::Builder::new()
            .name("dwatch-rename".to_string())
            .spawn(move || {
                thread::sleep(RENAME_PAIR_TIMEOUT);
                if let Some(port) = port.upgrade() {
                    port.expire_held(generation);
                }
            });
        if let Err(err) = spawned {
            warn!("Could not start the rename timer, reporting the old name now: {err}");
            self.expire_held(generation);
        }
    }

    /// Timer callback: release the held old name if it is still `generation`.
    fn expire_held(&self, generation: u64) {
        let ready = {
            let mut state = self.state.lock();
            let current = state
                .held
                .as_ref()
                .is_some_and(|held| held.generation == generation);
            if state.closed || !current {
                return;
            }
            self.release_held(&mut state);
            self.take_ready(&mut state)
        };
        finish(ready);
    }

    /// Complete the outstanding read if there is anything to report.
    fn take_ready(&self, state: &mut PortState) -> Option<Ready> {
        if state.outstanding.is_none() {
            return None;
        }
        let routine = state.completion.clone()?;

        if let Some(err) = state.failure.take() {
            let read = state.outstanding.take()?;
            return Some((routine, Err(err), read.buffer));
        }
        if state.pending.is_empty() {
            return None;
        }

        let mut read = state.outstanding.take()?;
        let capacity = read.buffer.len();
        let written = {
            let mut writer = RecordWriter::new(&mut read.buffer[read.offset..]);
            while let Some(first) = state.pending.front() {
                let pair_len = state
                    .pending
                    .get(1)
                    .filter(|second| {
                        first.action == ChangeAction::RenamedFrom
                            && second.action == ChangeAction::RenamedTo
                    })
                    .map(|second| first.encoded_len() + second.encoded_len());

                if let Some(pair_len) = pair_len {
                    if pair_len <= writer.remaining() {
                        for record in state.pending.drain(..2) {
                            writer.push(record.action, &record.name);
                        }
                        continue;
                    }
                    if !writer.is_empty() || pair_len <= capacity {
                        // The pair goes whole into the next read.
                        break;
                    }
                    warn!(
                        "Rename of {} in {} does not fit one read buffer; its halves are reported apart",
                        String::from_utf16_lossy(&first.name),
                        self.scope.root.display()
                    );
                }

                if !writer.push(first.action, &first.name) {
                    break;
                }
                state.pending.pop_front();
            }
            writer.len()
        };
        // With a carried rename half in front, a zero-length completion hands
        // it back to be reported on its own.
        if written == 0 && read.offset == 0 {
            if let Some(record) = state.pending.pop_front() {
                warn!(
                    "Dropping a change record for {} with a {} byte name that cannot fit the read buffer",
                    self.scope.root.display(),
                    record.name.len() * 2
                );
            }
        }
        Some((routine, Ok(written), read.buffer))
    }

    fn close(&self) -> bool {
        let ready = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.clear();
            state.held = None;
            state.failure = None;
            match (state.outstanding.take(), state.completion.clone()) {
                (Some(read), Some(routine)) => Some((routine, Err(aborted_error()), read.buffer)),
                _ => None,
            }
        };
        let had_outstanding = ready.is_some();
        finish(ready);
        had_outstanding
    }
}

fn finish(ready: Option<Ready>) {
    if let Some((routine, result, buffer)) = ready {
        routine(result, buffer);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "directory handle is closed")
}

fn aborted_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::Interrupted,
        "read aborted because the directory handle was closed",
    )
}

fn notify_to_io(err: notify::Error) -> io::Error {
    let message = err.to_string();
    match err.kind {
        notify::ErrorKind::Io(err) => err,
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
            io::Error::new(io::ErrorKind::NotFound, message)
        }
        _ => io::Error::other(message),
    }
}
