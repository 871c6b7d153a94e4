//! Change actions, decoded records and the notifications built from them.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The action code carried by a raw change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// A file or directory was created.
    Added,

    /// A file or directory was deleted.
    Removed,

    /// Contents, size, times or attributes changed.
    Modified,

    /// Old name of a renamed entry.
    RenamedFrom,

    /// New name of a renamed entry.
    RenamedTo,
}

impl ChangeAction {
    /// Decode a raw action code. Unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Added),
            2 => Some(Self::Removed),
            3 => Some(Self::Modified),
            4 => Some(Self::RenamedFrom),
            5 => Some(Self::RenamedTo),
            _ => None,
        }
    }

    /// The raw action code.
    pub fn code(self) -> u32 {
        match self {
            Self::Added => 1,
            Self::Removed => 2,
            Self::Modified => 3,
            Self::RenamedFrom => 4,
            Self::RenamedTo => 5,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::RenamedFrom => "renamed from",
            Self::RenamedTo => "renamed to",
        };
        f.write_str(name)
    }
}

/// One decoded change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// What happened.
    pub action: ChangeAction,

    /// Name relative to the watched directory.
    pub relative_name: String,

    /// The watched directory joined with `relative_name`.
    pub absolute_path: PathBuf,
}

/// A change ready for delivery, with renames already paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(PathBuf),
    Removed(PathBuf),
    Modified(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Everything a filter decorator can forward to a handler.
#[derive(Debug)]
pub(crate) enum Notification {
    FileAdded(PathBuf),
    FileRemoved(PathBuf),
    FileModified(PathBuf),
    FileNameChanged { old: PathBuf, new: PathBuf },
    ReadError(io::Error),
    WatchStarted(Option<io::Error>),
    WatchStopped,
}

impl From<FileChange> for Notification {
    fn from(change: FileChange) -> Self {
        match change {
            FileChange::Added(path) => Self::FileAdded(path),
            FileChange::Removed(path) => Self::FileRemoved(path),
            FileChange::Modified(path) => Self::FileModified(path),
            FileChange::Renamed { from, to } => Self::FileNameChanged { old: from, new: to },
        }
    }
}

/// Copies an `io::Error` so it can be reported to more than one place.
pub(crate) fn duplicate_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}
