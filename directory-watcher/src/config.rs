//! Configuration types for directory change watching.

use std::path::Path;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Size of the buffer each watched directory reads change records into.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Smallest accepted read buffer.
pub const MIN_BUFFER_SIZE: usize = 256;

/// Largest accepted read buffer.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

bitflags! {
    /// Which kinds of change a watched directory reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChangeMask: u32 {
        /// File creation, deletion and renaming.
        const FILE_NAME = 0x0000_0001;
        /// Directory creation, deletion and renaming.
        const DIR_NAME = 0x0000_0002;
        /// Attribute changes.
        const ATTRIBUTES = 0x0000_0004;
        /// File size changes.
        const SIZE = 0x0000_0008;
        /// Last write time changes.
        const LAST_WRITE = 0x0000_0010;
        /// Last access time changes.
        const LAST_ACCESS = 0x0000_0020;
        /// Creation time changes.
        const CREATION = 0x0000_0040;
        /// Security descriptor or permission changes.
        const SECURITY = 0x0000_0100;
    }
}

impl Default for ChangeMask {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for ChangeMask {
    type Err = WatcherError;

    /// Parses a comma separated list such as `name,dir-name,last-write`.
    fn from_str(s: &str) -> Result<Self> {
        let mut mask = ChangeMask::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            mask |= match part.to_ascii_lowercase().replace('_', "-").as_str() {
                "all" => ChangeMask::all(),
                "name" | "file-name" => ChangeMask::FILE_NAME,
                "dir-name" | "dir" => ChangeMask::DIR_NAME,
                "attributes" => ChangeMask::ATTRIBUTES,
                "size" => ChangeMask::SIZE,
                "last-write" => ChangeMask::LAST_WRITE,
                "last-access" => ChangeMask::LAST_ACCESS,
                "creation" => ChangeMask::CREATION,
                "security" => ChangeMask::SECURITY,
                other => {
                    return Err(WatcherError::InvalidParameter(format!(
                        "unknown change kind `{other}`"
                    )));
                }
            };
        }
        Ok(mask)
    }
}

bitflags! {
    /// How the filter decorator treats notifications for a directory.
    ///
    /// An empty set means [`FilterFlags::DEFAULT`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FilterFlags: u32 {
        /// Skip the include/exclude pattern test.
        const DONT_USE_FILTERS = 1;
        /// Match patterns against the absolute path.
        const CHECK_FULL_PATH = 2;
        /// Match patterns against the path relative to the watched directory.
        const CHECK_PARTIAL_PATH = 4;
        /// Match patterns against the file name only.
        const CHECK_FILE_NAME_ONLY = 8;
        /// Ask the handler's filter hook before testing patterns.
        const TEST_HANDLER_FIRST = 16;
        /// Never call the handler's filter hook.
        const DONT_USE_HANDLER_FILTER = 32;
        /// Suppress the watch-started callback.
        const NO_WATCH_START_NOTIFICATION = 64;
        /// Suppress the watch-stopped callback.
        const NO_WATCH_STOP_NOTIFICATION = 128;

        const DEFAULT = Self::CHECK_FILE_NAME_ONLY.bits();
        const DONT_USE_ANY_FILTER_TESTS =
            Self::DONT_USE_FILTERS.bits() | Self::DONT_USE_HANDLER_FILTER.bits();
        const NO_WATCH_START_STOP_NOTIFICATION =
            Self::NO_WATCH_START_NOTIFICATION.bits() | Self::NO_WATCH_STOP_NOTIFICATION.bits();
    }
}

impl FilterFlags {
    /// Maps the empty set to [`FilterFlags::DEFAULT`].
    pub fn normalized(self) -> Self {
        if self.is_empty() {
            Self::DEFAULT
        } else {
            self
        }
    }
}

impl Default for FilterFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Where handler callbacks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Callbacks run on the watcher's dispatch thread.
    #[default]
    DispatchThread,

    /// Callbacks are posted to a [`NotificationPump`](crate::NotificationPump)
    /// drained by the thread that created the watcher.
    CreatorThread,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Callback delivery context.
    pub delivery: DeliveryMode,

    /// Filter flags applied to directories watched without an override.
    pub filter_flags: FilterFlags,

    /// Bytes per directory read buffer.
    pub buffer_size: usize,
}

impl WatcherConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delivery mode.
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Set the default filter flags.
    pub fn with_filter_flags(mut self, flags: FilterFlags) -> Self {
        self.filter_flags = flags.normalized();
        self
    }

    /// Set the read buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: WatcherConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(WatcherError::Config(format!(
                "buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }
        Ok(())
    }

    /// The buffer size rounded up to a whole number of 4-byte units.
    pub(crate) fn aligned_buffer_size(&self) -> usize {
        self.buffer_size.next_multiple_of(4)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::default(),
            filter_flags: FilterFlags::DEFAULT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Options for a single `watch_directory` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Also report changes in subdirectories.
    pub watch_subtree: bool,

    /// Semicolon separated glob patterns; empty matches everything.
    pub include_filter: String,

    /// Semicolon separated glob patterns; empty matches nothing.
    pub exclude_filter: String,

    /// Overrides the engine's filter flags for this directory.
    pub filter_flags: Option<FilterFlags>,
}

impl WatchOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the whole subtree.
    pub fn subtree(mut self) -> Self {
        self.watch_subtree = true;
        self
    }

    /// Set the include patterns.
    pub fn include(mut self, patterns: impl Into<String>) -> Self {
        self.include_filter = patterns.into();
        self
    }

    /// Set the exclude patterns.
    pub fn exclude(mut self, patterns: impl Into<String>) -> Self {
        self.exclude_filter = patterns.into();
        self
    }

    /// Override the filter flags.
    pub fn with_filter_flags(mut self, flags: FilterFlags) -> Self {
        self.filter_flags = Some(flags.normalized());
        self
    }
}
