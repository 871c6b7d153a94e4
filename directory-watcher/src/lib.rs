//! # Directory Change Watcher
//!
//! Asynchronous change notifications for any number of directories, each
//! with its own handler, change mask and include/exclude patterns.
//!
//! ## Features
//!
//! - **One dispatch thread**: every watched directory shares a single
//!   completion queue and the thread that drains it
//! - **Paired renames**: old and new names arrive in one callback, even when
//!   the platform splits them across two reads
//! - **Filtering**: semicolon separated globs matched against the file name,
//!   the relative path or the full path
//! - **Delivery context**: callbacks run on the dispatch thread or on the
//!   thread that owns the [`NotificationPump`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   DirectoryChangeWatcher                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  DirectoryHandle ──► CompletionQueue ──► dispatch thread         │
//! │   (notify)              │                    │                   │
//! │                         ▼                    ▼                   │
//! │                    WatchState ──► RecordDecoder ──► FilterDecorator
//! │                                                        │         │
//! │                                     inline / NotificationPump    │
//! │                                                        ▼         │
//! │                                             DirectoryChangeHandler
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use dwatch_directory_watcher::{
//!     ChangeMask, DirectoryChangeWatcher, Handler, LoggingHandler, MonitorPrivileges,
//!     WatchOptions, WatcherConfig,
//! };
//!
//! # fn main() -> dwatch_directory_watcher::Result<()> {
//! let watcher = DirectoryChangeWatcher::new(WatcherConfig::default(), MonitorPrivileges::ensure())?;
//! let handler = Handler::new(LoggingHandler);
//! watcher.watch_directory(
//!     "/tmp",
//!     ChangeMask::FILE_NAME | ChangeMask::LAST_WRITE,
//!     &handler,
//!     WatchOptions::new().include("*.txt;*.md"),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod filter;
mod handle;
pub mod handler;
pub mod privilege;
mod queue;
pub mod record;
mod state;
pub mod watcher;

pub use config::{ChangeMask, DeliveryMode, FilterFlags, WatchOptions, WatcherConfig};
pub use delivery::NotificationPump;
pub use error::{Result, WatcherError};
pub use event::{ChangeAction, ChangeRecord, FileChange};
pub use filter::FilterSpec;
pub use handler::{DirectoryChangeHandler, Handler, LoggingHandler};
pub use privilege::MonitorPrivileges;
pub use record::{RecordDecoder, RecordWriter};
pub use watcher::{DirectoryChangeWatcher, WatcherRef};
