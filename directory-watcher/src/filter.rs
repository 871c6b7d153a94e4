//! Include/exclude patterns and the decorator that applies them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, trace};

use crate::config::FilterFlags;
use crate::delivery::{PostedNotification, PumpSender};
use crate::error::{Result, WatcherError};
use crate::event::{ChangeAction, Notification};
use crate::handler::HandlerCore;

/// Compiled include and exclude patterns.
///
/// Patterns are separated by `;` and matched case-insensitively. An empty
/// include list matches everything, an empty exclude list matches nothing.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl FilterSpec {
    /// Compile both pattern lists.
    pub fn new(include: &str, exclude: &str) -> Result<Self> {
        Ok(Self {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    /// Whether `subject` passes the include list.
    pub fn includes(&self, subject: &Path) -> bool {
        self.include.as_ref().is_none_or(|set| set.is_match(subject))
    }

    /// Whether `subject` is caught by the exclude list.
    pub fn excludes(&self, subject: &Path) -> bool {
        self.exclude.as_ref().is_some_and(|set| set.is_match(subject))
    }

    /// Whether `subject` should be reported.
    pub fn matches(&self, subject: &Path) -> bool {
        self.includes(subject) && !self.excludes(subject)
    }

    /// Whether neither list has patterns.
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }
}

fn compile_patterns(patterns: &str) -> Result<Option<GlobSet>> {
    let mut builder = GlobSetBuilder::new();
    let mut count = 0;
    for pattern in patterns.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|source| WatcherError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        builder.add(glob);
        count += 1;
    }
    if count == 0 {
        return Ok(None);
    }
    let set = builder
        .build()
        .map_err(|source| WatcherError::InvalidPattern {
            pattern: patterns.to_string(),
            source,
        })?;
    Ok(Some(set))
}

/// Where a decorator sends notifications.
pub(crate) enum Delivery {
    /// Call the handler on the dispatch thread.
    Inline,
    /// Post to the creator's notification pump.
    Posted(PumpSender),
}

/// Wraps one directory's handler with its filters and delivery context.
pub(crate) struct FilterDecorator {
    handler: Arc<HandlerCore>,
    directory: PathBuf,
    filter: FilterSpec,
    flags: FilterFlags,
    delivery: Delivery,
}

impl FilterDecorator {
    pub(crate) fn new(
        handler: Arc<HandlerCore>,
        directory: PathBuf,
        filter: FilterSpec,
        flags: FilterFlags,
        delivery: Delivery,
    ) -> Self {
        Self {
            handler,
            directory,
            filter,
            flags: flags.normalized(),
            delivery,
        }
    }

    pub(crate) fn handler(&self) -> &Arc<HandlerCore> {
        &self.handler
    }

    /// Forward a notification through the configured delivery context.
    pub(crate) fn notify(self: &Arc<Self>, notification: Notification) {
        match &self.delivery {
            Delivery::Inline => self.dispatch(notification),
            Delivery::Posted(sender) => {
                let posted = PostedNotification {
                    target: Arc::clone(self),
                    notification,
                };
                if sender.send(posted).is_err() {
                    debug!(
                        "Notification pump for {} is gone; dropping notification",
                        self.directory.display()
                    );
                }
            }
        }
    }

    /// Apply filters and call the handler. Runs in the delivery context.
    pub(crate) fn dispatch(&self, notification: Notification) {
        let callbacks = self.handler.callbacks();
        match notification {
            Notification::FileAdded(path) => {
                if self.should_deliver(ChangeAction::Added, &path, None) {
                    callbacks.on_file_added(&path);
                }
            }
            Notification::FileRemoved(path) => {
                if self.should_deliver(ChangeAction::Removed, &path, None) {
                    callbacks.on_file_removed(&path);
                }
            }
            Notification::FileModified(path) => {
                if self.should_deliver(ChangeAction::Modified, &path, None) {
                    callbacks.on_file_modified(&path);
                }
            }
            Notification::FileNameChanged { old, new } => {
                if self.should_deliver(ChangeAction::RenamedFrom, &old, Some(&new)) {
                    callbacks.on_file_name_changed(&old, &new);
                }
            }
            Notification::ReadError(err) => {
                callbacks.on_read_directory_changes_error(&err, &self.directory);
            }
            Notification::WatchStarted(err) => {
                if !self.flags.contains(FilterFlags::NO_WATCH_START_NOTIFICATION) {
                    callbacks.on_watch_started(err.as_ref(), &self.directory);
                }
            }
            Notification::WatchStopped => {
                if !self.flags.contains(FilterFlags::NO_WATCH_STOP_NOTIFICATION) {
                    callbacks.on_watch_stopped(&self.directory);
                }
            }
        }
    }

    fn should_deliver(&self, action: ChangeAction, path: &Path, new_path: Option<&Path>) -> bool {
        let use_patterns = !self.flags.contains(FilterFlags::DONT_USE_FILTERS);
        let use_handler = !self.flags.contains(FilterFlags::DONT_USE_HANDLER_FILTER);
        let handler_allows = || {
            !use_handler
                || self
                    .handler
                    .callbacks()
                    .on_filter_notification(action, path, new_path)
        };
        let patterns_allow = || !use_patterns || self.patterns_allow(path, new_path);

        let deliver = if self.flags.contains(FilterFlags::TEST_HANDLER_FIRST) {
            handler_allows() && patterns_allow()
        } else {
            patterns_allow() && handler_allows()
        };
        if !deliver {
            trace!("Filtered out {action} notification for {}", path.display());
        }
        deliver
    }

    /// A rename passes when either name is included and not both are
    /// excluded.
    fn patterns_allow(&self, path: &Path, new_path: Option<&Path>) -> bool {
        let old = self.subject(path);
        match new_path {
            None => self.filter.matches(old),
            Some(new_path) => {
                let new = self.subject(new_path);
                (self.filter.includes(old) || self.filter.includes(new))
                    && !(self.filter.excludes(old) && self.filter.excludes(new))
            }
        }
    }

    /// The part of `path` patterns are matched against.
    fn subject<'p>(&self, path: &'p Path) -> &'p Path {
        if self.flags.contains(FilterFlags::CHECK_FULL_PATH) {
            path
        } else if self.flags.contains(FilterFlags::CHECK_PARTIAL_PATH) {
            path.strip_prefix(&self.directory).unwrap_or(path)
        } else {
            path.file_name().map_or(path, Path::new)
        }
    }
}
