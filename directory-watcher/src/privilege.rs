//! One-time preparation of the process for directory monitoring.

use std::sync::OnceLock;

use tracing::debug;

static PRIVILEGES: OnceLock<MonitorPrivileges> = OnceLock::new();

/// Proof that the process has been prepared for directory monitoring.
///
/// Obtain it once at startup with [`MonitorPrivileges::ensure`] and pass it
/// to [`DirectoryChangeWatcher::new`](crate::DirectoryChangeWatcher::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPrivileges {
    /// Per-user watch limit reported by the platform, when it has one.
    watch_limit: Option<u64>,
}

impl MonitorPrivileges {
    /// Run the platform preparation on the first call; later calls return
    /// the same token.
    pub fn ensure() -> Self {
        *PRIVILEGES.get_or_init(prepare)
    }

    /// Maximum number of watches the platform allows this user, if known.
    pub fn watch_limit(&self) -> Option<u64> {
        self.watch_limit
    }
}

#[cfg(target_os = "linux")]
fn prepare() -> MonitorPrivileges {
    const MAX_USER_WATCHES: &str = "/proc/sys/fs/inotify/max_user_watches";

    let watch_limit = std::fs::read_to_string(MAX_USER_WATCHES)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok());
    match watch_limit {
        Some(limit) if limit < 8192 => tracing::warn!(
            "inotify allows only {limit} watches per user; recursive watches of large trees may fail"
        ),
        Some(limit) => debug!("inotify allows {limit} watches per user"),
        None => debug!("Could not read {MAX_USER_WATCHES}"),
    }
    MonitorPrivileges { watch_limit }
}

#[cfg(not(target_os = "linux"))]
fn prepare() -> MonitorPrivileges {
    debug!("Directory monitoring needs no extra privileges on this platform");
    MonitorPrivileges { watch_limit: None }
}
