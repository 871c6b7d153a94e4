//! Integration tests for watching real directories.
//!
//! These tests touch the filesystem and wait for the platform to report the
//! changes, so every expectation is polled with a timeout.

mod support;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, mpsc};
use std::thread;
use std::time::Duration;

use dwatch_directory_watcher::{
    ChangeMask, DeliveryMode, DirectoryChangeHandler, DirectoryChangeWatcher, Handler,
    MonitorPrivileges, WatchOptions, WatcherConfig, WatcherError, WatcherRef,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use support::{Recorder, Seen, wait_for};

fn watcher() -> DirectoryChangeWatcher {
    support::init_tracing();
    DirectoryChangeWatcher::new(WatcherConfig::default(), MonitorPrivileges::ensure()).unwrap()
}

/// A temp dir and its canonical path, so reported paths compare equal.
fn temp_root() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    (dir, root)
}

#[test]
fn test_caller_errors_are_rejected_up_front() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    let file = root.join("plain.txt");
    fs::write(&file, "x").unwrap();

    let err = watcher
        .watch_directory("", ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap_err();
    assert!(matches!(err, WatcherError::InvalidParameter(_)), "{err}");

    let err = watcher
        .watch_directory(&root, ChangeMask::empty(), &handler, WatchOptions::new())
        .unwrap_err();
    assert!(matches!(err, WatcherError::InvalidParameter(_)), "{err}");

    let err = watcher
        .watch_directory(&file, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap_err();
    assert!(matches!(err, WatcherError::NotADirectory(_)), "{err}");

    let err = watcher
        .watch_directory(
            root.join("missing"),
            ChangeMask::all(),
            &handler,
            WatchOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, WatcherError::NotADirectory(_)), "{err}");

    let err = watcher
        .watch_directory(
            &root,
            ChangeMask::all(),
            &handler,
            WatchOptions::new().include("a["),
        )
        .unwrap_err();
    assert!(matches!(err, WatcherError::InvalidPattern { .. }), "{err}");

    assert_eq!(watcher.num_watched_directories(), 0);
    assert_eq!(handler.ref_count(), 0);
    assert!(recorder.seen().is_empty());
}

#[test]
fn test_watch_and_unwatch_counts() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_a, first) = temp_root();
    let (_b, second) = temp_root();

    assert!(!watcher.unwatch_directory(&first));

    watcher
        .watch_directory(&first, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    watcher
        .watch_directory(&second, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    assert!(recorder.contains(&Seen::Started(first.clone())));
    assert!(recorder.contains(&Seen::Started(second.clone())));

    assert_eq!(watcher.num_watched_directories(), 2);
    assert!(watcher.is_watching_directory(&first));
    assert_eq!(handler.ref_count(), 2);
    assert_eq!(handler.engine_ref_count(), 2);
    assert!(handler.is_attached());

    assert!(watcher.unwatch_directory(&first));
    assert!(!watcher.unwatch_directory(&first));
    assert!(!watcher.is_watching_directory(&first));
    assert_eq!(recorder.count(&Seen::Stopped(first.clone())), 1);
    assert_eq!(handler.ref_count(), 1);

    assert!(watcher.unwatch_all_directories());
    assert_eq!(watcher.num_watched_directories(), 0);
    assert_eq!(recorder.count(&Seen::Stopped(second)), 1);
    assert_eq!(handler.ref_count(), 0);
    assert!(!handler.is_attached());
}

#[test]
fn test_unwatching_one_of_three_leaves_two() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let dirs: Vec<(TempDir, PathBuf)> = (0..3).map(|_| temp_root()).collect();

    for (_, root) in &dirs {
        watcher
            .watch_directory(root, ChangeMask::all(), &handler, WatchOptions::new())
            .unwrap();
    }
    assert_eq!(watcher.num_watched_directories(), 3);

    assert!(watcher.unwatch_directory(&dirs[1].1));
    assert_eq!(watcher.num_watched_directories(), 2);
    assert!(watcher.is_watching_directory(&dirs[0].1));
    assert!(!watcher.is_watching_directory(&dirs[1].1));
    assert!(watcher.is_watching_directory(&dirs[2].1));
    assert_eq!(handler.ref_count(), 2);
}

#[test]
fn test_watch_races_unwatch_and_handler_drop() {
    let watcher = Arc::new(watcher());
    let (_dir, root) = temp_root();
    let stop = Arc::new(AtomicBool::new(false));

    let unwatcher = {
        let watcher = watcher.handle();
        let stop = Arc::clone(&stop);
        let root = root.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                watcher.unwatch_directory(&root);
                thread::yield_now();
            }
        })
    };
    let (drop_tx, drop_rx) = mpsc::channel::<Handler>();
    let dropper = thread::spawn(move || {
        for handler in drop_rx {
            drop(handler);
        }
    });

    let (done_tx, done_rx) = mpsc::channel();
    let racer = {
        let watcher = Arc::clone(&watcher);
        let root = root.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                let handler = Recorder::new().handler();
                // Losing to a concurrent unwatch may fail the watch; it must
                // still return.
                let _ = watcher.watch_directory(
                    &root,
                    ChangeMask::all(),
                    &handler,
                    WatchOptions::new(),
                );
                drop_tx.send(handler).unwrap();
            }
            let _ = done_tx.send(());
        })
    };

    let finished = done_rx.recv_timeout(Duration::from_secs(20));
    stop.store(true, Ordering::Release);
    assert!(finished.is_ok(), "watch_directory did not return while racing");
    racer.join().unwrap();
    unwatcher.join().unwrap();
    dropper.join().unwrap();

    assert_eq!(watcher.num_watched_directories(), 0);
    assert!(watcher.unwatch_all_directories());
}

#[test]
fn test_watching_again_replaces_the_previous_handler() {
    let watcher = watcher();
    let first = Recorder::new();
    let second = Recorder::new();
    let handler_a = first.handler();
    let handler_b = second.handler();
    let (_dir, root) = temp_root();

    watcher
        .watch_directory(&root, ChangeMask::all(), &handler_a, WatchOptions::new())
        .unwrap();
    watcher
        .watch_directory(&root, ChangeMask::all(), &handler_b, WatchOptions::new())
        .unwrap();

    assert_eq!(watcher.num_watched_directories(), 1);
    assert_eq!(first.count(&Seen::Stopped(root.clone())), 1);
    assert_eq!(handler_a.ref_count(), 0);
    assert_eq!(handler_b.ref_count(), 1);

    let created = root.join("new.txt");
    fs::write(&created, "hello").unwrap();
    assert!(wait_for(|| second.contains(&Seen::Added(created.clone()))));
    assert!(!first.mentions("new.txt"));
}

#[test]
fn test_include_and_exclude_patterns() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();

    watcher
        .watch_directory(
            &root,
            ChangeMask::FILE_NAME,
            &handler,
            WatchOptions::new().include("*.txt;*.tmp").exclude("*.tmp"),
        )
        .unwrap();

    fs::write(root.join("skipped.tmp"), "x").unwrap();
    fs::write(root.join("other.log"), "x").unwrap();
    let wanted = root.join("Kept.TXT");
    fs::write(&wanted, "x").unwrap();

    assert!(wait_for(|| recorder.contains(&Seen::Added(wanted.clone()))));
    assert!(!recorder.mentions("skipped.tmp"));
    assert!(!recorder.mentions("other.log"));
}

#[test]
fn test_rename_is_reported_once_with_both_names() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    let old = root.join("before.txt");
    let new = root.join("after.txt");
    fs::write(&old, "x").unwrap();

    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    fs::rename(&old, &new).unwrap();

    let renamed = Seen::Renamed(old.clone(), new.clone());
    assert!(wait_for(|| recorder.contains(&renamed)));
    // Give a split rename time to produce a stray half.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorder.count(&renamed), 1);
    assert!(!recorder.contains(&Seen::Added(new)));
    assert!(!recorder.contains(&Seen::Removed(old)));
}

#[test]
fn test_moving_a_file_out_reports_a_removal() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    let (_elsewhere, outside) = temp_root();
    let leaving = root.join("leaving.txt");
    fs::write(&leaving, "x").unwrap();

    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    fs::rename(&leaving, outside.join("leaving.txt")).unwrap();

    assert!(wait_for(|| recorder.contains(&Seen::Removed(leaving.clone()))));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorder.count(&Seen::Removed(leaving)), 1);
    assert!(
        !recorder
            .seen()
            .iter()
            .any(|seen| matches!(seen, Seen::Renamed(..)))
    );
}

#[test]
fn test_moving_a_file_in_reports_an_addition() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    let (_elsewhere, outside) = temp_root();
    let arriving = outside.join("arriving.txt");
    fs::write(&arriving, "x").unwrap();

    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    let moved = root.join("arriving.txt");
    fs::rename(&arriving, &moved).unwrap();

    assert!(wait_for(|| recorder.contains(&Seen::Added(moved.clone()))));
    assert_eq!(recorder.count(&Seen::Added(moved)), 1);
}

#[test]
fn test_subtree_option() {
    let watcher = watcher();
    let flat = Recorder::new();
    let deep = Recorder::new();
    let flat_handler = flat.handler();
    let deep_handler = deep.handler();
    let (_a, flat_root) = temp_root();
    let (_b, deep_root) = temp_root();
    fs::create_dir(flat_root.join("nested")).unwrap();
    fs::create_dir(deep_root.join("nested")).unwrap();

    watcher
        .watch_directory(&flat_root, ChangeMask::FILE_NAME, &flat_handler, WatchOptions::new())
        .unwrap();
    watcher
        .watch_directory(
            &deep_root,
            ChangeMask::FILE_NAME,
            &deep_handler,
            WatchOptions::new().subtree(),
        )
        .unwrap();

    fs::write(flat_root.join("nested").join("inner.txt"), "x").unwrap();
    let flat_marker = flat_root.join("marker.txt");
    fs::write(&flat_marker, "x").unwrap();
    let deep_inner = deep_root.join("nested").join("inner.txt");
    fs::write(&deep_inner, "x").unwrap();

    assert!(wait_for(|| deep.contains(&Seen::Added(deep_inner.clone()))));
    assert!(wait_for(|| flat.contains(&Seen::Added(flat_marker.clone()))));
    assert!(!flat.mentions("inner.txt"));
}

#[test]
fn test_dropping_the_handler_unwatches_its_directories() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_a, first) = temp_root();
    let (_b, second) = temp_root();

    watcher
        .watch_directory(&first, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    watcher
        .watch_directory(&second, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    drop(handler);

    assert_eq!(watcher.num_watched_directories(), 0);
    assert_eq!(recorder.count(&Seen::Stopped(first)), 1);
    assert_eq!(recorder.count(&Seen::Stopped(second)), 1);
}

#[test]
fn test_handler_moves_to_a_second_watcher() {
    let old_watcher = watcher();
    let new_watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_a, first) = temp_root();
    let (_b, second) = temp_root();

    old_watcher
        .watch_directory(&first, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    new_watcher
        .watch_directory(&second, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();

    assert_eq!(old_watcher.num_watched_directories(), 0);
    assert_eq!(new_watcher.num_watched_directories(), 1);
    assert_eq!(recorder.count(&Seen::Stopped(first)), 1);
    assert_eq!(handler.ref_count(), 1);
    assert_eq!(handler.engine_ref_count(), 1);
}

/// Unwatches its own directory from inside the first added callback.
struct UnwatchOnAdd {
    recorder: Arc<Recorder>,
    watcher: OnceLock<WatcherRef>,
}

impl DirectoryChangeHandler for UnwatchOnAdd {
    fn on_file_added(&self, path: &Path) {
        self.recorder.on_file_added(path);
        if let (Some(watcher), Some(directory)) = (self.watcher.get(), path.parent()) {
            watcher.unwatch_directory(directory);
        }
    }

    fn on_watch_stopped(&self, directory: &Path) {
        self.recorder.on_watch_stopped(directory);
    }
}

#[test]
fn test_unwatch_from_inside_a_callback() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let callbacks = Arc::new(UnwatchOnAdd {
        recorder: Arc::clone(&recorder),
        watcher: OnceLock::new(),
    });
    let _ = callbacks.watcher.set(watcher.handle());
    let handler = Handler::from_shared(callbacks);
    let (_dir, root) = temp_root();

    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    fs::write(root.join("trigger.txt"), "x").unwrap();

    assert!(wait_for(|| !watcher.is_watching_directory(&root)));
    assert!(wait_for(|| recorder.contains(&Seen::Stopped(root.clone()))));
    assert_eq!(recorder.count(&Seen::Stopped(root)), 1);
    assert_eq!(handler.ref_count(), 0);
}

#[test]
fn test_removing_the_watched_directory_reports_a_read_error() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    let watched = root.join("watched");
    fs::create_dir(&watched).unwrap();
    fs::write(watched.join("file.txt"), "x").unwrap();

    watcher
        .watch_directory(&watched, ChangeMask::all(), &handler, WatchOptions::new())
        .unwrap();
    fs::remove_dir_all(&watched).unwrap();

    assert!(wait_for(|| recorder.contains(&Seen::ReadError(watched.clone()))));
    assert!(wait_for(|| !watcher.is_watching_directory(&watched)));
    assert_eq!(handler.ref_count(), 0);
    assert!(!recorder.contains(&Seen::Stopped(watched)));
}

#[tokio::test]
async fn test_creator_thread_delivery_runs_on_the_pump() {
    support::init_tracing();
    let config = WatcherConfig::default().with_delivery(DeliveryMode::CreatorThread);
    let watcher = DirectoryChangeWatcher::new(config, MonitorPrivileges::ensure()).unwrap();
    let mut pump = watcher.take_notification_pump().unwrap();
    assert!(watcher.take_notification_pump().is_none());

    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    let created = root.join("posted.txt");
    fs::write(&created, "x").unwrap();

    let deadline = tokio::time::Instant::now() + support::TIMEOUT;
    while !recorder.contains(&Seen::Added(created.clone())) {
        let next = tokio::time::timeout_at(deadline, pump.dispatch_next()).await;
        assert!(matches!(next, Ok(true)), "no notification arrived in time");
    }

    assert!(recorder.contains(&Seen::Started(root)));
    let here = thread::current().id();
    assert!(recorder.threads().iter().all(|id| *id == here));
}

#[test]
fn test_watching_without_start_stop_notifications() {
    let watcher = watcher();
    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();

    watcher
        .watch_directory(
            &root,
            ChangeMask::all(),
            &handler,
            WatchOptions::new().with_filter_flags(
                dwatch_directory_watcher::FilterFlags::CHECK_FILE_NAME_ONLY
                    | dwatch_directory_watcher::FilterFlags::NO_WATCH_START_STOP_NOTIFICATION,
            ),
        )
        .unwrap();
    assert!(watcher.unwatch_directory(&root));
    assert!(recorder.seen().is_empty());
}

#[test]
fn test_pump_delivers_stop_notifications_after_unwatch() {
    support::init_tracing();
    let config = WatcherConfig::default().with_delivery(DeliveryMode::CreatorThread);
    let watcher = DirectoryChangeWatcher::new(config, MonitorPrivileges::ensure()).unwrap();
    let mut pump = watcher.take_notification_pump().unwrap();

    let recorder = Recorder::new();
    let handler = recorder.handler();
    let (_dir, root) = temp_root();
    watcher
        .watch_directory(&root, ChangeMask::FILE_NAME, &handler, WatchOptions::new())
        .unwrap();
    assert!(watcher.unwatch_all_directories());
    assert!(!recorder.contains(&Seen::Stopped(root.clone())));

    assert!(pump.dispatch_pending() >= 1);
    assert_eq!(recorder.count(&Seen::Stopped(root)), 1);
}
