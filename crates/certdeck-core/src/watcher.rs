//! File system watcher for the domain backing file.
//!
//! Watches the file's parent directory (so delete+recreate is observed)
//! through a debounced watcher, and calls a reload callback once a burst of
//! notifications for the file has settled.

use crate::config::WatcherConfig;
use crate::error::{CertdeckError, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Callback invoked when the backing file should be reloaded.
pub type ReloadCallback = Arc<dyn Fn() + Send + Sync + 'static>;

type FileDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

struct WatchShared {
    suspended: AtomicUsize,
    /// Notifications that happened before this instant were caused while
    /// suspended and are dropped when they arrive late.
    quiet_until: Mutex<Option<Instant>>,
    on_reload: ReloadCallback,
    stop: AtomicBool,
}

impl WatchShared {
    fn fire(&self, reason: &str) {
        debug!("Reloading domain file ({})", reason);
        (self.on_reload)();
    }

    fn mark_quiet(&self, now: Instant) {
        match self.quiet_until.lock() {
            Ok(mut quiet) => *quiet = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
    }

    /// True if a notification from `time` should be acted on.
    fn is_live(&self, time: Instant) -> bool {
        if self.suspended.load(Ordering::SeqCst) > 0 {
            return false;
        }
        match self.quiet_until.lock() {
            Ok(quiet) => quiet.map_or(true, |until| time > until),
            Err(_) => true,
        }
    }
}

/// Cloneable handle for silencing a [`ChangeWatcher`].
///
/// Suspensions nest: the watcher is live again once every `suspend` has been
/// matched by a `resume`.
#[derive(Clone)]
pub struct WatchControl {
    shared: Arc<WatchShared>,
}

impl WatchControl {
    /// Discard notifications until the matching [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.shared.suspended.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one `suspend`. The last one discards notifications still pending
    /// from the suspended period and reloads immediately.
    pub fn resume(&self) {
        let previous = self
            .shared
            .suspended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.shared.mark_quiet(Instant::now());
                self.shared.fire("resumed");
            }
            Ok(_) => {}
            Err(_) => warn!("Change watcher resumed without a matching suspend"),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst) > 0
    }
}

/// Watches one file and reloads it after external edits.
pub struct ChangeWatcher {
    file: PathBuf,
    shared: Arc<WatchShared>,
    _debouncer: Arc<Mutex<FileDebouncer>>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching `file`.
    ///
    /// The parent directory is created if missing so that the watch can be
    /// established before the file exists.
    pub fn start(file: impl AsRef<Path>, on_reload: ReloadCallback) -> Result<Self> {
        let file = file.as_ref().to_path_buf();
        let file_name = file
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| CertdeckError::Watch {
                message: format!("{} has no file name", file.display()),
            })?;
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| CertdeckError::io_with_path(e, &dir))?;

        let (event_tx, event_rx) = mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(WatcherConfig::DEBOUNCE_WINDOW, None, event_tx)?;
        debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
        let debouncer = Arc::new(Mutex::new(debouncer));

        let shared = Arc::new(WatchShared {
            suspended: AtomicUsize::new(0),
            quiet_until: Mutex::new(None),
            on_reload,
            stop: AtomicBool::new(false),
        });

        let worker = EventLoop {
            file_name,
            dir: dir.clone(),
            shared: Arc::clone(&shared),
            debouncer: Arc::clone(&debouncer),
        };
        let thread = thread::Builder::new()
            .name("certdeck-watcher".into())
            .spawn(move || worker.run(event_rx))
            .map_err(|e| CertdeckError::Watch {
                message: format!("Failed to spawn watcher thread: {}", e),
            })?;

        info!("Started watching {}", file.display());
        Ok(Self {
            file,
            shared,
            _debouncer: debouncer,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn control(&self) -> WatchControl {
        WatchControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the notification loop and wait for its thread to finish.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watcher thread panicked");
            }
            debug!("Stopped watching {}", self.file.display());
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop {
    file_name: OsString,
    dir: PathBuf,
    shared: Arc<WatchShared>,
    debouncer: Arc<Mutex<FileDebouncer>>,
}

impl EventLoop {
    fn run(self, events: mpsc::Receiver<DebounceEventResult>) {
        while !self.shared.stop.load(Ordering::SeqCst) {
            match events.recv_timeout(WatcherConfig::POLL_INTERVAL) {
                Ok(Ok(batch)) => self.handle(&batch),
                Ok(Err(errors)) => {
                    for e in errors {
                        warn!("File watcher error: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("File watcher channel disconnected");
                    break;
                }
            }
        }
    }

    /// One settled batch triggers at most one reload.
    fn handle(&self, batch: &[DebouncedEvent]) {
        let mut changed = false;
        let mut removed = false;
        for event in batch.iter().filter(|e| self.concerns_file(e)) {
            if !self.shared.is_live(event.time) {
                debug!("Ignoring {:?} from a suspended period", event.kind);
                continue;
            }
            debug!("Change notification {:?}", event.kind);
            changed = true;
            removed |= is_removal(&event.kind);
        }

        if removed {
            self.rearm();
        }
        if changed && !self.shared.stop.load(Ordering::SeqCst) {
            self.shared.fire("file changed");
        }
    }

    fn concerns_file(&self, event: &DebouncedEvent) -> bool {
        !is_ignored_kind(&event.kind)
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(self.file_name.as_os_str()))
    }

    /// Some backends drop the watch along with the inode.
    fn rearm(&self) {
        let Ok(mut debouncer) = self.debouncer.lock() else {
            return;
        };
        let watcher = &mut *debouncer;
        if let Err(e) = watcher.unwatch(&self.dir) {
            debug!("Unwatch of {} failed: {}", self.dir.display(), e);
        }
        match watcher.watch(&self.dir, RecursiveMode::NonRecursive) {
            Ok(()) => debug!("Re-armed watch on {}", self.dir.display()),
            Err(e) => warn!("Failed to re-arm watch on {}: {}", self.dir.display(), e),
        }
    }
}

fn is_ignored_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

fn is_removal(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, MetadataKind, RemoveKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn counting_watcher(file: &Path) -> (ChangeWatcher, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let watcher = ChangeWatcher::start(
            file,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (watcher, count)
    }

    fn settle() {
        thread::sleep(WatcherConfig::DEBOUNCE_WINDOW * 5);
    }

    fn shared() -> WatchShared {
        WatchShared {
            suspended: AtomicUsize::new(0),
            quiet_until: Mutex::new(None),
            on_reload: Arc::new(|| {}),
            stop: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_notifications_from_suspended_period_are_not_live() {
        let shared = shared();
        let before = Instant::now();
        assert!(shared.is_live(before));

        shared.suspended.store(1, Ordering::SeqCst);
        assert!(!shared.is_live(Instant::now()));

        shared.suspended.store(0, Ordering::SeqCst);
        let resumed = Instant::now();
        shared.mark_quiet(resumed);
        assert!(!shared.is_live(before));
        assert!(!shared.is_live(resumed));
        assert!(shared.is_live(resumed + Duration::from_millis(1)));
    }

    #[test]
    fn test_event_kind_filters() {
        assert!(is_ignored_kind(&EventKind::Access(AccessKind::Any)));
        assert!(is_ignored_kind(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_ignored_kind(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_removal(&EventKind::Remove(RemoveKind::File)));
        assert!(is_removal(&EventKind::Modify(ModifyKind::Name(
            RenameMode::From
        ))));
        assert!(!is_removal(&EventKind::Modify(ModifyKind::Name(
            RenameMode::To
        ))));
    }

    #[test]
    fn test_burst_of_writes_reloads_once() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        fs::write(&file, "a.example.com\n").unwrap();
        let (_watcher, count) = counting_watcher(&file);

        for i in 0..5 {
            fs::write(&file, format!("a{}.example.com\n", i)).unwrap();
        }
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        let (_watcher, count) = counting_watcher(&file);

        fs::write(temp_dir.path().join("other.txt"), "x").unwrap();
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delete_and_recreate_still_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        fs::write(&file, "a.example.com\n").unwrap();
        let (_watcher, count) = counting_watcher(&file);

        fs::remove_file(&file).unwrap();
        settle();
        let after_delete = count.load(Ordering::SeqCst);
        assert!(after_delete >= 1);

        fs::write(&file, "b.example.com\n").unwrap();
        settle();
        assert!(count.load(Ordering::SeqCst) > after_delete);
    }

    #[test]
    fn test_suspend_discards_and_resume_reloads_once() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        let (watcher, count) = counting_watcher(&file);
        let control = watcher.control();

        control.suspend();
        control.suspend();
        fs::write(&file, "a.example.com\n").unwrap();
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        control.resume();
        assert!(control.is_suspended());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        control.resume();
        assert!(!control.is_suspended());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        settle();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_notifications_of_own_write_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        let (watcher, count) = counting_watcher(&file);
        let control = watcher.control();

        // Resume before the debounce window has delivered the write.
        control.suspend();
        fs::write(&file, "a.example.com\n").unwrap();
        control.resume();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        settle();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        fs::write(&file, "b.example.com\n").unwrap();
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_ends_notifications() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("domains.txt");
        let (mut watcher, count) = counting_watcher(&file);
        watcher.stop();

        fs::write(&file, "a.example.com\n").unwrap();
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
