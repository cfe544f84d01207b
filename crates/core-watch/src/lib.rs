//! Debounced single-file watcher.
//!
//! Watches the target file's parent directory (editors replace files via
//! rename, which would orphan a direct file watch) and filters events down
//! to the target name. Raw notifications cross from the notify callback
//! into a dedicated debounce thread over a crossbeam channel; events inside
//! the debounce window coalesce into one [`EngineEvent::FileChanged`],
//! delivered to the engine with `blocking_send`.
//!
//! Removal or rename of the file is a pause, not an error: the directory
//! watch stays active and the next re-appearance produces an ordinary
//! change event. The watcher never reads the file and never calls into the
//! evaluator.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use core_events::{
    CHANNEL_SEND_FAILURES, EngineEvent, WATCH_EVENTS_DEBOUNCED, WATCH_EVENTS_RAW,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch target has no file name: {0}")]
    NotAFile(PathBuf),
    #[error("file system watch failed: {0}")]
    Notify(#[from] notify::Error),
    #[error("could not spawn the watch thread: {0}")]
    Spawn(std::io::Error),
}

/// Shutdown poll interval for the debounce thread.
const STOP_POLL: Duration = Duration::from_millis(150);

/// Handle to the watcher thread. Dropping it signals the thread and joins.
pub struct FileWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching `path`, delivering debounced change events to the
    /// engine channel.
    pub fn spawn(
        path: &Path,
        debounce: Duration,
        events: Sender<EngineEvent>,
    ) -> Result<Self, WatchError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| WatchError::NotAFile(path.to_path_buf()))?
            .to_os_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (raw_tx, raw_rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |result| {
            // Send failures mean the debounce thread is gone; nothing to do.
            let _ = raw_tx.send(result);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(target: "watch", dir = %dir.display(), file = ?file_name, "watch_started");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("folio-watch".to_string())
            .spawn(move || debounce_loop(watcher, raw_rx, file_name, debounce, events, stop_flag))
            .map_err(WatchError::Spawn)?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

type RawEvent = notify::Result<notify::Event>;

fn debounce_loop(
    _watcher: RecommendedWatcher,
    raw: Receiver<RawEvent>,
    file_name: OsString,
    window: Duration,
    events: Sender<EngineEvent>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match raw.recv_timeout(STOP_POLL) {
            Ok(event) => {
                if !is_relevant(&event, &file_name) {
                    continue;
                }
                WATCH_EVENTS_RAW.fetch_add(1, Ordering::Relaxed);
                drain_window(&raw, &file_name, window);
                WATCH_EVENTS_DEBOUNCED.fetch_add(1, Ordering::Relaxed);
                trace!(target: "watch", "file_changed_debounced");
                if events.blocking_send(EngineEvent::FileChanged).is_err() {
                    CHANNEL_SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!(target: "watch", "watch_thread_exit");
}

/// Swallow further raw events until the debounce window closes.
fn drain_window(raw: &Receiver<RawEvent>, file_name: &OsString, window: Duration) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match raw.recv_timeout(remaining) {
            Ok(event) => {
                if is_relevant(&event, file_name) {
                    WATCH_EVENTS_RAW.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn is_relevant(event: &RawEvent, file_name: &OsString) -> bool {
    match event {
        Ok(event) => {
            // Pure access notifications would re-trigger on our own reads.
            if matches!(event.kind, EventKind::Access(_)) {
                return false;
            }
            // An empty path list is a rescan hint; treat it as a change.
            event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(OsString::from).as_ref() == Some(file_name))
        }
        Err(error) => {
            // Watch errors are rare and usually transient; trigger a
            // re-read so the engine observes whatever state is on disk.
            warn!(target: "watch", %error, "watch_error_treated_as_change");
            true
        }
    }
}
