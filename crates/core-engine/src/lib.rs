//! Orchestrator: the per-pass pipeline and the engine event loop.
//!
//! One pass reads the watched file, parses it into cells, annotates code
//! cells with their name sets, hands the sequence to the scheduler (which
//! invokes the evaluator as needed), then publishes the populated sequence
//! to observers and replaces the retained `last_sequence`.
//!
//! Concurrency model: a pass is strictly single-threaded and runs inline on
//! the engine's context; the evaluator's `run` is the only suspension
//! point. Overlapping passes cannot happen — change events arriving while a
//! pass is in flight queue in the channel and collapse into a single
//! follow-up pass.
//!
//! I/O policy: a failed read skips the pass and keeps the previous
//! sequence (the watcher will fire again when the file reappears). Only a
//! scheduler invariant violation is terminal.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use core_cell::{Cell, CellSequence, content_hash};
use core_eval::Evaluator;
use core_events::{EngineEvent, EventHooks, NoopEventHooks, PASSES_COALESCED};
use core_schedule::{ExecStats, ScheduleError, Strategy, execute_pass};
use core_watch::WatchError;
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unrecoverable I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Internal(#[from] ScheduleError),
}

impl EngineError {
    /// Orchestrator-level exit codes: 1 for unrecoverable I/O (internal
    /// invariant violations abort through the same path), 2 for watcher
    /// failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Io { .. } | EngineError::Internal(_) => 1,
            EngineError::Watch(_) => 2,
        }
    }
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Cells were scheduled; `stats` says how many ran vs. carried over.
    Completed { stats: ExecStats, elapsed: Duration },
    /// File bytes identical to the previous read; nothing happened.
    Unchanged,
    /// The file could not be read; the previous sequence is retained.
    Skipped { reason: String },
}

/// Observer of published passes. The binary installs one for terminal
/// summaries and JSON snapshots; tests install recording observers.
pub trait PassObserver {
    fn on_pass(&mut self, cells: &[Cell], outcome: &PassOutcome);
}

/// Running totals across passes, snapshot for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassMetrics {
    pub passes: u64,
    pub executed_cells: u64,
    pub reused_cells: u64,
    pub unchanged_skips: u64,
    pub io_skips: u64,
}

pub struct Engine<E> {
    path: PathBuf,
    evaluator: E,
    strategy: Strategy,
    last_sequence: CellSequence,
    last_read_hash: Option<u64>,
    metrics: PassMetrics,
    observers: Vec<Box<dyn PassObserver>>,
    hooks: Box<dyn EventHooks>,
}

impl<E: Evaluator> Engine<E> {
    pub fn new(path: impl Into<PathBuf>, evaluator: E, strategy: Strategy) -> Self {
        Self {
            path: path.into(),
            evaluator,
            strategy,
            last_sequence: Vec::new(),
            last_read_hash: None,
            metrics: PassMetrics::default(),
            observers: Vec::new(),
            hooks: Box::new(NoopEventHooks),
        }
    }

    pub fn add_observer(&mut self, observer: impl PassObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Install loop-boundary hooks (replacing the default no-op pair).
    pub fn set_hooks(&mut self, hooks: impl EventHooks) {
        self.hooks = Box::new(hooks);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The populated sequence from the most recent completed pass.
    pub fn cells(&self) -> &[Cell] {
        &self.last_sequence
    }

    pub fn metrics(&self) -> PassMetrics {
        self.metrics
    }

    /// Discard the environment and retained sequence; the next pass runs
    /// everything from scratch.
    pub fn reset_environment(&mut self) {
        info!(target: "engine", "environment_reset_requested");
        self.evaluator.reset();
        self.last_sequence.clear();
        self.last_read_hash = None;
    }

    /// Execute one pass over the current file content.
    pub async fn run_pass(&mut self) -> Result<PassOutcome, EngineError> {
        let started = Instant::now();
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(source) => {
                // Treat as a pause: keep the last sequence and wait for the
                // next watcher event.
                warn!(
                    target: "engine",
                    file = %self.path.display(),
                    error = %source,
                    "read_failed_pass_skipped"
                );
                self.metrics.io_skips += 1;
                let outcome = PassOutcome::Skipped {
                    reason: source.to_string(),
                };
                self.publish(&outcome);
                return Ok(outcome);
            }
        };

        let source = normalize_line_endings(&raw);
        let read_hash = content_hash(&source);
        if self.last_read_hash == Some(read_hash) {
            debug!(target: "engine", "content_unchanged_noop");
            self.metrics.unchanged_skips += 1;
            let outcome = PassOutcome::Unchanged;
            self.publish(&outcome);
            return Ok(outcome);
        }

        let mut next = core_parse::parse(&source);
        for cell in &mut next {
            if cell.is_code() {
                cell.analysis = Some(core_analyze::analyze(&cell.source));
            }
        }

        let (populated, stats) =
            execute_pass(&self.last_sequence, next, &mut self.evaluator, self.strategy).await?;

        self.last_sequence = populated;
        self.last_read_hash = Some(read_hash);
        self.metrics.passes += 1;
        self.metrics.executed_cells += stats.executed as u64;
        self.metrics.reused_cells += stats.reused as u64;

        let elapsed = started.elapsed();
        info!(
            target: "engine",
            file = %self.path.display(),
            cells = self.last_sequence.len(),
            executed = stats.executed,
            reused = stats.reused,
            elapsed_ms = elapsed.as_millis() as u64,
            "pass_complete"
        );
        let outcome = PassOutcome::Completed { stats, elapsed };
        self.publish(&outcome);
        Ok(outcome)
    }

    fn publish(&mut self, outcome: &PassOutcome) {
        for observer in &mut self.observers {
            observer.on_pass(&self.last_sequence, outcome);
        }
    }

    /// Drive passes from the event channel until shutdown. The caller owns
    /// event production (watcher thread, Ctrl-C handler, tests).
    pub async fn run_loop(&mut self, mut rx: Receiver<EngineEvent>) -> Result<(), EngineError> {
        self.run_pass().await?;
        while let Some(event) = rx.recv().await {
            self.hooks.pre_handle(&event);
            match event {
                EngineEvent::Shutdown => break,
                EngineEvent::ResetRequested => {
                    self.reset_environment();
                    self.run_pass().await?;
                }
                EngineEvent::FileChanged => {
                    let mut coalesced = 0u64;
                    let mut reset = false;
                    let mut shutdown = false;
                    // Collapse the queued burst into one follow-up pass.
                    while let Ok(extra) = rx.try_recv() {
                        match extra {
                            EngineEvent::FileChanged => coalesced += 1,
                            EngineEvent::ResetRequested => reset = true,
                            EngineEvent::Shutdown => {
                                shutdown = true;
                                break;
                            }
                        }
                    }
                    if coalesced > 0 {
                        PASSES_COALESCED.fetch_add(coalesced, Ordering::Relaxed);
                        debug!(target: "engine", coalesced, "events_coalesced");
                    }
                    if reset {
                        self.reset_environment();
                    }
                    if let Err(err) = self.run_pass().await {
                        error!(target: "engine", %err, "pass_failed");
                        return Err(err);
                    }
                    if shutdown {
                        break;
                    }
                }
            }
            self.hooks.post_handle(&event);
        }
        info!(target: "engine", "engine_loop_exit");
        Ok(())
    }
}

/// Normalize CRLF/CR line endings to LF before parsing; cell line anchors
/// assume LF-only text.
pub fn normalize_line_endings(input: &str) -> String {
    if !input.contains('\r') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_crlf_and_lone_cr() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(normalize_line_endings("plain\n"), "plain\n");
    }

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        let io = EngineError::Io {
            path: PathBuf::from("nb.py"),
            source: std::io::Error::other("denied"),
        };
        assert_eq!(io.exit_code(), 1);
        assert_eq!(
            EngineError::Internal(ScheduleError::Cycle(3)).exit_code(),
            1
        );
        let watch = EngineError::Watch(WatchError::NotAFile(PathBuf::from("/")));
        assert_eq!(watch.exit_code(), 2);
    }
}
