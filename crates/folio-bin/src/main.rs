//! Folio entrypoint: watch a percent-delimited script and keep its cell
//! outputs live.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Once;

use clap::Parser;
use core_cell::{Cell, CellKind};
use core_config::Config;
use core_engine::{Engine, EngineError, PassObserver, PassOutcome};
use core_eval::ScriptEvaluator;
use core_events::{EngineEvent, engine_channel};
use core_schedule::Strategy;
use core_watch::FileWatcher;
use crossterm::style::Stylize;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Literate notebook engine for percent scripts")]
struct Args {
    /// Notebook source file (UTF-8 percent script).
    pub path: PathBuf,
    /// Optional configuration file path (overrides discovery of `folio.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Run a single pass, print the cell summary, and exit.
    #[arg(long)]
    pub once: bool,
    /// Write the populated cell sequence as JSON after each pass.
    #[arg(long = "json", value_name = "PATH")]
    pub json: Option<PathBuf>,
    /// Disable dependency tracking: re-run linearly from the first change.
    #[arg(long = "no-deps")]
    pub no_deps: bool,
}

struct AppStartup {
    // Held for the life of the process so the non-blocking writer flushes.
    _log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { _log_guard: None }
    }

    fn configure_logging(&mut self) {
        let log_dir = Path::new(".");
        let log_path = log_dir.join("folio.log");
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }

        let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .with_ansi(false)
            .try_init()
        {
            Ok(_) => {
                self._log_guard = Some(guard);
            }
            Err(_err) => {
                // Global tracing subscriber already installed; drop guard so
                // the writer shuts down.
            }
        }
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

/// Styled per-pass terminal output, in the spirit of the classic
/// render-to-terminal CLI: cell tags in color, errors in red.
struct TerminalSummary {
    verbose_cells: bool,
}

impl TerminalSummary {
    fn print_cell(&self, index: usize, cell: &Cell) {
        let tag = match cell.kind {
            CellKind::Code => "CODE".blue(),
            CellKind::Prose => "PROSE".green(),
        };
        let title = cell.title().unwrap_or("");
        println!("[{:>2}] {tag} {title}", index + 1);
        if !self.verbose_cells {
            return;
        }
        if cell.is_prose() {
            for line in cell.source.lines() {
                println!("     {}", line.to_string().dim());
            }
            return;
        }
        if let Some(run) = &cell.run {
            if !run.stdout.is_empty() {
                for line in run.stdout.lines() {
                    println!("     {line}");
                }
            }
            if let Some(value) = &run.value {
                println!("     {} {}", "=>".dim(), render_value(value));
            }
            if let Some(err) = &run.error {
                println!("     {}", format!("{err}").red());
                for line in err.context.lines() {
                    println!("     {}", line.to_string().red().dim());
                }
            }
        }
    }
}

fn render_value(value: &core_cell::Renderable) -> String {
    match value {
        core_cell::Renderable::Text(text) => text.clone(),
        other => format!("<{} artifact>", other.tag()),
    }
}

impl PassObserver for TerminalSummary {
    fn on_pass(&mut self, cells: &[Cell], outcome: &PassOutcome) {
        match outcome {
            PassOutcome::Completed { stats, elapsed } => {
                println!(
                    "{} {} executed, {} reused, {} cells, {} ms",
                    "pass:".bold(),
                    stats.executed,
                    stats.reused,
                    cells.len(),
                    elapsed.as_millis()
                );
                for (index, cell) in cells.iter().enumerate() {
                    self.print_cell(index, cell);
                }
                let errors = cells
                    .iter()
                    .filter(|c| c.run.as_ref().is_some_and(|r| r.is_error()))
                    .count();
                if errors > 0 {
                    println!("{}", format!("{errors} cell(s) errored").red());
                }
            }
            PassOutcome::Unchanged => {}
            PassOutcome::Skipped { reason } => {
                println!("{} {}", "paused:".yellow(), reason);
            }
        }
    }
}

/// Publishes the populated sequence as JSON for downstream renderers.
struct JsonSnapshot {
    path: PathBuf,
}

impl PassObserver for JsonSnapshot {
    fn on_pass(&mut self, cells: &[Cell], outcome: &PassOutcome) {
        if matches!(outcome, PassOutcome::Skipped { .. }) {
            return;
        }
        match serde_json::to_vec_pretty(cells) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&self.path, bytes) {
                    warn!(target: "io", file = %self.path.display(), %err, "snapshot_write_failed");
                }
            }
            Err(err) => warn!(target: "io", %err, "snapshot_serialize_failed"),
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    let mut config = core_config::load_from(path).unwrap_or_else(|err| {
        warn!(target: "config", %err, "config_load_failed_using_defaults");
        Config::default()
    });
    config.apply_limits();
    config
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut startup = AppStartup::new();
    startup.configure_logging();
    AppStartup::install_panic_hook();

    let args = Args::parse();
    info!(
        target: "runtime",
        file = %args.path.display(),
        once = args.once,
        "startup"
    );

    match run(&args).await {
        Ok(()) => {
            info!(target: "runtime", "clean_exit");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(target: "runtime", %err, "fatal");
            eprintln!("folio: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(args: &Args) -> Result<(), EngineError> {
    let config = load_config(args.config.clone());
    let strategy = if args.no_deps || !config.file.schedule.dependency_tracking {
        Strategy::Linear
    } else {
        Strategy::Dependency
    };
    info!(target: "runtime", ?strategy, timeout_ms = config.timeout().as_millis() as u64, "configured");

    let evaluator = ScriptEvaluator::with_timeout(config.timeout());
    let mut engine = Engine::new(&args.path, evaluator, strategy);
    engine.add_observer(TerminalSummary {
        verbose_cells: args.once,
    });
    if let Some(json_path) = &args.json {
        engine.add_observer(JsonSnapshot {
            path: json_path.clone(),
        });
    }

    if args.once {
        let outcome = engine.run_pass().await?;
        if let PassOutcome::Skipped { reason } = outcome {
            // One-shot mode has no watcher to recover through.
            return Err(EngineError::Io {
                path: args.path.clone(),
                source: std::io::Error::other(reason),
            });
        }
        return Ok(());
    }

    let (tx, rx) = engine_channel();
    let watcher = FileWatcher::spawn(&args.path, config.debounce(), tx.clone())?;

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "runtime", "ctrl_c");
            let _ = ctrl_c_tx.send(EngineEvent::Shutdown).await;
        }
    });
    drop(tx);

    let result = engine.run_loop(rx).await;
    watcher.shutdown();
    result
}
