//! testrack: a parallel test runner for JavaScript/TypeScript monorepos.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, discovers packages and drives either the
//! one-shot report or the interactive event loop.

mod adapter;
mod app;
mod config;
mod coverage;
mod discovery;
mod events;
mod flags;
mod keys;
mod output;
mod package;
mod report;
mod runner;
mod scheduler;
mod summary;
mod template;
mod tui;
mod view;
mod watch;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter::{artifacts_root, AdapterRegistry};
use crate::app::{App, AppAction};
use crate::config::{load_config, WatchRule};
use crate::events::Event;
use crate::output::{LiveProgress, OutputStyle};
use crate::runner::ProcessManager;
use crate::scheduler::Scheduler;
use crate::tui::TerminalSession;
use crate::watch::{spawn_watcher, WatchHandle, WatchRouter};

const TICK_RATE: Duration = Duration::from_millis(120);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "testrack",
    version,
    about = "Parallel test runner for JavaScript/TypeScript monorepos",
    styles = help_styles()
)]
struct Cli {
    /// Open the interactive interface.
    #[arg(short, long)]
    interactive: bool,
    /// Rerun packages when their files change (implies --interactive).
    #[arg(short, long)]
    watch: bool,
    /// Collect coverage for every package.
    #[arg(short, long)]
    coverage: bool,
    /// Print failure messages and raw output of broken runs; log at debug.
    #[arg(short, long)]
    verbose: bool,
    /// Path to a testrack.toml or testrack.json file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Repository root (defaults to the current directory).
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = cli.interactive || cli.watch;
    init_tracing(cli.verbose, interactive)?;

    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("repository root {} not found", root.display()))?;

    let config = load_config(cli.config.as_deref(), &root)?;
    let adapters = AdapterRegistry::new();
    let packages = discovery::discover_packages(&root, &adapters)?;
    let names: Vec<&str> = packages.iter().map(|package| package.name.as_str()).collect();
    let rules = config.compile_watch_rules(&names)?;
    info!(
        root = %root.display(),
        config = ?config.source,
        packages = packages.len(),
        "starting"
    );

    let artifacts = artifacts_root();
    let scheduler = Scheduler::new(packages, adapters, cli.coverage, artifacts.clone());

    let code = if interactive {
        let watch = WatchControl {
            root: root.clone(),
            rules,
            debounce_ms: config.debounce_ms(),
            handle: None,
        };
        let enter_command = config.enter_command().map(str::to_string);
        let app = App::new(scheduler, root, enter_command);
        run_interactive(app, watch, cli.watch).await?
    } else {
        run_once(scheduler, cli.verbose).await?
    };

    if let Err(err) = std::fs::remove_dir_all(&artifacts) {
        debug!(%err, dir = %artifacts.display(), "artifacts not removed");
    }
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_tracing(verbose: bool, interactive: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("TESTRACK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if !interactive {
        builder.with_writer(io::stderr).try_init()
    } else if let Some(path) = std::env::var_os("TESTRACK_LOG_FILE") {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", Path::new(&path).display()))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
    } else {
        // The terminal belongs to the interface.
        builder.with_writer(io::sink).try_init()
    };
    result.map_err(|err| anyhow!(err))
}

async fn run_once(mut scheduler: Scheduler, verbose: bool) -> Result<i32> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut manager = ProcessManager::new(event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    let style = output::output_style();
    let mut progress = LiveProgress::new();
    let mut stdout = io::stdout();

    let (launches, _) = scheduler.run_all();
    manager.launch(launches, |id, error| scheduler.on_spawn_failed(id, error));
    let mut ticker = tokio::time::interval(TICK_RATE);

    while scheduler.any_running() {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::RunOutput { id, chunk } => scheduler.on_output(id, &chunk),
                    Event::RunExited { id, code } => {
                        manager.forget(id);
                        let launches = scheduler.on_exit(id, code);
                        manager.launch(launches, |id, error| scheduler.on_spawn_failed(id, error));
                    }
                    Event::RunFailed { id, error } => {
                        manager.forget(id);
                        let launches = scheduler.on_spawn_failed(id, error);
                        manager.launch(launches, |id, error| scheduler.on_spawn_failed(id, error));
                    }
                    Event::Shutdown => {
                        warn!("interrupted, stopping runs");
                        manager.terminate_all();
                        break;
                    }
                    Event::Watch(_) | Event::Key(_) | Event::Resize => {}
                }
            }
            _ = ticker.tick() => {
                if style == OutputStyle::Live {
                    progress.redraw(&scheduler, &mut stdout)?;
                }
            }
        }
    }

    progress.erase(&mut stdout)?;
    write!(stdout, "{}", output::final_report(&scheduler, verbose))?;
    stdout.flush()?;
    Ok(output::exit_code(&scheduler, output::is_ci()))
}

async fn run_interactive(mut app: App, mut watch: WatchControl, start_watching: bool) -> Result<i32> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut manager = ProcessManager::new(event_tx.clone());
    spawn_signal_listener(event_tx.clone());
    let stop_input = Arc::new(AtomicBool::new(false));
    let input_thread = spawn_input_listener(event_tx.clone(), stop_input.clone());

    let mut session = TerminalSession::start()?;
    if start_watching {
        toggle_watch(&mut app, &mut watch, &event_tx);
    }

    let (launches, _) = app.scheduler.run_all();
    manager.launch(launches, |id, error| app.on_spawn_failed(id, error));

    let mut ticker = tokio::time::interval(TICK_RATE);
    let mut result: Result<()> = Ok(());
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::RunOutput { id, chunk } => app.on_output(id, &chunk),
                    Event::RunExited { id, code } => {
                        manager.forget(id);
                        let launches = app.on_exit(id, code);
                        manager.launch(launches, |id, error| app.on_spawn_failed(id, error));
                    }
                    Event::RunFailed { id, error } => {
                        manager.forget(id);
                        let launches = app.on_spawn_failed(id, error);
                        manager.launch(launches, |id, error| app.on_spawn_failed(id, error));
                    }
                    Event::Watch(trigger) => {
                        let launches = app.on_watch(trigger);
                        manager.launch(launches, |id, error| app.on_spawn_failed(id, error));
                    }
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &mut manager, &mut watch, &event_tx);
                    }
                    Event::Resize => {}
                    Event::Shutdown => app.should_quit = true,
                }
            }
            _ = ticker.tick() => app.tick(Instant::now()),
        }

        if let Err(err) = session.draw(&mut app) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    debug!(running = manager.running(), "shutting down");
    manager.terminate_all();
    watch.stop();
    stop_input.store(true, Ordering::Relaxed);
    drop(event_rx);
    let _ = input_thread.join();
    session.restore()?;
    result.map(|()| 0)
}

fn handle_app_action(
    action: AppAction,
    app: &mut App,
    manager: &mut ProcessManager,
    watch: &mut WatchControl,
    event_tx: &mpsc::Sender<Event>,
) {
    match action {
        AppAction::Launch(launches) => {
            manager.launch(launches, |id, error| app.on_spawn_failed(id, error))
        }
        AppAction::ToggleWatch => toggle_watch(app, watch, event_tx),
        AppAction::Execute { program, args } => {
            if let Err(err) = spawn_detached(&program, &args, &app.root) {
                app.set_status_warning(format!("{err:#}"));
            }
        }
        AppAction::Quit | AppAction::None => {}
    }
}

/// The watcher's inputs, kept so watching can be toggled at runtime.
struct WatchControl {
    root: PathBuf,
    rules: Vec<WatchRule>,
    debounce_ms: u64,
    handle: Option<WatchHandle>,
}

impl WatchControl {
    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

fn toggle_watch(app: &mut App, watch: &mut WatchControl, event_tx: &mpsc::Sender<Event>) {
    if watch.handle.is_some() {
        watch.stop();
        app.set_watch_enabled(false);
        return;
    }
    let router = WatchRouter::new(&watch.root, watch.rules.clone(), app.scheduler.packages());
    match spawn_watcher(&watch.root, router, watch.debounce_ms, event_tx.clone()) {
        Ok(handle) => {
            watch.handle = Some(handle);
            app.set_watch_enabled(true);
        }
        Err(err) => {
            warn!(%err, "failed to start watcher");
            app.set_status_warning(format!("watch failed: {err:#}"));
        }
    }
}

/// Starts the enter-action command in the background with null stdio.
fn spawn_detached(program: &str, args: &[String], cwd: &Path) -> Result<()> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to run {program}"))?;
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(())
}

fn spawn_input_listener(tx: mpsc::Sender<Event>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if !crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => Event::Key(key),
                Ok(crossterm::event::Event::Resize(_, _)) => Event::Resize,
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    })
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
