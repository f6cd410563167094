mod cli;
mod input;
mod logging;
mod shells;
mod terminal;

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use deckterm_db::{Preferences, Viewport, DB_FILE_NAME};
use deckterm_pty::{
    DisplayBridge, FanoutHub, Presented, SessionConfig, SessionController, Subscription,
    DEFAULT_QUEUE_DEPTH,
};
use deckterm_remote::RemoteGateway;
use log::{info, warn};
use tokio::sync::mpsc;

use cli::Cli;
use input::{InputAction, InputRouter};
use shells::ShellCatalog;
use terminal::{RawModeGuard, ResizeEvents, TerminalSurface};

/// Output events the display may lag behind before it is dropped and
/// re-attached. Generous because a slow host terminal must not lose output.
const DISPLAY_QUEUE_DEPTH: usize = 4096;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let catalog = ShellCatalog::discover();

    if cli.list_shells {
        print_shells(&catalog);
        return Ok(());
    }

    let data_dir = cli
        .data_dir()
        .ok_or("could not determine home directory; pass --data-dir")?;
    // Keep the guard alive until exit so buffered log lines are written.
    let _log_guard = logging::init(&data_dir)?;
    info!("deckterm {} starting", env!("CARGO_PKG_VERSION"));

    let db = deckterm_db::open(&data_dir.join(DB_FILE_NAME))?;
    let mut prefs = Preferences::load(&db)?;

    // The host terminal's real size wins over the remembered one.
    let viewport = match terminal::host_size() {
        Some((cols, rows)) => Viewport { cols, rows },
        None => prefs.viewport,
    };

    let session = Arc::new(SessionController::new(
        SessionConfig {
            cols: viewport.cols,
            rows: viewport.rows,
            cwd: cli.cwd.clone(),
            ..SessionConfig::default()
        },
        FanoutHub::new("output", DISPLAY_QUEUE_DEPTH),
    ));
    let keystrokes = FanoutHub::new("keystrokes", DEFAULT_QUEUE_DEPTH);
    let bridge = DisplayBridge::new(Arc::clone(&session), keystrokes.clone());

    // Attach before the shell starts so its first prompt is not missed.
    let display = bridge.attach();
    start_shell(&session, &cli, &prefs).await?;

    let gateway = if cli.no_remote {
        None
    } else {
        match RemoteGateway::bind(cli.gateway_config(), Arc::clone(&session), keystrokes).await {
            Ok(gateway) => Some(tokio::spawn(gateway.serve())),
            Err(e) => {
                warn!("remote clients disabled: {e}");
                None
            }
        }
    };

    let outcome = {
        let _raw = RawModeGuard::enable()?;
        let mut surface = TerminalSurface::new(std::io::stdout());
        surface.notice("Ctrl-] then 1-9 switches shell, l lists shells, q quits");
        run_frontend(&bridge, display, &catalog, &mut surface).await
    };

    if let Some(path) = session.executable().await {
        prefs.shell_path = Some(path);
    }
    let (cols, rows) = session.dimensions().await;
    prefs.viewport = Viewport { cols, rows };

    session.shutdown().await;
    if let Some(gateway) = gateway {
        gateway.abort();
    }

    if let Err(e) = prefs.save(&db) {
        warn!("could not save preferences: {e}");
    }
    info!("deckterm exiting");
    outcome
}

/// Start the first shell: `--shell`, then the remembered one, then the
/// platform default. A remembered shell that no longer starts is skipped.
async fn start_shell(
    session: &SessionController,
    cli: &Cli,
    prefs: &Preferences,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(shell) = &cli.shell {
        session.initialize(shell).await?;
        return Ok(());
    }

    let fallback = shells::default_shell();
    if let Some(remembered) = &prefs.shell_path {
        match session.initialize(remembered).await {
            Ok(()) => return Ok(()),
            Err(e) if fallback.is_some() => warn!("remembered shell {remembered} unusable: {e}"),
            Err(e) => return Err(e.into()),
        }
    }

    let shell = fallback.ok_or("no shell found; pass --shell")?;
    session.initialize(&shell).await?;
    Ok(())
}

fn print_shells(catalog: &ShellCatalog) {
    let mut out = std::io::stdout().lock();
    for (i, entry) in catalog.iter().enumerate() {
        let _ = writeln!(out, "{:>2}  {:<12} {}", i + 1, entry.name, entry.path);
    }
}

/// Shuttle input, output and resizes until the user quits or the shell exits.
async fn run_frontend<W: Write>(
    bridge: &DisplayBridge,
    mut display: Subscription,
    catalog: &ShellCatalog,
    surface: &mut TerminalSurface<W>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdin: mpsc::Receiver<Vec<u8>> = terminal::spawn_input_reader(std::io::stdin())?;
    let mut resizes = ResizeEvents::new()?;
    let mut router = InputRouter::new();

    loop {
        tokio::select! {
            event = display.recv() => match event {
                Some(event) => {
                    if bridge.present(event, surface) == Presented::Ended {
                        info!("shell exited");
                        break;
                    }
                }
                None => {
                    warn!("display fell behind the shell; re-attaching");
                    display = bridge.attach();
                }
            },
            input = stdin.recv() => {
                let Some(bytes) = input else {
                    info!("stdin closed");
                    break;
                };
                for action in router.feed(&bytes) {
                    match action {
                        InputAction::Forward(bytes) => bridge.keystroke(&bytes).await,
                        InputAction::SwitchShell(index) => switch_shell(bridge, catalog, index, surface).await,
                        InputAction::ListShells => list_shells(catalog, surface),
                        InputAction::Quit => {
                            bridge.detach(&display);
                            return Ok(());
                        }
                    }
                }
            }
            Some((cols, rows)) = resizes.changed() => {
                bridge.viewport_changed(cols, rows).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    bridge.detach(&display);
    Ok(())
}

async fn switch_shell<W: Write>(
    bridge: &DisplayBridge,
    catalog: &ShellCatalog,
    index: usize,
    surface: &mut TerminalSurface<W>,
) {
    let Some(entry) = catalog.get(index) else {
        surface.notice(&format!("no shell #{}", index + 1));
        return;
    };

    if let Some((cols, rows)) = terminal::host_size() {
        bridge.viewport_changed(cols, rows).await;
    }
    // A failed start reaches the surface through the output hub.
    if let Err(e) = bridge.reload(&entry.path).await {
        warn!("switching to {} failed: {e}", entry.path);
    }
}

fn list_shells<W: Write>(catalog: &ShellCatalog, surface: &mut TerminalSurface<W>) {
    if catalog.is_empty() {
        surface.notice("no shells found");
        return;
    }
    let lines: Vec<String> = catalog
        .iter()
        .enumerate()
        .map(|(i, entry)| format!("  {}) {} ({})", i + 1, entry.name, entry.path))
        .collect();
    surface.notice(&format!("shells:\r\n{}", lines.join("\r\n")));
}
