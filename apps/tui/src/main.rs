//! Flowmaster TUI Application - Terminal User Interface
//!
//! Live telemetry, actuator controls and firmware updates for one
//! controller, with a log viewer.

mod app;
mod event;
mod ui;
mod worker;

use std::io;
use std::panic;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use flowmaster_core::SessionConfig;
use ratatui::prelude::*;
use tracing_subscriber::prelude::*;

use app::App;
use event::{Event, EventHandler};

const LOG_FILE: &str = "flowmaster-tui.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Flowmaster cooling controller monitor", long_about = None)]
struct Args {
    /// Serial port (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Application baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Talk to a simulated controller instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Status refresh interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    }
    .merge(args.port.clone(), args.baud);

    // Setup panic hook to restore terminal on crash
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        original_hook(panic_info);
    }));

    // Log to a file, not stdout, since we're using the terminal
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("opening {}", LOG_FILE))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let terminal = setup_terminal()?;

    let app = App::new(config, args.simulate, Duration::from_millis(args.interval));
    let result = run_app(terminal, app);

    restore_terminal()?;

    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    Ok(())
}

fn run_app(mut terminal: Terminal<CrosstermBackend<io::Stdout>>, mut app: App) -> Result<()> {
    let events = EventHandler::new(Duration::from_millis(250));

    loop {
        terminal.draw(|frame| ui::draw(frame, &app))?;

        match events.next()? {
            Event::Tick => app.on_tick(),
            Event::Key(key) => {
                if app.on_key(key) {
                    break;
                }
            }
            Event::Resize => {}
        }
    }

    // Dropping the app stops the worker and releases the port.
    drop(app);
    Ok(())
}
