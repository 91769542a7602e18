use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use flowmaster_core::protocol::FAN_PROFILE_LEN;
use flowmaster_core::{
    CancelToken, FanProfile, FirmwareUpdate, Flowmaster, SerialPortTransport, SerialTransport,
    SessionConfig, SimulatedController,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flowmaster cooling controller tool", long_about = None)]
struct Args {
    /// Serial port (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Application baud rate (overrides the config file)
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Talk to a simulated controller instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the controller answers
    Ping,
    /// Print temperatures, duty cycles and speeds
    Status {
        /// Keep printing until interrupted
        #[arg(short, long)]
        watch: bool,
        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval: u64,
    },
    /// Set actuator duty cycles (0.0 - 1.0)
    Speed {
        #[arg(long)]
        fan: Option<f32>,
        #[arg(long)]
        pump: Option<f32>,
    },
    /// Switch closed-loop control on or off
    Auto { state: Toggle },
    /// Read or write the fan profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Write a message on the controller display
    Message {
        text: String,
        #[arg(long, default_value_t = 0)]
        row: u8,
        #[arg(long, default_value_t = 0)]
        column: u8,
    },
    /// Turn the rotating display pages on or off
    Rotate { state: Toggle },
    /// Reflash the controller from an Intel-HEX image
    Flash {
        file: PathBuf,
        /// Only check the image; never touch the device
        #[arg(long)]
        validate_only: bool,
        /// Also erase the EEPROM
        #[arg(long)]
        erase_eeprom: bool,
        /// Draw progress on the controller display
        #[arg(long)]
        progress: bool,
    },
    /// List serial ports
    Ports,
    /// Write the effective configuration to a TOML file
    SaveConfig { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// Print the profile, one duty cycle per line
    Get,
    /// Upload a profile file with 65 duty cycles, one per line
    Set { file: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    Ok(config.merge(args.port.clone(), args.baud))
}

fn connect(args: &Args, config: &SessionConfig) -> Result<Flowmaster<Box<dyn SerialTransport>>> {
    let transport: Box<dyn SerialTransport> = if args.simulate {
        info!("Using simulated controller");
        Box::new(SimulatedController::new().transport())
    } else {
        Box::new(SerialPortTransport::open(
            &config.port,
            config.baud_rate,
            config.read_timeout(),
        )?)
    };
    Ok(Flowmaster::connect(transport, config)?)
}

fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;

    match &args.command {
        Command::Ports => {
            for port in SerialPortTransport::available_ports() {
                println!("{}", port);
            }
            return Ok(());
        }
        Command::SaveConfig { path } => {
            config.save_to_file(path)?;
            info!(path = %path.display(), "Configuration saved");
            return Ok(());
        }
        Command::Flash {
            file,
            validate_only: true,
            ..
        } => {
            let blocks = FirmwareUpdate::new(&config).validate_file(file)?;
            println!("{}: {} data records, OK", file.display(), blocks);
            return Ok(());
        }
        _ => {}
    }

    let mut device = connect(&args, &config)?;

    match args.command {
        Command::Ping => {
            device.ping()?;
            println!("Controller on {} is responding", config.port);
        }
        Command::Status { watch, interval } => loop {
            let status = device.update_status()?;
            println!("{}\n", status);
            if !watch {
                break;
            }
            thread::sleep(Duration::from_millis(interval));
        },
        Command::Speed { fan, pump } => {
            if fan.is_none() && pump.is_none() {
                bail!("nothing to do: pass --fan and/or --pump");
            }
            if let Some(duty) = fan {
                device.set_fan_speed(duty)?;
                info!(duty, "Fan duty cycle set");
            }
            if let Some(duty) = pump {
                device.set_pump_speed(duty)?;
                info!(duty, "Pump duty cycle set");
            }
        }
        Command::Auto { state } => device.autoregulate(state.enabled())?,
        Command::Profile { action } => match action {
            ProfileAction::Get => {
                for value in device.get_fan_profile()?.values() {
                    println!("{:.4}", value);
                }
            }
            ProfileAction::Set { file } => {
                let profile = read_profile(&file)?;
                device.set_fan_profile(&profile)?;
                info!("Fan profile uploaded");
            }
        },
        Command::Message { text, row, column } => {
            device.set_cursor(row, column)?;
            device.print_message(&text)?;
        }
        Command::Rotate { state } => device.set_display_rotation(state.enabled())?,
        Command::Flash {
            file,
            erase_eeprom,
            progress,
            ..
        } => {
            config.erase_eeprom |= erase_eeprom;
            config.display_progress |= progress;
            if args.simulate {
                warn!("Flashing the simulated controller");
            }
            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                eprintln!("Interrupt received, stopping after the current step...");
                handler_token.cancel();
            })
            .context("installing Ctrl-C handler")?;
            FirmwareUpdate::new(&config)
                .with_cancel_token(cancel)
                .run(&mut device, &file)?;
            println!("Firmware updated from {}", file.display());
        }
        Command::Ports | Command::SaveConfig { .. } => {}
    }

    Ok(())
}

fn read_profile(path: &Path) -> Result<FanProfile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let values = text
        .split_whitespace()
        .map(|v| {
            v.parse::<f32>()
                .with_context(|| format!("bad duty cycle '{}'", v))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != FAN_PROFILE_LEN {
        bail!(
            "{} holds {} values, a profile needs {}",
            path.display(),
            values.len(),
            FAN_PROFILE_LEN
        );
    }
    Ok(FanProfile::new(values)?)
}
