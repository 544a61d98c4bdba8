//! Terminal dashboard for live OBD2 telemetry
//!
//! Connects to an ELM327-compatible adapter, starts the acquisition engine
//! and prints the latest values on a timer. The on-demand diagnostic
//! commands are available as subcommands.
//!
//! Usage: cargo run -p obdwatch-dashboard -- [OPTIONS] [COMMAND]

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use obdwatch_engine::{
    Answer, ConnectionHealth, Elm327Channel, Engine, LogLevel, ParameterRegistry, Snapshot,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "obdwatch")]
#[command(about = "Live OBD2 telemetry and diagnostics")]
struct Args {
    /// Adapter address (overrides the config file)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug (overrides the config file)
    #[arg(long, global = true, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Poll and print live values (default)
    Watch {
        /// Seconds between printouts (defaults to the configured poll interval)
        #[arg(short, long)]
        interval: Option<f64>,

        /// Stop after this many seconds (0 = run until interrupted)
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// Print each snapshot as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Adapter connection and monitor status
    Status,
    /// Read stored trouble codes
    Codes,
    /// Trouble code that triggered the freeze frame
    Freeze,
    /// Fuel system status
    Fuel,
    /// Clear stored trouble codes
    Clear,
    /// List supported mode 01 PIDs
    Supported,
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown log level {s:?}"))
}

fn format_value(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.1}{unit}"),
        None => "--".to_string(),
    }
}

fn print_snapshot(snapshot: &Snapshot, health: ConnectionHealth) {
    let fields: Vec<String> = snapshot
        .iter()
        .map(|(id, value)| format!("{id}={}", format_value(value, id.unit())))
        .collect();
    let marker = match health {
        ConnectionHealth::Healthy => "",
        ConnectionHealth::Degraded => " [DEGRADED]",
    };
    println!("[cycle {}]{marker} {}", snapshot.cycles, fields.join(" "));
}

fn run_watch(
    engine: &Engine,
    interval: Duration,
    duration: Option<Duration>,
    json: bool,
) -> Result<()> {
    engine.start().context("Failed to start acquisition")?;

    let start = Instant::now();
    loop {
        std::thread::sleep(interval);

        let snapshot = engine.current_values();
        if json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else {
            print_snapshot(&snapshot, engine.health());
        }
        std::io::stdout().flush().ok();

        if let Some(d) = duration {
            if start.elapsed() >= d {
                break;
            }
        }
    }

    engine.stop().context("Failed to stop acquisition")?;
    Ok(())
}

fn print_answer<T>(label: &str, answer: Answer<T>, show: impl FnOnce(T)) {
    match answer {
        Answer::Value(value) => show(value),
        Answer::NoData => println!("{label}: No data"),
    }
}

fn run_command(engine: &Engine, command: &Cmd) -> Result<()> {
    match command {
        Cmd::Watch { .. } => bail!("watch is not a one-shot command"),
        Cmd::Status => {
            let device = engine.device_status()?;
            println!("Connection: {}", device.status);
            if let Some(address) = &device.address {
                println!("Address:    {address}");
            }
            if let Some(protocol) = &device.protocol {
                println!("Protocol:   {} ({})", protocol.name, protocol.id);
            }
            print_answer("Status", engine.get_status()?, |status| {
                println!("MIL:        {}", if status.mil { "ON" } else { "off" });
                println!("DTC count:  {}", status.dtc_count);
                println!("Ignition:   {:?}", status.ignition);
                for test in status.tests.iter().filter(|t| t.available) {
                    let state = if test.complete { "complete" } else { "incomplete" };
                    println!("  {:<22} {state}", test.name);
                }
            });
        }
        Cmd::Codes => print_answer("Trouble codes", engine.read_fault_codes()?, |codes| {
            if codes.is_empty() {
                println!("No stored trouble codes");
            }
            for code in codes {
                println!("{code}");
            }
        }),
        Cmd::Freeze => print_answer("Freeze frame", engine.get_freeze_frame()?, |dtc| {
            println!("Freeze frame DTC: {dtc}");
        }),
        Cmd::Fuel => print_answer("Fuel status", engine.get_fuel_status()?, |fuel| {
            if let Some(state) = fuel.system1 {
                println!("Fuel system 1: {state}");
            }
            if let Some(state) = fuel.system2 {
                println!("Fuel system 2: {state}");
            }
        }),
        Cmd::Clear => {
            if engine.clear_fault_codes() {
                println!("DTCs cleared successfully!");
            } else {
                bail!("Failed to clear DTCs");
            }
        }
        Cmd::Supported => {
            let pids = engine.supported_pids()?;
            let list: Vec<String> = pids.iter().map(|pid| format!("{pid:02X}")).collect();
            println!("Supported PIDs: {}", list.join(" "));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = args.config.as_deref().map(|path| (path, Config::load(path)));
    let mut config = match &loaded {
        Some((_, Ok(config))) => config.clone(),
        _ => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // RUST_LOG wins over the configured level
    let default_filter = config.log_level.as_level_filter().to_string();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match &loaded {
        Some((path, Ok(_))) => info!("Loaded config from {}", path.display()),
        Some((path, Err(e))) => {
            warn!("Failed to load config from {}: {e:#}, using defaults", path.display());
        }
        None => debug!("No config file given, using defaults"),
    }
    config.validate();
    info!("Log level set to {:?}", config.log_level);

    let adapter = Elm327Channel::tcp(
        config.dongle.address.clone(),
        Duration::from_millis(config.dongle.timeout_ms),
    );
    let engine = Engine::connect(adapter, ParameterRegistry::standard(), config.engine.clone())
        .with_context(|| format!("Failed to connect to {}", config.dongle.address))?;

    let command = args.command.unwrap_or(Cmd::Watch {
        interval: None,
        duration: 0,
        json: false,
    });

    let result = match &command {
        Cmd::Watch {
            interval,
            duration,
            json,
        } => {
            let interval = match interval {
                Some(secs) if *secs > 0.0 => Duration::from_secs_f64(*secs),
                Some(secs) => bail!("Interval must be positive, got {secs}"),
                None => Duration::from_millis(config.poll_interval_ms),
            };
            let duration = (*duration > 0).then(|| Duration::from_secs(*duration));
            run_watch(&engine, interval, duration, *json)
        }
        other => run_command(&engine, other),
    };

    if let Err(e) = &result {
        warn!("{e:#}");
    }
    engine.shutdown();
    result
}
