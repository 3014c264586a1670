//! CLI Entry Point for oshiwasp-daq
//!
//! Provides command-line interface for:
//! - Running one acquisition (`acquire`), optionally gated by the physical buttons
//! - Interactive control from a terminal (`console`)
//! - Managing recorded logs (`logs list`, `logs purge`)
//!
//! # Usage
//!
//! Record with the simulated rig for ten seconds:
//! ```bash
//! oshiwasp-daq acquire --name trial_01 --mock --duration 10s
//! ```
//!
//! Drive a session by hand:
//! ```bash
//! oshiwasp-daq --config config/oshiwasp.toml console --name trial_02 --channels A,C
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oshiwasp_daq::config::{DaqConfig, DEFAULT_CONFIG_PATH};
use oshiwasp_daq::data::LogStore;
use oshiwasp_daq::hardware::capabilities::{DigitalInput, DigitalOutput};
use oshiwasp_daq::hardware::gpio::{PinDirection, SysfsPin};
use oshiwasp_daq::hardware::indicator::IndicatorDriver;
use oshiwasp_daq::hardware::mock::{
    MockDeviceHandle, MockDigitalInput, MockDigitalOutput, MockTelemetryDevice,
};
use oshiwasp_daq::hardware::serial::{open_serial, DynTransport};
use oshiwasp_daq::monitor::wait_for_press;
use oshiwasp_daq::session::orchestrator::DiscreteChannel;
use oshiwasp_daq::session::{AcquisitionSession, ChannelFlags, SessionConfig, SessionHardware};
use oshiwasp_daq::{tracing_setup, DaqError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Poll period for the start/stop buttons.
const BUTTON_POLL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "oshiwasp-daq")]
#[command(about = "Headless acquisition of serial IMU telemetry and GPIO gate events", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one session until Ctrl+C, the stop button, or --duration
    Acquire {
        #[command(flatten)]
        session: SessionArgs,

        /// Stop automatically after this long (e.g. 90s, 5m)
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,

        /// Wait for the start button before recording
        #[arg(long)]
        wait_for_button: bool,
    },

    /// Control a session interactively from stdin
    Console {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Inspect or clear the data directory
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// List recorded logs
    List,
    /// Delete every file in the data directory
    Purge,
}

#[derive(Args)]
struct SessionArgs {
    /// Session name, used as the log file name
    #[arg(long)]
    name: String,

    /// Discrete channels to enable (defaults to those enabled in the config)
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,

    /// Do not stream telemetry from the remote device
    #[arg(long)]
    no_telemetry: bool,

    /// Use simulated hardware instead of the serial port and GPIO
    #[arg(long)]
    mock: bool,
}

impl SessionArgs {
    fn flags(&self, config: &DaqConfig) -> ChannelFlags {
        channel_flags(config, self.channels.as_deref(), !self.no_telemetry)
    }
}

fn channel_flags(config: &DaqConfig, selected: Option<&[String]>, telemetry: bool) -> ChannelFlags {
    let mut flags = config.default_flags();
    flags.telemetry = telemetry;
    if let Some(selected) = selected {
        for channel in &config.channels {
            flags.set(channel.id.clone(), selected.contains(&channel.id));
        }
    }
    flags
}

/// Peripherals that live next to the session.
struct Rig {
    indicator: Option<IndicatorDriver>,
    buttons: Option<(Arc<dyn DigitalInput>, Arc<dyn DigitalInput>)>,
    _simulation: Option<Simulation>,
}

/// Keeps the simulated device alive and wiggles the simulated gates.
struct Simulation {
    _device: MockDeviceHandle,
    toggler: JoinHandle<()>,
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.toggler.abort();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    tracing_setup::init_from_config(&config)?;
    info!(app = %config.application.name, config = %cli.config.display(), "Starting");

    let store = LogStore::new(&config.storage.data_dir, &config.storage.extension);

    match cli.command {
        Commands::Acquire {
            session,
            duration,
            wait_for_button,
        } => acquire(&config, store, session, duration, wait_for_button).await,
        Commands::Console { session } => console(&config, store, session).await,
        Commands::Logs { action } => logs(store, action).await,
    }
}

async fn build_rig(config: &DaqConfig, mock: bool) -> Result<(SessionHardware, Rig)> {
    if mock {
        let (transport, device) = MockTelemetryDevice::default().spawn();
        let inputs: Vec<Arc<MockDigitalInput>> = config
            .channels
            .iter()
            .map(|_| Arc::new(MockDigitalInput::new(false)))
            .collect();
        let channels = config
            .channels
            .iter()
            .zip(&inputs)
            .map(|(def, input)| DiscreteChannel::new(def.id.clone(), input.clone()))
            .collect();
        let indicator = IndicatorDriver::new(
            Arc::new(MockDigitalOutput::new()),
            Arc::new(MockDigitalOutput::new()),
        );
        info!("Using simulated hardware");

        let rig = Rig {
            indicator: Some(indicator),
            buttons: None,
            _simulation: Some(Simulation {
                _device: device,
                toggler: spawn_gate_activity(inputs),
            }),
        };
        return Ok((
            SessionHardware {
                transport,
                channels,
            },
            rig,
        ));
    }

    let transport: DynTransport =
        open_serial(&config.transport.port, config.transport.baud_rate).await?;

    let mut channels = Vec::with_capacity(config.channels.len());
    for def in &config.channels {
        let pin = SysfsPin::open(&def.pin, PinDirection::In)
            .await
            .map_err(|source| DaqError::Capability {
                channel: def.id.clone(),
                source,
            })?;
        channels.push(DiscreteChannel::new(def.id.clone(), Arc::new(pin)));
    }

    let indicator = match &config.indicator {
        Some(leds) => {
            let status: Arc<dyn DigitalOutput> =
                Arc::new(SysfsPin::open(&leds.status_pin, PinDirection::Out).await?);
            let action: Arc<dyn DigitalOutput> =
                Arc::new(SysfsPin::open(&leds.action_pin, PinDirection::Out).await?);
            Some(IndicatorDriver::new(status, action))
        }
        None => None,
    };

    let buttons = match &config.controls {
        Some(controls) => {
            let start: Arc<dyn DigitalInput> =
                Arc::new(SysfsPin::open(&controls.start_pin, PinDirection::In).await?);
            let stop: Arc<dyn DigitalInput> =
                Arc::new(SysfsPin::open(&controls.stop_pin, PinDirection::In).await?);
            Some((start, stop))
        }
        None => None,
    };

    let rig = Rig {
        indicator,
        buttons,
        _simulation: None,
    };
    Ok((
        SessionHardware {
            transport,
            channels,
        },
        rig,
    ))
}

fn spawn_gate_activity(inputs: Vec<Arc<MockDigitalInput>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if inputs.is_empty() {
            return;
        }
        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;
            let gate = &inputs[rng.gen_range(0..inputs.len())];
            gate.set_level(rng.gen_bool(0.5)).await;
        }
    })
}

async fn open_session(
    config: &DaqConfig,
    store: LogStore,
    args: &SessionArgs,
) -> Result<(AcquisitionSession, Rig)> {
    let (hardware, mut rig) = build_rig(config, args.mock).await?;
    let session = AcquisitionSession::configure(
        SessionConfig::new(args.name.clone(), args.flags(config)),
        hardware,
        config.producer_settings(),
        store,
    )
    .await?;

    if let Some(indicator) = rig.indicator.take() {
        tokio::spawn(indicator.run(session.subscribe(), session.subscribe_activity()));
    }
    Ok((session, rig))
}

async fn acquire(
    config: &DaqConfig,
    store: LogStore,
    args: SessionArgs,
    duration: Option<Duration>,
    wait_for_button: bool,
) -> Result<()> {
    let (mut session, rig) = open_session(config, store, &args).await?;

    if wait_for_button {
        match &rig.buttons {
            Some((start, _)) => {
                info!("Waiting for start button");
                wait_for_press(start.as_ref(), BUTTON_POLL).await?;
            }
            None => warn!("No start button configured, starting immediately"),
        }
    }

    session.start().await?;
    info!(log = %session.log_path().display(), "Recording");

    let stop_button = async {
        match &rig.buttons {
            Some((_, stop)) => wait_for_press(stop.as_ref(), BUTTON_POLL).await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let fault = tokio::select! {
        _ = tokio::signal::ctrl_c() => { info!("Interrupted"); None }
        _ = deadline => { info!("Duration elapsed"); None }
        pressed = stop_button => { pressed?; info!("Stop button pressed"); None }
        fault = session.next_fault() => fault,
    };

    if let Some(fault) = fault {
        let fault = session.apply_fault(fault).await;
        println!("{}", serde_json::to_string_pretty(&session.status())?);
        return Err(fault.into());
    }

    session.stop().await?;
    println!("{}", serde_json::to_string_pretty(&session.status())?);
    drop(rig);
    Ok(())
}

enum ConsoleInput {
    Line(Option<String>),
    Fault(DaqError),
}

async fn console(config: &DaqConfig, store: LogStore, args: SessionArgs) -> Result<()> {
    let (mut session, _rig) = open_session(config, store, &args).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    loop {
        let input = tokio::select! {
            line = lines.next_line() => ConsoleInput::Line(line?),
            Some(fault) = session.next_fault() => ConsoleInput::Fault(fault),
        };

        match input {
            ConsoleInput::Fault(fault) => {
                let fault = session.apply_fault(fault).await;
                println!("fault: {} (session is now Error; use `new <name>` to recover)", fault);
            }
            ConsoleInput::Line(None) => break,
            ConsoleInput::Line(Some(line)) => {
                let words: Vec<&str> = line.split_whitespace().collect();
                let Some((command, rest)) = words.split_first() else {
                    continue;
                };
                match run_command(&mut session, config, command, rest).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {}", e),
                }
            }
        }
    }

    if session.current_state().has_producers() {
        session.stop().await?;
    }
    Ok(())
}

/// Returns `Ok(false)` when the console should exit.
async fn run_command(
    session: &mut AcquisitionSession,
    config: &DaqConfig,
    command: &str,
    args: &[&str],
) -> Result<bool> {
    match command {
        "start" => session.start().await?,
        "pause" => session.pause().await?,
        "resume" => session.resume().await?,
        "stop" => session.stop().await?,
        "new" => {
            let (name, channels) = args
                .split_first()
                .context("usage: new <name> [channel ...]")?;
            let selected: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
            let selected = (!selected.is_empty()).then_some(selected);
            let flags = channel_flags(config, selected.as_deref(), session.config().channels.telemetry);
            session
                .reconfigure(SessionConfig::new(name.to_string(), flags))
                .await?;
        }
        "status" => println!("{}", serde_json::to_string_pretty(&session.status())?),
        "test" => {
            for line in session.channel_report().await? {
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        "list" => {
            for name in session.list_logs().await? {
                println!("{}", name);
            }
        }
        "purge" => println!("removed {} entries", session.purge_logs().await?),
        "help" => print_help(),
        "quit" | "exit" => return Ok(false),
        other => println!("unknown command `{}` (try `help`)", other),
    }
    println!("state: {}", session.current_state());
    Ok(true)
}

fn print_help() {
    println!("commands: start | pause | resume | stop | new <name> [channels...]");
    println!("          status | test | list | purge | help | quit");
}

async fn logs(store: LogStore, action: LogsAction) -> Result<()> {
    match action {
        LogsAction::List => {
            for name in store.list().await? {
                println!("{}", name);
            }
        }
        LogsAction::Purge => {
            let removed = store.purge().await?;
            info!(removed, dir = %store.dir().display(), "Data directory purged");
            println!("removed {} entries", removed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_acquire() {
        let cli = Cli::try_parse_from([
            "oshiwasp-daq",
            "acquire",
            "--name",
            "trial",
            "--channels",
            "A,C",
            "--duration",
            "90s",
            "--mock",
        ])
        .unwrap();
        match cli.command {
            Commands::Acquire {
                session, duration, ..
            } => {
                assert_eq!(session.name, "trial");
                assert_eq!(session.channels, Some(vec!["A".to_string(), "C".to_string()]));
                assert!(session.mock);
                assert_eq!(duration, Some(Duration::from_secs(90)));
            }
            _ => panic!("expected acquire"),
        }
    }

    #[test]
    fn test_channel_selection() {
        let config = DaqConfig::default();
        let selected = vec!["B".to_string()];
        let flags = channel_flags(&config, Some(&selected), false);
        assert!(!flags.telemetry);
        assert!(flags.is_enabled("B"));
        assert!(!flags.is_enabled("A"));

        let all = channel_flags(&config, None, true);
        assert!(["A", "B", "C", "D"].iter().all(|id| all.is_enabled(id)));
    }
}
