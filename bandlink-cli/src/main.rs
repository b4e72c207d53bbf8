use anyhow::{Context, Result, anyhow};
use bandlink_lib::codec::Alarm;
use bandlink_lib::sim::SimulatedBand;
use bandlink_lib::transport::Radio;
use bandlink_lib::{BandClient, BandConfig, DeviceRegistry, HardwareAddress, JsonFileRegistry, PairedDevice, SessionState};
use chrono::{Local, Weekday};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Address of the band `--simulate` talks to
const SIM_ADDRESS: HardwareAddress = HardwareAddress::new([0xC8, 0x0F, 0x10, 0x80, 0xD2, 0x41]);

/// Pair with and control a BLE fitness band.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// JSON file overriding timeouts and measurement tuning
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding paired_bands.json (default: the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Talk to an in-process simulated band instead of the Bluetooth adapter
    #[arg(long, global = true)]
    simulate: bool,
    /// Key the simulated band is provisioned with when it has not been paired yet
    #[arg(long, global = true, default_value = "0102030405060708090a0b0c0d0e0f10")]
    sim_key: String,
    /// How long the Bluetooth discovery scan runs, in seconds
    #[arg(long, global = true, default_value = "5")]
    scan_secs: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List paired bands
    Devices,
    /// Discover a band and store it with its auth key
    Pair {
        /// 32 hex characters
        #[arg(short, long)]
        key: String,
        /// Defaults to the name the band advertises
        #[arg(short, long, default_value = "")]
        nickname: String,
    },
    /// Disconnect, revoke and delete a paired band
    Remove { device: String },
    /// Show device information, battery and today's activity
    Info { device: String },
    /// Set the band clock to local time
    SyncTime { device: String },
    /// Make the band vibrate
    Find { device: String },
    /// Set the daily step goal
    Goal {
        device: String,
        #[arg(short, long)]
        steps: u32,
        /// Vibrate when the goal is reached
        #[arg(long)]
        notify: bool,
    },
    /// Replace every alarm on the band
    Alarm {
        device: String,
        /// HH:MM, optionally followed by @mon,tue,...; repeat up to five times, omit to clear
        #[arg(short, long = "set")]
        alarms: Vec<String>,
    },
    /// Take one heart-rate measurement
    HeartRate { device: String },
    /// Stream heart rate until Ctrl+C or the duration elapses
    Monitor {
        device: String,
        /// Seconds to stream for
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v; RUST_LOG still wins per target
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = dispatch(cli).await {
        error!("{e:#}");
        process::exit(1);
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BandConfig::from_json_file(path).with_context(|| format!("Failed to load config {path:?}"))?,
        None => BandConfig::default(),
    };
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .ok_or_else(|| anyhow!("no platform data directory, pass --data-dir"))?
            .join("bandlink"),
    };
    let registry = Arc::new(JsonFileRegistry::open(&data_dir)?);

    if cli.simulate {
        let band = simulated_band(registry.as_ref(), &cli.sim_key)?;
        return run(BandClient::new(band, registry, config)?, cli.command).await;
    }
    hardware(cli.command, registry, config, cli.scan_secs).await
}

#[cfg(feature = "ble")]
async fn hardware(command: Command, registry: Arc<JsonFileRegistry>, config: BandConfig, scan_secs: u64) -> Result<()> {
    let radio = bandlink_lib::ble::BtleRadio::new(Duration::from_secs(scan_secs)).await?;
    run(BandClient::new(radio, registry, config)?, command).await
}

#[cfg(not(feature = "ble"))]
async fn hardware(_command: Command, _registry: Arc<JsonFileRegistry>, _config: BandConfig, _scan_secs: u64) -> Result<()> {
    anyhow::bail!("built without Bluetooth support; rebuild with `--features ble` or pass --simulate")
}

/// A band that remembers being paired: once a record for it exists, it is
/// provisioned with that record's key and already authorized
fn simulated_band(registry: &JsonFileRegistry, sim_key: &str) -> Result<SimulatedBand> {
    let paired = registry
        .list()?
        .into_iter()
        .find(|device| device.hardware_address == SIM_ADDRESS);
    let key = match &paired {
        Some(device) => device.auth_key.clone(),
        None => sim_key.parse().context("invalid --sim-key")?,
    };
    let band = SimulatedBand::new(SIM_ADDRESS, &key);
    band.set_authorized(paired.is_some());
    band.set_heart_rate_script(vec![0, 0, 68, 74, 71, 70, 72], Duration::from_millis(800));
    Ok(band)
}

async fn run<R: Radio>(client: BandClient<R>, command: Command) -> Result<()> {
    match command {
        Command::Devices => list_devices(client.registry().as_ref()),
        Command::Pair { key, nickname } => {
            let device = client.pair(&nickname, &key).await?;
            println!("Paired '{}' ({}) as #{}", device.nickname, device.hardware_address, device.id);
            Ok(())
        }
        Command::Remove { device } => {
            let device = find_device(client.registry().as_ref(), &device)?;
            client.forget(&device).await?;
            println!("Removed '{}'", device.nickname);
            Ok(())
        }
        Command::Info { device } => {
            connect(&client, &device).await?;
            let result = show_info(&client).await;
            client.disconnect().await;
            result
        }
        Command::SyncTime { device } => {
            connect(&client, &device).await?;
            let now = Local::now().naive_local();
            let result = client.set_current_time(&now).await;
            client.disconnect().await;
            result?;
            println!("Band clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
            Ok(())
        }
        Command::Find { device } => {
            connect(&client, &device).await?;
            let result = client.send_find_me_alert().await;
            client.disconnect().await;
            Ok(result?)
        }
        Command::Goal { device, steps, notify } => {
            let device = connect(&client, &device).await?;
            let result = client.save_goal_settings(&device, steps, notify).await;
            client.disconnect().await;
            result?;
            println!("Goal set to {steps} steps (notification {})", on_off(notify));
            Ok(())
        }
        Command::Alarm { device, alarms } => {
            let alarms = alarms.iter().map(|text| parse_alarm(text)).collect::<Result<Vec<_>>>()?;
            let device = connect(&client, &device).await?;
            let result = client.save_alarms(&device, &alarms).await;
            client.disconnect().await;
            result?;
            println!("{} alarm(s) saved", alarms.len());
            Ok(())
        }
        Command::HeartRate { device } => {
            connect(&client, &device).await?;
            println!("Measuring, keep the band on your wrist...");
            let result = client
                .measure_heart_rate_once(|reading| println!("  ... {} bpm", reading.bpm))
                .await;
            client.disconnect().await;
            let reading = result?;
            println!("Heart rate: {} bpm", reading.bpm);
            Ok(())
        }
        Command::Monitor { device, duration } => {
            connect(&client, &device).await?;
            let result = monitor(&client, duration.map(Duration::from_secs)).await;
            client.disconnect().await;
            result
        }
    }
}

fn list_devices(registry: &dyn DeviceRegistry) -> Result<()> {
    let devices = registry.list()?;
    if devices.is_empty() {
        println!("No paired bands. Use `bandlink pair --key <HEX>` to add one.");
        return Ok(());
    }
    println!("{:<4} {:<20} {:<18} {:<10} {:<7} Added", "ID", "Nickname", "Address", "Goal", "Alarms");
    for device in devices {
        println!(
            "{:<4} {:<20} {:<18} {:<10} {:<7} {}",
            device.id,
            device.nickname,
            device.hardware_address.to_string(),
            device.activity_goal,
            device.alarms.len(),
            device.date_added.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Match a band by id, nickname or hardware address
fn find_device(registry: &dyn DeviceRegistry, selector: &str) -> Result<PairedDevice> {
    let devices = registry.list()?;
    let address = selector.parse::<HardwareAddress>().ok();
    let id = selector.parse::<u64>().ok();
    devices
        .into_iter()
        .find(|device| {
            Some(device.id) == id
                || Some(device.hardware_address) == address
                || device.nickname.eq_ignore_ascii_case(selector)
        })
        .ok_or_else(|| anyhow!("no paired band matches '{selector}', see `bandlink devices`"))
}

async fn connect<R: Radio>(client: &BandClient<R>, selector: &str) -> Result<PairedDevice> {
    let device = find_device(client.registry().as_ref(), selector)?;
    info!(nickname = %device.nickname, address = %device.hardware_address, "Connecting...");
    client
        .connect(&device, |state: SessionState| info!("  {state}"))
        .await
        .with_context(|| format!("Failed to connect to '{}'", device.nickname))?;
    Ok(device)
}

async fn show_info<R: Radio>(client: &BandClient<R>) -> Result<()> {
    let info = client.get_device_info().await?;
    let battery = client.get_battery_level().await?;
    let status = client.get_current_status().await?;
    let time = client.get_current_time().await?;

    println!("Device:");
    println!("  Hardware: {}", info.hardware_revision);
    println!("  Firmware: {}", info.firmware_version);
    println!(
        "  PnP ID:   vendor {:#06x} (source {}), product {:#06x} v{}",
        info.vendor_id, info.vendor_id_source, info.product_id, info.product_version
    );
    println!("Battery:");
    println!("  Level:    {}%{}", battery.level, if battery.is_charging { " (charging)" } else { "" });
    match battery.last_charge {
        Some(at) => println!("  Charged:  {} (to {}%)", at.format("%Y-%m-%d %H:%M"), battery.last_level),
        None => println!("  Charged:  never"),
    }
    println!("Today:");
    println!("  Steps:    {}", status.steps);
    println!("  Distance: {} m", status.meters);
    println!("  Calories: {} kcal", status.calories);
    println!("Band clock: {}", time.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

async fn monitor<R: Radio>(client: &BandClient<R>, duration: Option<Duration>) -> Result<()> {
    let stream = client
        .start_continuous_heart_rate(|reading| {
            println!("{}  {:>3} bpm", reading.timestamp.with_timezone(&Local).format("%H:%M:%S"), reading.bpm)
        })
        .await?;
    println!("Streaming heart rate, Ctrl+C to stop");

    let mut state = client.subscribe_state();
    let limit = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = limit => info!("Monitoring time elapsed"),
        _ = state.wait_for(|state| *state != SessionState::Authenticated) => {
            warn!("Session ended while streaming");
        }
    }

    stream.stop().await?;
    Ok(())
}

/// `HH:MM` or `HH:MM@mon,wed,fri`
fn parse_alarm(text: &str) -> Result<Alarm> {
    let (time, days) = match text.split_once('@') {
        Some((time, days)) => (time, Some(days)),
        None => (text, None),
    };
    let (hour, minute) = time
        .split_once(':')
        .ok_or_else(|| anyhow!("alarm '{text}' must look like HH:MM"))?;
    let mut alarm = Alarm::new(
        hour.trim().parse().with_context(|| format!("bad hour in '{text}'"))?,
        minute.trim().parse().with_context(|| format!("bad minute in '{text}'"))?,
    );
    if let Some(days) = days {
        let days = days
            .split(',')
            .map(|day| day.trim().parse::<Weekday>().map_err(|_| anyhow!("unknown weekday '{day}' in '{text}'")))
            .collect::<Result<Vec<_>>>()?;
        alarm = alarm.repeating_on(&days);
    }
    alarm.validate()?;
    Ok(alarm)
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
