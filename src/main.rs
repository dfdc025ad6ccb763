//! KWB Heating CLI
//!
//! A command-line interface for KWB heating boilers (Easyfire, Combifire,
//! CF family) speaking Modbus TCP or RTU.
//!
//! This tool allows users to:
//! - Resolve and inspect the register catalog for a configured boiler
//!   (model, firmware version, equipment, access level).
//! - Execute a single poll cycle and print the decoded snapshot.
//! - Write parameters by register identifier, with range and access-level
//!   mediation.
//! - Probe the firmware version register of the connected boiler.
//! - Run in a continuous daemon mode that polls the boiler, keeps the
//!   lifetick watchdog alive and prints snapshots to the console or
//!   publishes them to an MQTT broker.
//!
//! The CLI leverages the `kwb_heating_lib` crate for catalog resolution,
//! batching, transport and poll coordination.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, panic};

use kwb_heating_lib::batch::BatchPlanner;
use kwb_heating_lib::catalog::{Catalog, DefinitionSource};
use kwb_heating_lib::client::{run_lifetick, ModbusClient, Transport};
use kwb_heating_lib::config::GatewayConfig;
use kwb_heating_lib::poll::{PollCoordinator, RegisterSnapshot};
use kwb_heating_lib::protocol::{DataType, ReadClass, RegisterDefinition, Value, ValueSpec};

mod commandline;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Malformed configuration file {}", path.display()))
}

fn data_type_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::U16 => "u16",
        DataType::S16 => "s16",
        DataType::U32 => "u32",
        DataType::S32 => "s32",
    }
}

fn print_catalog(catalog: &Catalog) {
    println!("Resolved catalog: {} registers", catalog.len());
    for definition in catalog.registers() {
        let access = if definition.writable { "rw" } else { "r-" };
        let spec = match &definition.value_spec {
            ValueSpec::Raw => String::new(),
            ValueSpec::Scaled { divisor: 1, unit } => format!(" [{unit}]"),
            ValueSpec::Scaled { divisor, unit } => format!(" [1/{divisor}{unit}]"),
            ValueSpec::Table(name) => format!(" [{name}]"),
        };
        println!(
            "  {:<5}  {}  {}  {}{}",
            definition.address,
            data_type_name(definition.data_type),
            access,
            definition.id,
            spec
        );
    }
}

fn print_snapshot(catalog: &Catalog, snapshot: &RegisterSnapshot) {
    let stale = snapshot.iter().filter(|(_, e)| e.stale).count();
    println!(
        "Snapshot cycle {} ({} registers, {} stale):",
        snapshot.cycle,
        snapshot.len(),
        stale
    );
    for (id, entry) in snapshot.iter() {
        let unit = catalog
            .get(id)
            .and_then(|d| d.value_spec.unit())
            .unwrap_or("");
        let marker = if entry.stale { " [stale]" } else { "" };
        println!("  {id}: {}{unit} (raw {}){marker}", entry.value, entry.raw);
    }
}

/// Interpret a command-line value string according to the register kind.
fn parse_target(definition: &RegisterDefinition, catalog: &Catalog, input: &str) -> Result<Value> {
    match &definition.value_spec {
        ValueSpec::Table(name) => {
            let table = catalog
                .tables()
                .get(name)
                .with_context(|| format!("Value table '{name}' is not defined"))?;
            if table.as_boolean().is_some() {
                return match input.to_lowercase().as_str() {
                    "on" | "true" | "1" => Ok(Value::Bool(true)),
                    "off" | "false" | "0" => Ok(Value::Bool(false)),
                    other => bail!("'{other}' is not a boolean value (expected on/off)"),
                };
            }
            if let Ok(code) = input.parse::<i64>() {
                return Ok(Value::Integer(code));
            }
            Ok(Value::Text(input.to_string()))
        }
        ValueSpec::Scaled { divisor, .. } if *divisor > 1 => Ok(Value::Decimal(
            input
                .parse::<f64>()
                .with_context(|| format!("'{input}' is not a decimal value"))?,
        )),
        _ => Ok(Value::Integer(input.parse::<i64>().with_context(|| {
            format!("'{input}' is not an integer value")
        })?)),
    }
}

async fn handle_write(
    coordinator: &PollCoordinator<ModbusClient>,
    id: &str,
    value: &str,
    yes: bool,
) -> Result<()> {
    let definition = coordinator
        .catalog()
        .get(id)
        .with_context(|| format!("Register '{id}' is not part of the resolved catalog"))?;
    let target = parse_target(definition, coordinator.catalog(), value)?;

    println!(
        "About to write {target} to '{}' (register {}, {}).",
        definition.name,
        definition.address,
        data_type_name(definition.data_type)
    );
    if !yes
        && !Confirm::new()
            .with_prompt("Apply this change to the boiler?")
            .default(false)
            .show_default(true)
            .interact()?
    {
        info!("Write aborted by user.");
        return Ok(());
    }

    coordinator
        .write(id, &target)
        .await
        .with_context(|| format!("Failed to write register '{id}'"))?;
    println!("Register '{id}' set to {target} successfully.");
    Ok(())
}

async fn handle_probe_version(
    coordinator: &PollCoordinator<ModbusClient>,
    client: &ModbusClient,
    config: &GatewayConfig,
) -> Result<()> {
    let Some(address) = coordinator.catalog().version_register() else {
        bail!("The definition documents declare no firmware version register.");
    };
    let words = client
        .read_block(ReadClass::Input, address, 1)
        .await
        .with_context(|| format!("Cannot read version register {address}"))?;
    let raw = words[0];
    println!("Firmware version register {address}: {raw}");

    // The register carries the major version number.
    let declared_major: Option<u16> = config
        .device
        .firmware_version
        .split('.')
        .next()
        .and_then(|major| major.parse().ok());
    match declared_major {
        Some(major) if major == raw => {
            println!("Matches configured firmware version {}.", config.device.firmware_version);
        }
        Some(_) => {
            warn!(
                "Configured firmware version {} does not match the device's major version {raw}",
                config.device.firmware_version
            );
            println!(
                "WARNING: configured version {} differs from the device ({raw}).",
                config.device.firmware_version
            );
        }
        None => {}
    }
    Ok(())
}

async fn run_daemon(
    coordinator: Arc<PollCoordinator<ModbusClient>>,
    client: Arc<ModbusClient>,
    poll_interval: Duration,
    output: &commandline::DaemonOutput,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={poll_interval:?}");
    let cancel = coordinator.cancel_token();

    let publisher = match output {
        commandline::DaemonOutput::Console => None,
        commandline::DaemonOutput::Mqtt { config_file } => {
            let config = mqtt::MqttConfig::load(Path::new(config_file))?;
            Some(mqtt::Publisher::connect(config).await?)
        }
    };

    let poll_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };
    let watchdog_task = tokio::spawn(run_lifetick(client, cancel.clone()));

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_cycle = 0;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.with_context(|| "Error waiting for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = interval.tick() => {
                let snapshot = coordinator.snapshot();
                if snapshot.cycle == 0 || snapshot.cycle == last_cycle {
                    continue;
                }
                last_cycle = snapshot.cycle;
                match &publisher {
                    Some(publisher) => publisher.publish_snapshot(&snapshot).await?,
                    None => print_snapshot(coordinator.catalog(), &snapshot),
                }
            }
        }
    }

    cancel.cancel();
    let _ = poll_task.await;
    let _ = watchdog_task.await;
    if let Some(publisher) = publisher {
        publisher.shutdown().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "kwbctl started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let mut config = load_config(&args.config)?;
    if let Some(timeout) = args.timeout {
        config.modbus.timeout = timeout;
    }
    let catalog = DefinitionSource::open(&config.definitions_dir)
        .build(&config.device.catalog_request())
        .with_context(|| {
            format!(
                "Cannot resolve register catalog for model '{}', firmware {}",
                config.device.model, config.device.firmware_version
            )
        })?;

    // The catalog command needs no connection.
    if args.command == commandline::CliCommands::Catalog {
        print_catalog(&catalog);
        return Ok(());
    }

    let client = Arc::new(ModbusClient::new(config.modbus.clone()));
    client
        .ensure_connected()
        .await
        .with_context(|| format!("Cannot connect to {}", config.modbus.endpoint))?;

    let planner = BatchPlanner::new(config.batch.max_block_size, config.batch.gap_tolerance);
    let coordinator = Arc::new(PollCoordinator::new(
        catalog,
        &planner,
        client.clone(),
        config.poll_interval,
    ));

    match &args.command {
        commandline::CliCommands::Daemon { output } => {
            run_daemon(coordinator, client, config.poll_interval, output).await?;
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read snapshot");
            coordinator.poll_once().await;
            print_snapshot(coordinator.catalog(), &coordinator.snapshot());
        }
        commandline::CliCommands::ProbeVersion => {
            info!("Executing: Probe firmware version");
            handle_probe_version(&coordinator, &client, &config).await?;
        }
        commandline::CliCommands::Write { id, value, yes } => {
            info!("Executing: Write {value} to {id}");
            handle_write(&coordinator, id, value, *yes).await?;
        }
        commandline::CliCommands::Catalog => unreachable!("handled earlier"),
    }

    Ok(())
}
