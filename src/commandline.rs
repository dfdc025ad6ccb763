use crate::mqtt::MqttConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll the boiler and print each snapshot to stdout.
    Console,
    /// Continuously poll the boiler and publish snapshots to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker.
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: poll the boiler at the configured interval with
    /// the lifetick watchdog active, and forward every snapshot to the
    /// chosen output.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Execute a single poll cycle and print the decoded snapshot.
    Read,

    /// List the resolved register catalog for the configured device.
    /// Resolution runs entirely from the definition documents; no
    /// connection to the boiler is made.
    #[clap(verbatim_doc_comment)]
    Catalog,

    /// Read the firmware version register and compare it against the
    /// version declared in the configuration file.
    ProbeVersion,

    /// Write a value to a register, addressed by its catalog identifier.
    /// The value is interpreted according to the register definition:
    /// a decimal for scaled registers ("55.5"), an enumeration text or
    /// raw code for value-table registers, "on"/"off" for boolean ones.
    /// Writes actuate the boiler; a confirmation prompt is shown unless
    /// --yes is given.
    #[clap(verbatim_doc_comment)]
    Write {
        /// Register identifier, as listed by the `catalog` command.
        id: String,
        /// Target value.
        value: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "KWB heating boiler CLI - poll registers, publish snapshots and write parameters via Modbus TCP/RTU."
}

#[derive(Parser, Debug)]
#[command(name="kwbctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Path to the gateway configuration file (YAML).
    #[arg(global = true, short, long, default_value = "kwbctl.yaml")]
    pub config: PathBuf,

    /// Modbus I/O timeout override for read/write operations.
    /// Examples: "1s", "500ms". Defaults to the configuration file value.
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
