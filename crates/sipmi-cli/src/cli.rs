//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use sipmi_events::TransportKind;
use sipmi_mi::ConnectorKind;

/// sipmi - SIP server management interface client
#[derive(Debug, Parser)]
#[command(name = "sipmi")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "SIPMI_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// How to reach the management interface. Unset flags fall back to the
/// configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Management interface transport
    #[arg(long = "type", short = 't', env = "SIPMI_TYPE", value_enum, global = true)]
    pub kind: Option<MiType>,

    /// Server IP address (http and datagram)
    #[arg(long, short = 'i', env = "SIPMI_IP", global = true)]
    pub ip: Option<String>,

    /// Server port (http and datagram)
    #[arg(long, short = 'p', env = "SIPMI_PORT", global = true)]
    pub port: Option<u16>,

    /// Request FIFO of the server
    #[arg(long, env = "SIPMI_FIFO_FILE", global = true)]
    pub fifo_file: Option<PathBuf>,

    /// Request FIFO used when --fifo-file does not exist
    #[arg(long, env = "SIPMI_FIFO_FALLBACK", global = true)]
    pub fifo_fallback: Option<PathBuf>,

    /// Directory for reply FIFOs
    #[arg(long, env = "SIPMI_FIFO_REPLY_DIR", global = true)]
    pub fifo_reply_dir: Option<PathBuf>,

    /// Reply timeout in seconds
    #[arg(long, env = "SIPMI_TIMEOUT", global = true)]
    pub timeout: Option<f64>,
}

/// Management interface transport selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MiType {
    Fifo,
    Http,
    Datagram,
}

impl From<MiType> for ConnectorKind {
    fn from(kind: MiType) -> Self {
        match kind {
            MiType::Fifo => Self::Fifo,
            MiType::Http => Self::Http,
            MiType::Datagram => Self::Datagram,
        }
    }
}

/// Transport the server pushes events over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTransport {
    #[default]
    Datagram,
    Stream,
}

impl From<EventTransport> for TransportKind {
    fn from(transport: EventTransport) -> Self {
        match transport {
            EventTransport::Datagram => Self::Datagram,
            EventTransport::Stream => Self::Stream,
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a management command and print its result
    Mi(MiArgs),

    /// Subscribe to an event and print every occurrence
    Event(EventArgs),

    /// Check that the management interface is reachable
    Check,

    /// Shell completion helper
    Complete {
        #[command(subcommand)]
        target: CompleteTarget,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Clone, Args)]
pub struct MiArgs {
    /// Command to run
    #[arg(required_unless_present = "stats")]
    pub command: Option<String>,

    /// Positional command parameters
    #[arg(conflicts_with = "json")]
    pub params: Vec<String>,

    /// Command parameters as a JSON object or array
    #[arg(long, short)]
    pub json: Option<String>,

    /// Fetch these statistics with get_statistics
    #[arg(long, short, num_args = 1.., conflicts_with = "command")]
    pub stats: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct EventArgs {
    /// Event name
    pub event: String,

    /// Transport the server pushes events over
    #[arg(long, short = 'T', value_enum)]
    pub transport: Option<EventTransport>,

    /// Local address to receive events on
    #[arg(long)]
    pub listen_ip: Option<String>,

    /// Local port to receive events on (0 picks one)
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Stop listening after this many seconds
    #[arg(long, short)]
    pub expire: Option<u64>,
}

/// Which command to complete.
#[derive(Debug, Clone, Subcommand)]
pub enum CompleteTarget {
    /// Options of `sipmi mi` and the server's commands
    Mi {
        /// Option to list the choices of, without dashes
        word: Option<String>,
    },
    /// Options of `sipmi event` and the server's events
    Event {
        /// Option to list the choices of, without dashes
        word: Option<String>,
    },
}

/// Configuration subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Dump,
    /// Print the configuration file path
    Path,
}
