//! tracklink-cli - Command-line tools for tracklink
//!
//! Decodes captured frames offline, prints acknowledgment frames and drives a
//! simulated terminal against a running server.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use tracklink_protocol::AckKind;

#[derive(Parser)]
#[command(name = "tracklink-cli")]
#[command(about = "Command-line tools for the tracklink ingestion server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode hex-encoded frames to JSON
    Decode {
        /// Frame bytes as hex (whitespace is ignored)
        hex: String,
    },

    /// Print an acknowledgment frame as hex
    Ack {
        /// Acknowledgment kind
        #[arg(value_enum)]
        kind: AckArg,

        /// Serial number to echo
        #[arg(short, long, default_value = "1")]
        serial: u16,

        /// Leave the checksum field zeroed
        #[arg(long)]
        zeroed: bool,
    },

    /// Drive a simulated terminal against a server
    Simulate {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:5023", env = "TRACKLINK_SERVER")]
        server: SocketAddr,

        /// Device identity (16 hex characters)
        #[arg(short, long, default_value = "0123456789abcdef")]
        device: String,

        /// Number of location fixes to send
        #[arg(short, long, default_value = "10")]
        count: u32,

        /// Delay between fixes in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// Starting latitude
        #[arg(long, default_value = "22.5431", allow_hyphen_values = true)]
        lat: f64,

        /// Starting longitude
        #[arg(long, default_value = "114.0579", allow_hyphen_values = true)]
        lon: f64,

        /// Send an SOS alarm after the last fix
        #[arg(long)]
        alarm: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AckArg {
    Login,
    Reject,
    Heartbeat,
    Location,
}

impl From<AckArg> for AckKind {
    fn from(arg: AckArg) -> Self {
        match arg {
            AckArg::Login => AckKind::LoginAccepted,
            AckArg::Reject => AckKind::LoginRejected,
            AckArg::Heartbeat => AckKind::Heartbeat,
            AckArg::Location => AckKind::Location,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode { hex } => commands::decode(&hex),
        Commands::Ack {
            kind,
            serial,
            zeroed,
        } => Ok(commands::ack(kind.into(), serial, zeroed)),
        Commands::Simulate {
            server,
            device,
            count,
            interval_ms,
            lat,
            lon,
            alarm,
        } => {
            let plan = commands::SimulationPlan {
                server,
                device_id: device,
                count,
                interval: std::time::Duration::from_millis(interval_ms),
                start: (lat, lon),
                alarm,
            };
            commands::simulate(plan).await
        }
    };

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
