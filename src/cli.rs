use std::{net::IpAddr, path::PathBuf};

use clap::Parser;

/// The command line interface for the PSU bridge.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Address to serve on.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to serve on.
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Path to the settings file. Created with defaults if missing.
    #[arg(short, long, default_value = "psu-bridge.ron")]
    pub settings: PathBuf,

    /// Baud rate of the supply's serial link.
    #[arg(short, long, default_value_t = 9_600)]
    pub baud: u32,
}
