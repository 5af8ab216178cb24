use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkha", version, about = "Active/standby failover controller")]
pub struct Cli {
    /// Path to the controller configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}
