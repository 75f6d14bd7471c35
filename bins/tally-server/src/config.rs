use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tally-server", about = "Buffered daily statistics log")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the statistics server
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "TALLY_CONFIG")]
    pub config: String,

    /// Override `api_port` from the config file
    #[arg(long)]
    pub port: Option<u16>,
}
