mod sigtun;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "sigtun",
    version,
    about = "sigtun - SOCKS5 tunnel bootstrapped through an HTTP signal relay"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the local SOCKS5 side.
    Client {
        /// Path to config file (.toml/.yaml/.yml). If omitted, uses SIGTUN_CONFIG; then auto-detects sigtun-client.yaml > sigtun-client.yml > sigtun-client.toml from CWD.
        #[arg(long, env = "SIGTUN_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
    /// Run the signal relay and the exit node.
    Server {
        /// Path to config file (.toml/.yaml/.yml). If omitted, uses SIGTUN_CONFIG; then auto-detects sigtun-server.yaml > sigtun-server.yml > sigtun-server.toml from CWD.
        #[arg(long, env = "SIGTUN_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Client { config } => sigtun::run_client(config).await,
        Command::Server { config } => sigtun::run_server(config).await,
    }
}
