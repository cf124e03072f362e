pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod signal;
pub mod socks;
pub mod telemetry;
pub mod tunnel;

pub async fn run_client(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run_client(config_path).await
}

pub async fn run_server(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run_server(config_path).await
}
