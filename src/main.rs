use anyhow::Context;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    solar_dashboard_sync_lib::init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    solar_dashboard_sync_lib::run(config_path.as_deref())
        .await
        .context("dashboard session failed")
}
