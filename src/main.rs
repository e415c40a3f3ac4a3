use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use psu_bridge::{
    cli, device::tenma::TenmaOpener, logging, server, session::SessionManager,
    settings::SettingsStore,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    logging::init().await;

    let cli = cli::Cli::parse();

    let settings = SettingsStore::new(&cli.settings);
    let opener = Arc::new(TenmaOpener::new().set_baud(cli.baud));

    let session = SessionManager::new(settings, opener)?;

    // Startup is allowed to fail here: the supply may be off or
    // unplugged. Callers reconnect through the API when it is back.
    match session.connect().await {
        Ok(how) => info!(?how, "Connected to the supply"),
        Err(e) => warn!(%e, "Could not connect at startup"),
    }

    let addr = SocketAddr::from((cli.host, cli.port));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = server::run_on_addr(session, addr) => {
            error!("Server returned")
        }
    }

    Ok(())
}
