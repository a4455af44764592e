use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use homefix_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    homefix_observability::init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOMEFIX_CONFIG").map(PathBuf::from));
    let settings = Settings::load(config_path.as_deref())?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    homefix_worker::run(settings, shutdown).await
}
