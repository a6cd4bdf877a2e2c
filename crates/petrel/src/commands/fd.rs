use std::path::Path;

use petrel_fd::config::{load_config, validate_config, write_default_config};
use petrel_fd::Dispatcher;

pub async fn run(config_path: &Path, init_config: bool) -> anyhow::Result<()> {
    if init_config {
        write_default_config(config_path)?;
        println!("wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let config = load_config(config_path)?;
    validate_config(&config)?;

    let dispatcher = Dispatcher::start(config)?;
    dispatcher
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
