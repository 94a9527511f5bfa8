use anyhow::{Context, Result};
use std::{future::Future, sync::Arc};

#[macro_use]
mod macros;

mod config;
mod mail;
mod relay;
mod rules;
mod smtp;
mod spool;
mod transform;
mod util;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = config::load()?;
    config.rules.validate().context("invalid rules")?;
    if config.rules.is_empty() {
        log::info!("no rules configured, mail will be relayed unchanged");
    }

    let version = transform::Transformer::new(&config.crypto.tool)
        .version()
        .await
        .with_context(|| format!("S/MIME tool {} is not usable", config.crypto.tool.display()))?;
    log::info!("using S/MIME tool {}: {version}", config.crypto.tool.display());
    let config = Arc::new(config);

    let spool = Arc::new(spool::Spool::open(&config.spool).await?);
    let recovered = spool.recover().await?;
    if recovered > 0 {
        log::warn!("{recovered} mail(s) left pending by a previous run moved to unsent storage");
    }

    let relay = Arc::new(relay::Relay::new(config.clone(), spool.clone()));

    let smtp = try_spawn(smtp::server::start(config, spool, relay.clone()));
    let retry = try_spawn(relay.retry_service());

    tokio::try_join!(smtp, retry)?;

    Ok(())
}

async fn try_spawn(fut: impl Future<Output = Result<()>> + Send + 'static) -> Result<()> {
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(err) => match err.try_into_panic() {
            Ok(payload) => std::panic::resume_unwind(payload),
            Err(_) => Ok(()),
        },
    }
}
