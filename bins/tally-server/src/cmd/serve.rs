use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tally_engine::{Engine, TallyConfig};

use crate::config::ServeArgs;
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!(config = %args.config, "starting serve");

    // --- Load config ---
    let mut config =
        TallyConfig::load(&args.config).map_err(|e| ServerError::Config(e.to_string()))?;
    if let Some(port) = args.port {
        config.api_port = port;
    }
    tracing::info!(
        config = %args.config,
        file_dir = %config.storage.file_dir.display(),
        access = config.access.enabled,
        "loaded config"
    );

    // --- Engine: buffer, scheduler, archiver, allowlist ---
    let api_port = config.api_port;
    let engine = Arc::new(Engine::new(config)?);
    engine.start();

    // --- API server ---
    let token = CancellationToken::new();
    let api_engine = engine.clone();
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        tally_api_server::run(api_port, api_engine, api_token).await
    });

    tracing::info!("server ready");

    // --- Wait for Ctrl+C or an API failure ---
    let api_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
            token.cancel();
            (&mut api_handle).await
        }
        result = &mut api_handle => result,
    };

    // Stop background tasks; the scheduler drains the buffer on the way out.
    engine.shutdown().await;

    match api_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ServerError::Api(e)),
        Err(e) => return Err(ServerError::Api(format!("api task: {e}"))),
    }

    tracing::info!("shutdown complete");
    Ok(())
}
