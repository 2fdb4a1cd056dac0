//! Provisioning service: HTTP API plus dispatcher and prefill worker in one
//! process, over the in-memory broker and store.

use std::sync::Arc;

use provisioning_rust::api::http;
use provisioning_rust::{telemetry, Config, PrefillSources, Provisioning, Realm, StaticObjectSource};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    telemetry::init(&config.log_level);

    // The directory listing is an external collaborator; without one the
    // prefill enumerates nothing.
    let sources =
        PrefillSources::new().with_source(Realm::Udm, Arc::new(StaticObjectSource::new()));
    let provisioning = Provisioning::in_memory(config.clone(), sources)?;
    provisioning.init_streams().await?;

    let dispatcher = provisioning.spawn_dispatcher();
    let prefill = provisioning.spawn_prefill_worker();

    let shutdown = CancellationToken::new();
    let server = {
        let shutdown = shutdown.clone();
        let state = provisioning.app_state();
        let addr = config.http_addr.clone();
        tokio::spawn(async move {
            http::serve(state, &addr, async move { shutdown.cancelled().await }).await
        })
    };
    info!(addr = %config.http_addr, mode = %config.prefill_mode, "provisioning service started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        () = dispatcher.finished() => error!("dispatcher exited"),
        () = prefill.finished() => error!("prefill worker exited"),
    }
    shutdown.cancel();

    let mut failed = false;
    match dispatcher.stop().await {
        Ok(stats) => info!(?stats, "dispatcher stopped"),
        Err(err) => {
            error!(error = %err, "dispatcher failed");
            failed = true;
        }
    }
    match prefill.stop().await {
        Ok(stats) => info!(?stats, "prefill worker stopped"),
        Err(err) => {
            error!(error = %err, "prefill worker failed");
            failed = true;
        }
    }
    server.await??;

    if failed {
        return Err("a background worker failed".into());
    }
    Ok(())
}
