//! Payment machine server
//!
//! Binds the durable payment state machine and its watcher side-car on a
//! Restate HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use restate_sdk::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use restate_machines::{
    MachineOptions, MachineRegistry, MachineWatcherObject, MachineWatcherObjectImpl,
    StateMachineObject, StateMachineObjectImpl, WatchUntil, WatcherConfig,
};

mod machine;

use machine::{PaymentMachine, AUTHORIZE_EVENT};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,restate_machines=debug,restate_sdk=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting payment machine server");

    let port = std::env::var("PAYMENT_SERVER_PORT")
        .unwrap_or_else(|_| "9080".to_string())
        .parse::<u16>()
        .context("Invalid PAYMENT_SERVER_PORT")?;

    let final_state_ttl = std::env::var("FINAL_STATE_TTL_SECS")
        .ok()
        .map(|raw| raw.parse::<u64>().context("Invalid FINAL_STATE_TTL_SECS"))
        .transpose()?
        .map(Duration::from_secs);

    let registry = Arc::new(MachineRegistry::new(Arc::new(PaymentMachine)));
    let mut options = MachineOptions::default();
    if let Some(ttl) = final_state_ttl {
        options.final_state_ttl = Some(ttl);
    }
    let watcher_config = WatcherConfig::new()
        .rule(AUTHORIZE_EVENT, WatchUntil::Final)
        .poll_interval(Duration::from_millis(500))
        .timeout(Duration::from_secs(120));

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Payment machine server listening on {}", addr);

    let endpoint = Endpoint::builder()
        .bind(StateMachineObjectImpl::with_options(registry, options).serve())
        .bind(MachineWatcherObjectImpl::new(watcher_config).serve())
        .build();

    HttpServer::new(endpoint)
        .listen_and_serve(addr.parse()?)
        .await;

    Ok(())
}
