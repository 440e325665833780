//! rpc-snooper: intercepting, observing reverse proxy for JSON-RPC
//! traffic between an Ethereum consensus client and an execution client.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use snooper_core::events::EventsService;
use snooper_proxy::builtin::EventsModule;
use snooper_proxy::cli::Cli;
use snooper_proxy::metrics::SnooperMetrics;
use snooper_proxy::proxy::{Snooper, SnooperOptions};
use snooper_proxy::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color)
        .init();

    info!(version = snooper_core::build_version(), "initializing rpc-snooper");

    let Some(target) = cli.target.clone() else {
        error!("Target URL missing (provide as argument or set SNOOPER_TARGET env var)");
        std::process::exit(1);
    };

    info!(target = %target, "target url");

    // Metrics registry, shared by the traffic recorder and the scrape
    // endpoint; only materialized when the metrics listener is enabled.
    let mut metrics_handle = None;
    let mut metrics_registry = None;
    if cli.metrics_port > 0 {
        let mut registry = Registry::default();
        metrics_handle = Some(Arc::new(SnooperMetrics::new(&mut registry)));
        metrics_registry = Some(Arc::new(registry));
    }

    // Event pipeline; inert unless enabled. Config errors abort startup.
    let events_config = cli.events_config();
    let events = match EventsService::new(events_config, &target) {
        Ok(events) => Arc::new(events),
        Err(err) => {
            error!(error = %err, "invalid event pipeline configuration");
            std::process::exit(1);
        }
    };

    let snooper = Snooper::new(
        &target,
        SnooperOptions {
            call_timeout: Duration::from_secs(60),
            color: !cli.no_color,
            metrics: metrics_handle,
            ..Default::default()
        },
    )?;

    // Wire the event pipeline into module dispatch.
    if let Some(router) = events.router() {
        let manager = snooper.modules();
        let module_id = manager.next_module_id();
        manager.register(Arc::new(EventsModule::new(module_id, router)), None);
        info!(module_id, "event pipeline module registered");
    }

    events.start().await?;

    let shutdown = snooper.shutdown_token();

    // Ctrl-C / SIGTERM initiate shutdown.
    {
        let snooper = snooper.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        error!(error = %err, "failed to install SIGTERM handler");
                        return;
                    }
                };

                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }

            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("received interrupt, shutting down");
            }

            snooper.shutdown();
        });
    }

    // Standalone API server.
    if cli.api_port > 0 {
        let auth = cli
            .api_auth
            .as_deref()
            .and_then(snooper_proxy::api::ApiAuth::parse);
        let api_snooper = snooper.clone();
        let api_bind = cli.api_bind.clone();
        let api_port = cli.api_port;
        let api_shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(err) =
                server::run_api_server(api_snooper, &api_bind, api_port, auth, api_shutdown).await
            {
                error!(error = %err, "API server error");
            }
        });
    }

    // Metrics server.
    if let Some(registry) = metrics_registry {
        let metrics_bind = cli.metrics_bind.clone();
        let metrics_port = cli.metrics_port;
        let metrics_shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(err) =
                server::run_metrics_server(registry, &metrics_bind, metrics_port, metrics_shutdown)
                    .await
            {
                error!(error = %err, "metrics server error");
            }
        });
    }

    // Main proxy listener; runs until shutdown.
    let result = server::run_proxy_server(
        snooper.clone(),
        &cli.bind_address,
        cli.port,
        !cli.no_api,
        shutdown,
    )
    .await;

    events.stop(Duration::from_secs(5)).await.ok();

    result?;

    Ok(())
}
