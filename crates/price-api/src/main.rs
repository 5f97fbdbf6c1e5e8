use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Price-api serves product price quotes over HTTP, coalescing concurrent
/// lookups of the same product into a single call against the simulated
/// (slow, per-call-billed) vendor pricing API.
#[derive(clap::Parser, Debug)]
struct Args {
    /// Port to listen on for API requests.
    #[clap(long, env = "API_PORT", default_value = "8081")]
    pub api_port: u16,
    /// Port to listen on for Prometheus metrics requests.
    #[clap(long, env = "METRICS_PORT", default_value = "8082")]
    pub metrics_port: u16,
    /// Simulated round-trip latency of one vendor pricing call.
    #[clap(long, env = "VENDOR_LATENCY", default_value = "2s")]
    pub vendor_latency: humantime::Duration,
    /// Disable coalescing of concurrent lookups, so that every request
    /// pays for its own vendor call. Useful for comparing accrued cost
    /// with and without coalescing.
    #[clap(long, env = "NO_COALESCE")]
    pub no_coalesce: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into()) // Otherwise it's ERROR.
        .from_env_lossy();

    // Use reasonable defaults for printing structured logs to stderr.
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    tracing::subscriber::set_global_default(builder.json().finish())
        .expect("setting tracing default failed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(?args, "started!");

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(
    Args {
        api_port,
        metrics_port,
        vendor_latency,
        no_coalesce,
    }: Args,
) -> anyhow::Result<()> {
    let meter = Arc::new(price_api::CostMeter::new());
    let app = Arc::new(price_api::App {
        flights: coalesce::Group::new(),
        vendor: price_api::Vendor::new(meter.clone(), vendor_latency.into()),
        meter,
        no_coalesce,
    });

    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{api_port}"))
        .await
        .context("failed to bind server port")?;
    let metrics_listener = tokio::net::TcpListener::bind(format!("[::]:{metrics_port}"))
        .await
        .context("failed to bind metrics port")?;

    // Share-able future which completes when the server should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let metrics_server_task =
        axum::serve(metrics_listener, price_api::metrics_server::build_router())
            .with_graceful_shutdown(shutdown.clone());
    tokio::spawn(async move { metrics_server_task.await.unwrap() });

    axum::serve(api_listener, price_api::api::build_router(app))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
