/// Specularium server binary.
///
/// Starts the store, discovery workers, SSE hub, and the HTTP API, then
/// runs until interrupted. Exit code 0 on clean shutdown, non-zero when
/// startup fails.
///
/// Usage:
///   specularium --addr :3000 --db ./specularium.db
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use specularium::adapters::parse_poll_interval;
use specularium::{App, AppConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "specularium", version, about = "Live network model server")]
struct Cli {
    /// Listen address, e.g. `:3000` or `127.0.0.1:8080`
    #[arg(long, default_value = ":3000")]
    addr: String,

    /// Database file path
    #[arg(long, default_value = "./specularium.db")]
    db: PathBuf,

    /// Verifier poll interval, e.g. `30s` or `5m`
    #[arg(long, default_value = "30s")]
    poll_interval: String,

    /// Skip the bootstrap self-discovery at startup
    #[arg(long)]
    no_bootstrap: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    specularium::init_logging();
    let cli = Cli::parse();

    let addr: SocketAddr =
        specularium::parse_listen_addr(&cli.addr).context("invalid --addr")?;
    let poll_interval =
        parse_poll_interval(&cli.poll_interval).context("invalid --poll-interval")?;

    let app = App::start(AppConfig {
        db_path: Some(cli.db.clone()),
        poll_interval,
        bootstrap: !cli.no_bootstrap,
    })
    .await
    .context("failed to start")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let local_addr = listener.local_addr().context("no local address")?;

    println!("{}", "specularium".bold().cyan());
    println!("  listening on {}", local_addr.to_string().green());
    println!("  database     {}", cli.db.display().to_string().green());
    println!("  live events  {}", format!("http://{}/events", local_addr).green());

    let shutdown = app.shutdown_token();
    let serve = axum::serve(
        listener,
        app.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = shutdown.cancelled() => {}
        }
    });

    let result = serve.await;
    println!("{}", "shutting down".yellow());
    app.stop().await;
    result.context("server error")?;
    Ok(())
}
