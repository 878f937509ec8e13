mod cache;
mod dns_header;
mod dns_message;
mod dns_question_and_answer;
mod error;
mod forwarder;
mod server;
mod snapshot;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use cache::Cache;
use forwarder::UdpUpstream;
use server::DnsServer;

#[derive(Parser, Debug)]
#[command(name = "dns-cache-forwarder")]
#[command(about = "Caching DNS forwarder")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    local_address: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 55555)]
    local_port: u16,

    /// Upstream DNS resolver address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))]
    remote_address: IpAddr,

    /// Upstream DNS resolver port
    #[arg(long, default_value_t = 53)]
    remote_port: u16,

    /// Cache snapshot read at startup and written at shutdown
    #[arg(long, default_value = "dns_cache.json")]
    cache_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let log_level = level.parse().unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_max_level(log_level)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let bind_addr = SocketAddr::new(args.local_address, args.local_port);
    let resolver_addr = SocketAddr::new(args.remote_address, args.remote_port);

    let cache = snapshot::load(&args.cache_file, Cache::new());
    let upstream = UdpUpstream::new(resolver_addr);

    let server = DnsServer::bind(bind_addr, cache, upstream)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;

    info!(
        "Running on {}, forwarding to {}",
        server.local_addr()?,
        server.upstream().resolver_addr()
    );

    let cache = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(e) = snapshot::save(&args.cache_file, &cache) {
        error!("Failed to save cache snapshot to {}: {}", args.cache_file.display(), e);
    }

    Ok(())
}
