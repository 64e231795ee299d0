use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyport::metrics::{self, Metrics, MetricsSink};
use keyport::proxy::server::Server;

#[derive(Parser)]
#[command(
    name = "keyport",
    version,
    about = "Multi-tenant Shadowsocks AEAD proxy server"
)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: String,

    /// Expose Prometheus metrics over HTTP on this address
    #[arg(long)]
    metrics: Option<SocketAddr>,

    /// UDP session idle timeout (e.g. "300s", "5m")
    #[arg(long = "udptimeout", default_value = "5m", value_parser = parse_duration)]
    udp_timeout: Duration,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (value, unit) = s.split_at(s.len() - 1);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit in '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("keyport starting");

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = cli.metrics {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {}", addr))?;
        tokio::spawn(metrics::http::serve(listener, metrics.clone()));
    }

    let sink: Arc<dyn MetricsSink> = metrics;
    let mut server = Server::new(sink, cli.udp_timeout);
    server.run(&cli.config).await
}
