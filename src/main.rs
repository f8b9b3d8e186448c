mod config;
mod datasource;
mod direct;
mod dns;
mod ech;
mod http;
mod listener;
mod range_table;
mod router;
mod socks5;
mod sysproxy;
mod tunnel;
mod udp;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::config::{Config, RelayAddr, RoutingMode};
use crate::datasource::{DataSource, FileSource};
use crate::ech::EchProvider;
use crate::listener::Server;
use crate::range_table::RangeTable;
use crate::router::Router;
use crate::sysproxy::{NoopSystemProxy, SystemProxy};
use crate::tunnel::Tunnel;
use crate::udp::DohRelay;

const IPV4_DATASET_FILE: &str = "chn_ip.txt";
const IPV6_DATASET_FILE: &str = "chn_ip_v6.txt";
const IPV4_DATASET_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip.txt";
const IPV6_DATASET_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip_v6.txt";

#[derive(Parser, Debug)]
#[command(name = "echproxy")]
#[command(about = "SOCKS5/HTTP proxy that relays flows over a WebSocket tunnel with TLS 1.3 + ECH")]
struct Args {
    /// TCP bind address for the proxy front-end (SOCKS5 and HTTP)
    #[arg(short, long, default_value = "127.0.0.1:30000")]
    listen: String,

    /// Relay endpoint as host:port[/path], dialed as wss://
    #[arg(short = 'f', long)]
    relay: String,

    /// Dial this IP for the relay while keeping the relay host as SNI
    #[arg(long)]
    relay_ip: Option<IpAddr>,

    /// WebSocket subprotocol token; omit to disable token gating
    #[arg(short, long)]
    token: Option<String>,

    /// DoH endpoint the ECH config list is fetched from
    #[arg(long, default_value = "dns.alidns.com/dns-query")]
    doh: String,

    /// Domain whose HTTPS record carries the ECH config list
    #[arg(long, default_value = "cloudflare-ech.com")]
    ech_domain: String,

    /// Routing mode: none (all direct), global (all tunnel), or
    /// bypass-country (country ranges direct, rest tunnel)
    #[arg(long, value_enum, default_value_t = RoutingMode::Global)]
    routing: RoutingMode,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let relay = RelayAddr::parse(&args.relay)?;
    let config = Config {
        listen_addr: args.listen,
        relay,
        relay_pinned_ip: args.relay_ip,
        token: args.token.filter(|t| !t.is_empty()),
        doh_endpoint: args.doh,
        ech_domain: args.ech_domain,
        routing_mode: args.routing,
    };

    info!(relay = %config.relay.ws_url(), "starting");
    if let Some(ip) = config.relay_pinned_ip {
        info!(%ip, "relay dialed at pinned IP");
    }

    let ech = Arc::new(EchProvider::new(&config.doh_endpoint, &config.ech_domain));
    info!("fetching ECH config list");
    ech.prepare().await.context("initial ECH fetch failed")?;

    let table = Arc::new(RangeTable::new());
    load_country_tables(config.routing_mode, &table).await;

    let mut proxy_state = NoopSystemProxy;
    if let Err(err) = proxy_state.save_state() {
        warn!(%err, "failed to save system proxy state");
    }
    proxy_state
        .enable(&config.listen_addr, config.routing_mode)
        .context("failed to configure system proxy")?;
    spawn_shutdown_handler(proxy_state);

    let router = Router::new(config.routing_mode, table);
    let tunnel = Tunnel::new(&config, ech.clone());
    let doh = Arc::new(DohRelay::new(&config, ech));
    let server = Arc::new(Server::new(config, router, tunnel, doh));
    server.run().await
}

async fn load_country_tables(mode: RoutingMode, table: &RangeTable) {
    match mode {
        RoutingMode::BypassCountry => {
            info!("routing mode: bypass-country, loading country IP ranges");

            let v4 = FileSource::new("IPv4", IPV4_DATASET_FILE, IPV4_DATASET_URL.to_string());
            match v4.sync().await {
                Ok(data) => {
                    let count = table.load_v4(&String::from_utf8_lossy(&data));
                    info!(count, "IPv4 country ranges loaded");
                }
                Err(err) => warn!("failed to load IPv4 ranges: {err:#}"),
            }

            let v6 = FileSource::new("IPv6", IPV6_DATASET_FILE, IPV6_DATASET_URL.to_string());
            match v6.sync().await {
                Ok(data) => {
                    let count = table.load_v6(&String::from_utf8_lossy(&data));
                    info!(count, "IPv6 country ranges loaded");
                }
                Err(err) => warn!("failed to load IPv6 ranges: {err:#}"),
            }

            let (v4_count, v6_count) = table.len();
            if v4_count == 0 && v6_count == 0 {
                warn!("no country ranges loaded; every flow will take the tunnel");
            }
        }
        RoutingMode::Global => info!("routing mode: global, every flow takes the tunnel"),
        RoutingMode::None => info!("routing mode: none, every flow is direct"),
    }
}

fn spawn_shutdown_handler(mut proxy_state: impl SystemProxy + Send + 'static) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutting down, restoring system proxy state");
        if let Err(err) = proxy_state.restore() {
            warn!(%err, "failed to restore system proxy state");
        }
        std::process::exit(0);
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
