use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

/// How flows are routed once the front-end has produced a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoutingMode {
    /// Every flow takes the direct path; the tunnel is never used.
    None,
    /// Every flow goes through the relay tunnel.
    Global,
    /// Flows to the configured country's IP ranges go direct, the rest tunnel.
    BypassCountry,
}

/// Which downstream success/error framing a flow uses.
///
/// `HttpProxy` never sends a synthesized success: the relayed upstream
/// response is the success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Socks5,
    HttpConnect,
    HttpProxy,
}

const SOCKS5_SUCCESS: &[u8] = &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const SOCKS5_FAILURE: &[u8] = &[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const HTTP_CONNECT_SUCCESS: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const HTTP_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

impl Mode {
    /// Bytes to send downstream once the upstream is established, if any.
    pub fn success_response(self) -> Option<&'static [u8]> {
        match self {
            Mode::Socks5 => Some(SOCKS5_SUCCESS),
            Mode::HttpConnect => Some(HTTP_CONNECT_SUCCESS),
            Mode::HttpProxy => None,
        }
    }

    /// Bytes to send downstream when the upstream could not be reached.
    pub fn error_response(self) -> &'static [u8] {
        match self {
            Mode::Socks5 => SOCKS5_FAILURE,
            Mode::HttpConnect | Mode::HttpProxy => HTTP_BAD_GATEWAY,
        }
    }
}

/// The relay endpoint, parsed from the `host:port[/path]` flag form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RelayAddr {
    /// Parse `host:port[/path]`. The port is mandatory; the path defaults
    /// to `/`. IPv6 hosts use the bracketed form `[::1]:443`.
    pub fn parse(addr: &str) -> Result<Self> {
        let (authority, path) = match addr.find('/') {
            Some(idx) => (&addr[..idx], addr[idx..].to_string()),
            None => (addr, "/".to_string()),
        };

        let (host, port) = split_host_port(authority)
            .with_context(|| format!("invalid relay address {addr:?}, expected host:port[/path]"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }

    /// The WebSocket URL this relay is dialed at.
    pub fn ws_url(&self) -> String {
        if self.host.contains(':') {
            format!("wss://[{}]:{}{}", self.host, self.port, self.path)
        } else {
            format!("wss://{}:{}{}", self.host, self.port, self.path)
        }
    }
}

/// Split `host:port`, unwrapping IPv6 brackets from the host part.
pub fn split_host_port(authority: &str) -> Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest
            .find(']')
            .context("missing closing bracket in IPv6 authority")?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .context("missing port after IPv6 host")?;
        (&rest[..end], port)
    } else {
        authority
            .rsplit_once(':')
            .context("missing port in authority")?
    };

    if host.is_empty() {
        bail!("empty host in authority");
    }
    let port: u16 = port.parse().context("invalid port number")?;
    Ok((host, port))
}

/// Everything the core needs to run, assembled from the CLI in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub relay: RelayAddr,
    pub relay_pinned_ip: Option<IpAddr>,
    pub token: Option<String>,
    pub doh_endpoint: String,
    pub ech_domain: String,
    pub routing_mode: RoutingMode,
}
