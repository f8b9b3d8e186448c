//! Per-target routing decision: direct path or relay tunnel.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::RoutingMode;
use crate::range_table::RangeTable;

pub struct Router {
    mode: RoutingMode,
    table: Arc<RangeTable>,
}

impl Router {
    pub fn new(mode: RoutingMode, table: Arc<RangeTable>) -> Self {
        Self { mode, table }
    }

    /// Whether `host` should be dialed directly instead of tunneled.
    ///
    /// In bypass-country mode a hostname bypasses when any resolved address
    /// is in-country; resolution failure routes through the tunnel so names
    /// the local resolver cannot answer never leak onto the direct path.
    pub async fn should_bypass(&self, host: &str) -> bool {
        match self.mode {
            RoutingMode::None => true,
            RoutingMode::Global => false,
            RoutingMode::BypassCountry => {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return self.table.contains(ip);
                }
                match tokio::net::lookup_host((host, 0u16)).await {
                    Ok(mut addrs) => addrs.any(|addr| self.table.contains(addr.ip())),
                    Err(_) => false,
                }
            }
        }
    }
}
