//! System-proxy collaborator interface.
//!
//! The OS-specific mechanics (registry writes, `networksetup`, `gsettings`)
//! live behind this trait; the core only asks to point the system proxy at
//! its listener and to restore the prior state on exit.

use anyhow::Result;
use tracing::info;

use crate::config::RoutingMode;

pub trait SystemProxy {
    /// Capture the current system proxy state so it can be restored later.
    fn save_state(&mut self) -> Result<()>;

    /// Point the system proxy at `listen_addr`. Skipped entirely in
    /// `RoutingMode::None` (the listener still runs, but nothing is routed
    /// through it implicitly).
    fn enable(&mut self, listen_addr: &str, mode: RoutingMode) -> Result<()>;

    /// Restore the state captured by `save_state`.
    fn restore(&mut self) -> Result<()>;
}

/// Placeholder implementation that only records intent in the log.
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn save_state(&mut self) -> Result<()> {
        Ok(())
    }

    fn enable(&mut self, listen_addr: &str, mode: RoutingMode) -> Result<()> {
        if matches!(mode, RoutingMode::None) {
            info!("routing mode is none, leaving system proxy untouched");
            return Ok(());
        }
        info!(listen_addr, "system proxy configuration left to the platform layer");
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        info!("restoring prior system proxy state");
        Ok(())
    }
}
