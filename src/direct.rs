//! Direct TCP relay for flows that bypass the tunnel.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{split_host_port, Mode};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial the target directly and splice bytes both ways until either side
/// reaches EOF. The optional first frame is replayed to the target before
/// any spliced bytes.
pub async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    target: &str,
    mode: Mode,
    first_frame: &[u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let addr = complete_target(target, mode);

    let mut upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let _ = writer.write_all(mode.error_response()).await;
            return Err(err).with_context(|| format!("direct dial to {addr} failed"));
        }
        Err(_) => {
            let _ = writer.write_all(mode.error_response()).await;
            anyhow::bail!("direct dial to {addr} timed out");
        }
    };

    if let Some(bytes) = mode.success_response() {
        writer
            .write_all(bytes)
            .await
            .context("failed to send success response downstream")?;
        writer.flush().await.context("failed to flush downstream")?;
    }

    if !first_frame.is_empty() {
        upstream
            .write_all(first_frame)
            .await
            .context("failed to replay first frame to target")?;
    }

    let (mut up_read, mut up_write) = upstream.split();
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut up_write) => {
            debug!(?result, target = %addr, "client-to-target splice ended");
        }
        result = tokio::io::copy(&mut up_read, &mut writer) => {
            debug!(?result, target = %addr, "target-to-client splice ended");
        }
    }
    Ok(())
}

/// Targets arriving without a port get the scheme-typical default.
fn complete_target(target: &str, mode: Mode) -> String {
    if split_host_port(target).is_ok() {
        return target.to_string();
    }
    let port = match mode {
        Mode::HttpConnect | Mode::HttpProxy => 443,
        Mode::Socks5 => 80,
    };
    format!("{target}:{port}")
}
