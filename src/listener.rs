//! TCP accept loop, protocol classification, and per-connection dispatch.
//!
//! Each accepted connection is classified by its first byte: `0x05` is
//! SOCKS5, an HTTP method initial is HTTP, anything else is dropped
//! silently. The classifier byte is replayed in front of the HTTP parser.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{split_host_port, Config, Mode};
use crate::direct;
use crate::http;
use crate::router::Router;
use crate::socks5;
use crate::tunnel::Tunnel;
use crate::udp::{self, DohRelay};

/// Deadline for classifying and parsing a request; forwarding is not
/// time-limited.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

pub struct Server {
    config: Config,
    router: Router,
    tunnel: Tunnel,
    doh: Arc<DohRelay>,
}

impl Server {
    pub fn new(config: Config, router: Router, tunnel: Tunnel, doh: Arc<DohRelay>) -> Self {
        Self {
            config,
            router,
            tunnel,
            doh,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        info!(
            listen_addr = %self.config.listen_addr,
            "proxy listening (SOCKS5 and HTTP)"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream, peer).await {
                            if is_normal_close(&err) {
                                debug!("connection from {peer} closed: {err:#}");
                            } else {
                                error!("connection from {peer} failed: {err:#}");
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();

        let first = timeout(HANDSHAKE_DEADLINE, read_half.read_u8())
            .await
            .context("classifier read timed out")?
            .context("classifier read failed")?;

        match first {
            0x05 => {
                let request = timeout(
                    HANDSHAKE_DEADLINE,
                    socks5::read_request(&mut read_half, &mut write_half),
                )
                .await
                .context("SOCKS5 handshake timed out")??;
                match request {
                    socks5::Request::Connect { target } => {
                        info!(%peer, %target, "SOCKS5 connect");
                        self.route(read_half, write_half, peer, &target, Mode::Socks5, &[])
                            .await
                    }
                    socks5::Request::UdpAssociate => {
                        udp::run_associate(read_half, write_half, peer, self.doh.clone()).await
                    }
                    socks5::Request::Rejected => Ok(()),
                }
            }
            b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => {
                let mut reader = BufReader::new(Cursor::new(vec![first]).chain(read_half));
                let request = timeout(
                    HANDSHAKE_DEADLINE,
                    http::read_request(&mut reader, &mut write_half),
                )
                .await
                .context("HTTP parse timed out")??;
                match request {
                    http::Request::Tunnel {
                        target,
                        mode,
                        first_frame,
                    } => {
                        info!(%peer, %target, ?mode, "HTTP request");
                        self.route(reader, write_half, peer, &target, mode, &first_frame)
                            .await
                    }
                    http::Request::Rejected => Ok(()),
                }
            }
            other => {
                debug!("unknown protocol byte 0x{other:02x} from {peer}, dropping");
                Ok(())
            }
        }
    }

    async fn route<R, W>(
        &self,
        reader: R,
        writer: W,
        peer: SocketAddr,
        target: &str,
        mode: Mode,
        first_frame: &[u8],
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let host = target_host(target);
        if self.router.should_bypass(host).await {
            info!(%peer, %target, "direct path");
            let result = direct::relay(reader, writer, target, mode, first_frame).await;
            info!(%peer, %target, "direct path closed");
            result
        } else {
            info!(%peer, %target, "tunnel path");
            let result = self
                .tunnel
                .run(reader, writer, target, mode, first_frame)
                .await;
            info!(%peer, %target, "tunnel path closed");
            result
        }
    }
}

fn target_host(target: &str) -> &str {
    match split_host_port(target) {
        Ok((host, _)) => host,
        Err(_) => target,
    }
}

/// Peer-close noise that should not be reported as an error: EOF, broken
/// pipe, resets, writes on an already-closed socket, and clean WebSocket
/// closure.
pub fn is_normal_close(err: &anyhow::Error) -> bool {
    use std::io::ErrorKind;
    use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};

    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io_err.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
            ) {
                return true;
            }
        }
        if let Some(ws_err) = cause.downcast_ref::<WsError>() {
            if matches!(
                ws_err,
                WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            ) {
                return true;
            }
        }
    }
    false
}
