//! WebSocket tunnel to the relay: dial with ECH retry, the CONNECT control
//! handshake, and the bidirectional forwarding session.
//!
//! Control frames are WebSocket text messages (`CONNECT`/`CONNECTED`/
//! `ERROR:`/`CLOSE`); payload travels as binary messages. The relay may also
//! forward upstream bytes as text frames, so any text other than the control
//! vocabulary is passed downstream verbatim.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, Mode, RelayAddr};
use crate::ech::EchProvider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const READ_BUF_SIZE: usize = 32 * 1024;
/// Total dial attempts; the second only happens after an ECH-related
/// failure and a config refresh.
const DIAL_ATTEMPTS: u32 = 2;

pub struct Tunnel {
    relay: RelayAddr,
    pinned_ip: Option<IpAddr>,
    token: Option<String>,
    ech: Arc<EchProvider>,
}

impl Tunnel {
    pub fn new(config: &Config, ech: Arc<EchProvider>) -> Self {
        Self {
            relay: config.relay.clone(),
            pinned_ip: config.relay_pinned_ip,
            token: config.token.clone(),
            ech,
        }
    }

    /// Run one tunneled flow end to end: dial, CONNECT handshake, success
    /// response downstream, then bidirectional forwarding until either side
    /// ends the session.
    ///
    /// Returns an error only for dial/handshake failures; the mode-specific
    /// error response has already been written downstream in that case.
    pub async fn run<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        target: &str,
        mode: Mode,
        first_frame: &[u8],
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ws = match self.dial().await {
            Ok(ws) => ws,
            Err(err) => {
                let _ = writer.write_all(mode.error_response()).await;
                return Err(err);
            }
        };

        let (sink, mut stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        // ── CONNECT handshake ────────────────────────────────────────────
        let frame = connect_frame(target, mode, first_frame);
        if let Err(err) = sink.lock().await.send(Message::Text(frame)).await {
            let _ = writer.write_all(mode.error_response()).await;
            return Err(err).context("failed to send CONNECT frame");
        }

        match read_handshake_reply(&mut stream).await {
            Ok(()) => {}
            Err(err) => {
                let _ = writer.write_all(mode.error_response()).await;
                return Err(err);
            }
        }

        if let Some(bytes) = mode.success_response() {
            writer
                .write_all(bytes)
                .await
                .context("failed to send success response downstream")?;
            writer.flush().await.context("failed to flush downstream")?;
        }

        // ── Forwarding: three cooperating tasks ──────────────────────────
        let cancel = CancellationToken::new();

        let keepalive = tokio::spawn(keepalive_task(sink.clone(), cancel.clone()));

        let cancel_up = cancel.clone();
        let sink_up = sink.clone();
        let upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_up.cancelled() => break,
                    result = reader.read(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => {
                                let _ = sink_up
                                    .lock()
                                    .await
                                    .send(Message::Text("CLOSE".to_string()))
                                    .await;
                                break;
                            }
                            Ok(n) => {
                                if sink_up
                                    .lock()
                                    .await
                                    .send(Message::Binary(buf[..n].to_vec()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            cancel_up.cancel();
        });

        let cancel_down = cancel.clone();
        let downstream = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel_down.cancelled() => break,
                    message = stream.next() => message,
                };
                let payload = match message {
                    Some(Ok(Message::Text(text))) => {
                        if text == "CLOSE" {
                            break;
                        }
                        // Upstream bytes the relay forwarded as text.
                        text.into_bytes()
                    }
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Ok(Message::Frame(_))) => break,
                    Some(Err(err)) => {
                        debug!(%err, "websocket read ended");
                        break;
                    }
                    None => break,
                };
                if writer.write_all(&payload).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            cancel_down.cancel();
        });

        let _ = tokio::join!(keepalive, upstream, downstream);
        Ok(())
    }

    /// Dial the relay over TLS 1.3 + ECH. An ECH-related failure triggers
    /// one refresh-and-retry; anything else surfaces immediately.
    async fn dial(&self) -> Result<WsStream> {
        let url = self.relay.ws_url();
        let mut last_err = None;

        for attempt in 1..=DIAL_ATTEMPTS {
            let raw = match self.ech.get() {
                Ok(raw) => raw,
                Err(err) if attempt < DIAL_ATTEMPTS => {
                    let _ = self.ech.refresh().await;
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let tls = self.ech.build_tls(&raw)?;

            match self.dial_once(&url, tls).await {
                Ok(ws) => return Ok(ws),
                Err(err) if attempt < DIAL_ATTEMPTS && is_ech_error(&err) => {
                    warn!(%err, attempt, "relay dial hit an ECH error, refreshing config");
                    let _ = self.ech.refresh().await;
                    sleep(Duration::from_secs(1)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("relay dial attempts exhausted")))
    }

    async fn dial_once(&self, url: &str, tls: rustls::ClientConfig) -> Result<WsStream> {
        let mut request = url
            .into_client_request()
            .context("invalid relay websocket URL")?;
        if let Some(token) = &self.token {
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(token).context("token is not a valid header value")?,
            );
        }

        // A pinned IP changes where the TCP connection goes, never the SNI:
        // the TLS layer keeps using the relay host from the request URL.
        let stream = match self.pinned_ip {
            Some(ip) => {
                let addr = SocketAddr::new(ip, self.relay.port);
                timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await
            }
            None => {
                timeout(
                    HANDSHAKE_TIMEOUT,
                    TcpStream::connect((self.relay.host.as_str(), self.relay.port)),
                )
                .await
            }
        }
        .context("TCP connect to relay timed out")?
        .context("TCP connect to relay failed")?;
        stream.set_nodelay(true).ok();

        let connector = Connector::Rustls(Arc::new(tls));
        let (ws, _) = timeout(
            HANDSHAKE_TIMEOUT,
            client_async_tls_with_config(request, stream, None, Some(connector)),
        )
        .await
        .context("websocket handshake timed out")?
        .context("websocket handshake failed")?;
        Ok(ws)
    }
}

/// Await the relay's answer to our CONNECT frame, skipping protocol-level
/// ping/pong noise.
async fn read_handshake_reply(stream: &mut SplitStream<WsStream>) -> Result<()> {
    loop {
        let message = stream
            .next()
            .await
            .context("relay closed before answering CONNECT")?
            .context("websocket error while awaiting CONNECT reply")?;
        match message {
            Message::Text(text) => {
                if text == "CONNECTED" {
                    return Ok(());
                }
                if let Some(reason) = text.strip_prefix("ERROR:") {
                    bail!("relay refused connection: {reason}");
                }
                bail!("unexpected relay response: {text:?}");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => bail!("unexpected relay frame during handshake: {other:?}"),
        }
    }
}

async fn keepalive_task(sink: WsSink, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if sink.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Compose the CONNECT control frame. SOCKS5 first frames are opaque bytes
/// and always ride the `base64:` channel; HTTP first frames are request text
/// and ship literally unless they fail UTF-8 (the relay decodes the prefix
/// for any mode).
fn connect_frame(target: &str, mode: Mode, first_frame: &[u8]) -> String {
    let payload = match mode {
        Mode::Socks5 => format!("base64:{}", BASE64.encode(first_frame)),
        Mode::HttpConnect | Mode::HttpProxy => match std::str::from_utf8(first_frame) {
            Ok(text) => text.to_string(),
            Err(_) => format!("base64:{}", BASE64.encode(first_frame)),
        },
    };
    format!("CONNECT:{target}|{payload}")
}

/// Whether a dial failure warrants an ECH refresh. The TLS library's ECH
/// errors render with an `Ech`/`ECH` token; matching on it here keeps the
/// classification independent of the exact error nesting.
fn is_ech_error(err: &anyhow::Error) -> bool {
    let mut rendered = format!("{err:#}");
    if let Some(root) = err.chain().last() {
        rendered.push_str(&format!(" {root:?}"));
    }
    rendered.contains("ECH") || rendered.contains("Ech")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_connect_frame_is_base64_even_when_empty() {
        assert_eq!(
            connect_frame("93.184.216.34:443", Mode::Socks5, b""),
            "CONNECT:93.184.216.34:443|base64:"
        );
        assert_eq!(
            connect_frame("example.com:443", Mode::Socks5, b"\x16\x03\x01"),
            format!("CONNECT:example.com:443|base64:{}", BASE64.encode(b"\x16\x03\x01"))
        );
    }

    #[test]
    fn ipv6_target_composes_bracketed() {
        assert_eq!(
            connect_frame(
                "[2606:2800:220:1:248:1893:25c8:1946]:443",
                Mode::Socks5,
                b""
            ),
            "CONNECT:[2606:2800:220:1:248:1893:25c8:1946]:443|base64:"
        );
    }

    #[test]
    fn http_connect_frame_ships_literal_text() {
        assert_eq!(
            connect_frame("example.com:443", Mode::HttpConnect, b""),
            "CONNECT:example.com:443|"
        );
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            connect_frame("example.com:80", Mode::HttpProxy, request),
            format!(
                "CONNECT:example.com:80|{}",
                std::str::from_utf8(request).unwrap()
            )
        );
    }

    #[test]
    fn non_utf8_http_body_falls_back_to_base64() {
        let frame = connect_frame("example.com:80", Mode::HttpProxy, b"POST / \xff\xfe");
        assert_eq!(
            frame,
            format!("CONNECT:example.com:80|base64:{}", BASE64.encode(b"POST / \xff\xfe"))
        );
    }

    #[test]
    fn ech_errors_are_recognized_across_the_chain() {
        assert!(is_ech_error(&anyhow!("tls handshake: ECH rejected by peer")));
        let nested = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "RejectedEch { retry_configs: None }",
        ))
        .context("websocket handshake failed");
        assert!(is_ech_error(&nested));
        assert!(!is_ech_error(&anyhow!("connection refused")));
    }
}
