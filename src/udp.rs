//! SOCKS5 UDP ASSOCIATE relay.
//!
//! Only DNS-over-UDP is carried: datagrams to port 53 are unwrapped and
//! POSTed to the DoH endpoint over the ECH-protected channel, everything
//! else is dropped. The TCP association is the lifetime anchor; its first
//! read result of any kind tears the UDP socket down.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dns;
use crate::ech::{EchProvider, DOH_PROXY_HOST};

const UDP_BUF_SIZE: usize = 65535;
const SOCKS5_GENERAL_FAILURE: &[u8] = &[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// DoH transport for relayed DNS queries, reached on the relay's port with
/// the ECH-bearing TLS config and the optional pinned IP.
pub struct DohRelay {
    url: String,
    port: u16,
    pinned_ip: Option<IpAddr>,
    ech: Arc<EchProvider>,
}

impl DohRelay {
    pub fn new(config: &Config, ech: Arc<EchProvider>) -> Self {
        Self {
            url: format!("https://{}:{}/dns-query", DOH_PROXY_HOST, config.relay.port),
            port: config.relay.port,
            pinned_ip: config.relay_pinned_ip,
            ech,
        }
    }

    pub async fn query(&self, dns_query: Vec<u8>) -> Result<Vec<u8>> {
        let tls = self.ech.tls_for_doh()?;
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(dns::DOH_TIMEOUT)
            .no_proxy();
        if let Some(ip) = self.pinned_ip {
            builder = builder.resolve(DOH_PROXY_HOST, SocketAddr::new(ip, self.port));
        }
        let client = builder.build().context("failed to build DoH client")?;
        dns::post_wire_query(&client, &self.url, dns_query).await
    }
}

/// Serve one UDP ASSOCIATE: bind a local UDP socket, answer the SOCKS5
/// reply with the bound port, relay DNS datagrams until the TCP side of the
/// association yields anything (data, EOF, or error).
pub async fn run_associate<R, W>(
    mut reader: R,
    mut writer: W,
    client_addr: SocketAddr,
    doh: Arc<DohRelay>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let socket = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            warn!(%client_addr, %err, "UDP associate bind failed");
            let _ = writer.write_all(SOCKS5_GENERAL_FAILURE).await;
            return Ok(());
        }
    };
    let port = socket
        .local_addr()
        .context("UDP socket has no local address")?
        .port();

    info!(%client_addr, port, "UDP associate established");

    let mut reply = vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    reply.extend_from_slice(&port.to_be_bytes());
    writer
        .write_all(&reply)
        .await
        .context("failed to send UDP associate reply")?;
    writer.flush().await.context("failed to flush downstream")?;

    let cancel = CancellationToken::new();
    let relay = tokio::spawn(relay_loop(socket, doh, client_addr, cancel.clone()));

    // Lifetime anchor: any read outcome on the TCP side ends the
    // association.
    let mut anchor = [0u8; 1];
    let _ = reader.read(&mut anchor).await;

    cancel.cancel();
    let _ = relay.await;
    info!(%client_addr, "UDP associate closed");
    Ok(())
}

async fn relay_loop(
    socket: Arc<UdpSocket>,
    doh: Arc<DohRelay>,
    client_addr: SocketAddr,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(err) => {
                    debug!(%err, "UDP receive failed");
                    return;
                }
            },
        };

        let datagram = &buf[..len];
        let Some(packet) = parse_datagram(datagram) else {
            continue;
        };

        if packet.port != 53 {
            debug!(%client_addr, host = %packet.host, port = packet.port,
                "dropping non-DNS UDP datagram");
            continue;
        }

        debug!(%client_addr, host = %packet.host, "relaying DNS query over DoH");
        let header = datagram[..packet.header_len].to_vec();
        let query = datagram[packet.header_len..].to_vec();
        let socket = socket.clone();
        let doh = doh.clone();
        tokio::spawn(async move {
            match doh.query(query).await {
                Ok(answer) => {
                    let mut response = header;
                    response.extend_from_slice(&answer);
                    if let Err(err) = socket.send_to(&response, peer).await {
                        debug!(%err, "failed to send DNS response");
                    }
                }
                Err(err) => debug!(%err, "DoH query failed"),
            }
        });
    }
}

struct Datagram {
    header_len: usize,
    host: String,
    port: u16,
}

/// SOCKS5 UDP request header: RSV(2) FRAG(1) ATYP(1) DST.ADDR DST.PORT.
/// Fragmented datagrams and unknown address types are discarded.
fn parse_datagram(data: &[u8]) -> Option<Datagram> {
    if data.len() < 10 || data[2] != 0x00 {
        return None;
    }
    let (header_len, host) = match data[3] {
        0x01 => {
            let octets: [u8; 4] = data.get(4..8)?.try_into().ok()?;
            (10, IpAddr::from(octets).to_string())
        }
        0x03 => {
            let len = *data.get(4)? as usize;
            let name = data.get(5..5 + len)?;
            if data.len() < 7 + len {
                return None;
            }
            (7 + len, String::from_utf8_lossy(name).into_owned())
        }
        0x04 => {
            let octets: [u8; 16] = data.get(4..20)?.try_into().ok()?;
            if data.len() < 22 {
                return None;
            }
            (22, IpAddr::from(octets).to_string())
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([data[header_len - 2], data[header_len - 1]]);
    Some(Datagram {
        header_len,
        host,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_datagram() {
        let mut data = vec![0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53];
        data.extend_from_slice(b"dns-query");
        let packet = parse_datagram(&data).unwrap();
        assert_eq!(packet.header_len, 10);
        assert_eq!(packet.host, "8.8.8.8");
        assert_eq!(packet.port, 53);
        assert_eq!(&data[packet.header_len..], b"dns-query");
    }

    #[test]
    fn parses_domain_datagram() {
        let mut data = vec![0, 0, 0, 0x03, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&[0x01, 0xBB]);
        data.extend_from_slice(b"payload");
        let packet = parse_datagram(&data).unwrap();
        assert_eq!(packet.header_len, 18);
        assert_eq!(packet.host, "example.com");
        assert_eq!(packet.port, 443);
    }

    #[test]
    fn parses_ipv6_datagram() {
        let mut data = vec![0, 0, 0, 0x04];
        data.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        data.extend_from_slice(&[0, 53]);
        let packet = parse_datagram(&data).unwrap();
        assert_eq!(packet.header_len, 22);
        assert_eq!(packet.host, "2001:db8::1");
        assert_eq!(packet.port, 53);
    }

    #[test]
    fn rejects_fragments_short_and_unknown_atyp() {
        assert!(parse_datagram(&[0, 0, 1, 0x01, 8, 8, 8, 8, 0, 53]).is_none());
        assert!(parse_datagram(&[0, 0, 0, 0x01, 8, 8]).is_none());
        assert!(parse_datagram(&[0, 0, 0, 0x05, 8, 8, 8, 8, 0, 53]).is_none());
    }
}
