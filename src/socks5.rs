//! SOCKS5 front-end (RFC 1928 subset: no authentication, CONNECT and
//! UDP ASSOCIATE).
//!
//! The version byte has already been consumed by the protocol classifier;
//! parsing starts at the method count of the greeting.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_CMD_NOT_SUPPORTED: &[u8] = &[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_ATYP_NOT_SUPPORTED: &[u8] = &[0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Outcome of driving the greeting and request phases.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// CONNECT to the composed `host:port` target.
    Connect { target: String },
    /// UDP ASSOCIATE; the caller runs the UDP relay against the same
    /// association.
    UdpAssociate,
    /// Protocol violation already answered (or deliberately ignored);
    /// nothing more to do on this connection.
    Rejected,
}

/// Drive method negotiation and request parsing. Replies `NO AUTH`
/// regardless of the offered method list.
pub async fn read_request<R, W>(reader: &mut R, writer: &mut W) -> Result<Request>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nmethods = reader.read_u8().await.context("reading method count")? as usize;
    let mut methods = vec![0u8; nmethods];
    reader
        .read_exact(&mut methods)
        .await
        .context("reading methods")?;

    writer
        .write_all(&[VERSION, METHOD_NO_AUTH])
        .await
        .context("writing method selection")?;
    writer.flush().await.context("flushing method selection")?;

    let mut head = [0u8; 4];
    reader
        .read_exact(&mut head)
        .await
        .context("reading request header")?;
    if head[0] != VERSION {
        return Ok(Request::Rejected);
    }
    let cmd = head[1];
    let atyp = head[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await.context("reading IPv4")?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await.context("reading domain length")? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await.context("reading domain")?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await.context("reading IPv6")?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => {
            let _ = writer.write_all(REPLY_ATYP_NOT_SUPPORTED).await;
            return Ok(Request::Rejected);
        }
    };

    let port = reader.read_u16().await.context("reading port")?;

    match cmd {
        CMD_CONNECT => {
            let target = if atyp == ATYP_IPV6 {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            Ok(Request::Connect { target })
        }
        CMD_UDP_ASSOCIATE => Ok(Request::UdpAssociate),
        _ => {
            let _ = writer.write_all(REPLY_CMD_NOT_SUPPORTED).await;
            Ok(Request::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Feed `input` (version byte already stripped) and return the parsed
    /// request plus everything written back to the client.
    async fn drive(input: &[u8]) -> (Request, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(256);
        let (mut reader, mut writer) = tokio::io::split(server);

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let request = read_request(&mut reader, &mut writer).await.unwrap();

        drop(reader);
        drop(writer);
        let mut replies = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut replies)
            .await
            .unwrap();
        (request, replies)
    }

    #[tokio::test]
    async fn greeting_reply_is_no_auth() {
        let input = [1, 0x00, 0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let (request, replies) = drive(&input).await;
        assert_eq!(
            request,
            Request::Connect {
                target: "93.184.216.34:443".to_string()
            }
        );
        assert_eq!(&replies[..2], &[0x05, 0x00]);
    }

    #[tokio::test]
    async fn connect_domain_target() {
        let mut input = vec![1, 0x00, 0x05, 0x01, 0x00, 0x03, 11];
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&[0x01, 0xBB]);
        let (request, _) = drive(&input).await;
        assert_eq!(
            request,
            Request::Connect {
                target: "example.com:443".to_string()
            }
        );
    }

    #[tokio::test]
    async fn connect_ipv6_target_is_bracketed() {
        let mut input = vec![1, 0x00, 0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&[
            0x26, 0x06, 0x28, 0x00, 0x02, 0x20, 0x00, 0x01, 0x02, 0x48, 0x18, 0x93, 0x25, 0xc8,
            0x19, 0x46,
        ]);
        input.extend_from_slice(&[0x01, 0xBB]);
        let (request, _) = drive(&input).await;
        assert_eq!(
            request,
            Request::Connect {
                target: "[2606:2800:220:1:248:1893:25c8:1946]:443".to_string()
            }
        );
    }

    #[tokio::test]
    async fn udp_associate_is_recognized() {
        let input = [1, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let (request, _) = drive(&input).await;
        assert_eq!(request, Request::UdpAssociate);
    }

    #[tokio::test]
    async fn unknown_atyp_gets_reply_08() {
        let input = [1, 0x00, 0x05, 0x01, 0x00, 0x02, 0, 0];
        let (request, replies) = drive(&input).await;
        assert_eq!(request, Request::Rejected);
        assert_eq!(replies.last_chunk::<10>().unwrap()[1], 0x08);
    }

    #[tokio::test]
    async fn unsupported_command_gets_reply_07() {
        let input = [1, 0x00, 0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let (request, replies) = drive(&input).await;
        assert_eq!(request, Request::Rejected);
        assert_eq!(replies.last_chunk::<10>().unwrap()[1], 0x07);
    }

    #[tokio::test]
    async fn wrong_version_in_request_closes_silently() {
        let input = [1, 0x00, 0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let (request, replies) = drive(&input).await;
        assert_eq!(request, Request::Rejected);
        assert_eq!(replies, [0x05, 0x00]);
    }
}
