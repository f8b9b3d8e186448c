//! HTTP/1.1 proxy front-end.
//!
//! Two shapes arrive here: `CONNECT host:port` tunnels, and plain proxy
//! requests in absolute-URI or origin form. The latter are rewritten to
//! origin form, stripped of proxy-only headers, and re-serialized as the
//! tunnel's first frame.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{split_host_port, Mode};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

/// Request bodies larger than this are not buffered into the first frame.
const MAX_BODY: usize = 10 * 1024 * 1024;

const PROXY_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];
/// Hop-by-hop headers that must not reach the origin server.
const FILTERED_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization", "user-agent"];

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// Hand off to routing: `CONNECT` (empty first frame) or a rewritten
    /// plain request carried as the first frame.
    Tunnel {
        target: String,
        mode: Mode,
        first_frame: Vec<u8>,
    },
    /// Already answered with a 4xx; close the connection.
    Rejected,
}

/// Parse one proxy request from a buffered stream whose first byte is the
/// classifier byte (the caller has prepended it).
pub async fn read_request<R, W>(reader: &mut R, writer: &mut W) -> Result<Request>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut request_line = String::new();
    let n = reader
        .read_line(&mut request_line)
        .await
        .context("reading request line")?;
    if n == 0 {
        return Err(unexpected_eof("connection closed before request line"));
    }
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line: {request_line:?}");
    };

    let mut header_lines: Vec<String> = Vec::new();
    let mut host_header = None;
    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.context("reading header")?;
        if n == 0 {
            return Err(unexpected_eof("connection closed inside headers"));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "host" => host_header = Some(value.to_string()),
                "content-length" => {
                    content_length = value.parse().unwrap_or(0);
                }
                _ => {}
            }
        }
        header_lines.push(line);
    }

    if method == "CONNECT" {
        return Ok(Request::Tunnel {
            target: uri.to_string(),
            mode: Mode::HttpConnect,
            first_frame: Vec::new(),
        });
    }

    if !PROXY_METHODS.contains(&method) {
        let _ = writer.write_all(METHOD_NOT_ALLOWED).await;
        return Ok(Request::Rejected);
    }

    // Absolute-URI form carries the authority in the request target;
    // origin form relies on the Host header.
    let (target, path) = if let Some(rest) = uri.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) if idx > 0 => (rest[..idx].to_string(), rest[idx..].to_string()),
            _ => (rest.trim_end_matches('/').to_string(), "/".to_string()),
        }
    } else {
        match &host_header {
            Some(host) => (host.clone(), uri.to_string()),
            None => (String::new(), uri.to_string()),
        }
    };

    if target.is_empty() {
        let _ = writer.write_all(BAD_REQUEST).await;
        return Ok(Request::Rejected);
    }
    let target = if split_host_port(&target).is_ok() {
        target
    } else {
        format!("{target}:80")
    };

    // Re-serialize in origin form, dropping the proxy-only headers.
    let mut frame = format!("{method} {path} {version}\r\n").into_bytes();
    for line in &header_lines {
        let key = line.split(':').next().unwrap_or("").trim().to_ascii_lowercase();
        if FILTERED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    frame.extend_from_slice(b"\r\n");

    if content_length > 0 && content_length < MAX_BODY {
        let mut body = vec![0u8; content_length];
        reader
            .read_exact(&mut body)
            .await
            .context("reading request body")?;
        frame.extend_from_slice(&body);
    }

    Ok(Request::Tunnel {
        target,
        mode: Mode::HttpProxy,
        first_frame: frame,
    })
}

fn unexpected_eof(context: &'static str) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).context(context)
}
