//! Minimal DNS wire-format support: building an HTTPS-record (type 65) query,
//! extracting the `ech` SvcParam from the response, and the DoH POST
//! transport both queries ride on.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;

pub const TYPE_HTTPS: u16 = 65;
const CLASS_IN: u16 = 1;
const SVC_PARAM_ECH: u16 = 5;

pub const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a wire-format DNS query for `domain` with recursion desired.
pub fn build_query(domain: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut query = vec![
        0x00, 0x01, // ID
        0x01, 0x00, // flags: RD
        0x00, 0x01, // QDCOUNT
        0x00, 0x00, // ANCOUNT
        0x00, 0x00, // NSCOUNT
        0x00, 0x00, // ARCOUNT
    ];
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            bail!("invalid DNS label in {domain:?}");
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(query)
}

/// Walk the answers of a wire-format response and return the base64-encoded
/// value of the first `ech` SvcParam found in an HTTPS record.
pub fn extract_ech_param(response: &[u8]) -> Result<String> {
    if response.len() < 12 {
        bail!("DNS response too short");
    }
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
    if ancount == 0 {
        bail!("DNS response carries no answers");
    }

    // Skip the question section: QNAME, QTYPE, QCLASS.
    let mut offset = skip_name(response, 12).context("malformed question name")?;
    offset = offset.checked_add(4).context("truncated question")?;

    for _ in 0..ancount {
        offset = skip_name(response, offset).context("malformed answer name")?;
        let fixed = response
            .get(offset..offset + 10)
            .context("truncated answer header")?;
        let rr_type = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        offset += 10;
        let rdata = response
            .get(offset..offset + rdlength)
            .context("truncated answer rdata")?;
        offset += rdlength;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = ech_param_from_https_rdata(rdata) {
                return Ok(BASE64.encode(ech));
            }
        }
    }
    bail!("no HTTPS record with an ech parameter")
}

/// Advance past a (possibly compressed) domain name starting at `offset`.
fn skip_name(data: &[u8], mut offset: usize) -> Result<usize> {
    loop {
        let len = *data.get(offset).context("truncated name")? as usize;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer terminates the name.
            return Ok(offset + 2);
        }
        offset += 1 + len;
    }
}

/// HTTPS rdata: SvcPriority, TargetName, then SvcParams as key/len/value.
fn ech_param_from_https_rdata(rdata: &[u8]) -> Option<&[u8]> {
    if rdata.len() < 2 {
        return None;
    }
    let mut offset = 2;
    // TargetName is uncompressed inside rdata.
    loop {
        let len = *rdata.get(offset)? as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        offset += len;
    }
    while let Some(header) = rdata.get(offset..offset + 4) {
        let key = u16::from_be_bytes([header[0], header[1]]);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        offset += 4;
        let value = rdata.get(offset..offset + len)?;
        offset += len;
        if key == SVC_PARAM_ECH {
            return Some(value);
        }
    }
    None
}

/// POST a wire-format DNS query to a DoH endpoint and return the raw
/// wire-format response body.
pub async fn post_wire_query(
    client: &reqwest::Client,
    url: &str,
    query: Vec<u8>,
) -> Result<Vec<u8>> {
    let resp = client
        .post(url)
        .header("Content-Type", "application/dns-message")
        .header("Accept", "application/dns-message")
        .body(query)
        .send()
        .await
        .with_context(|| format!("DoH POST to {url} failed"))?;

    let status = resp.status();
    if !status.is_success() {
        bail!("DoH endpoint {url} returned HTTP {status}");
    }
    let body = resp.bytes().await.context("failed to read DoH response")?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Response with one HTTPS answer whose name is a compression pointer.
    fn https_response(params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut resp = vec![
            0x00, 0x01, 0x81, 0x80, // ID, flags: QR RD RA
            0x00, 0x01, 0x00, 0x01, // QDCOUNT, ANCOUNT
            0x00, 0x00, 0x00, 0x00,
        ];
        // Question: example.com HTTPS IN
        resp.extend_from_slice(b"\x07example\x03com\x00");
        resp.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        resp.extend_from_slice(&CLASS_IN.to_be_bytes());
        // Answer: pointer to offset 12, type HTTPS, class IN, TTL 60
        resp.extend_from_slice(&[0xC0, 0x0C]);
        resp.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        resp.extend_from_slice(&CLASS_IN.to_be_bytes());
        resp.extend_from_slice(&60u32.to_be_bytes());

        let mut rdata = vec![0x00, 0x01, 0x00]; // priority 1, root target
        for (key, value) in params {
            rdata.extend_from_slice(&key.to_be_bytes());
            rdata.extend_from_slice(&(value.len() as u16).to_be_bytes());
            rdata.extend_from_slice(value);
        }
        resp.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        resp.extend_from_slice(&rdata);
        resp
    }

    #[test]
    fn query_encodes_labels_and_type() {
        let query = build_query("cloudflare-ech.com", TYPE_HTTPS).unwrap();
        assert_eq!(&query[4..6], &[0x00, 0x01]);
        let name_start = 12;
        assert_eq!(query[name_start], 14);
        assert_eq!(&query[name_start + 1..name_start + 15], b"cloudflare-ech");
        let tail = &query[query.len() - 4..];
        assert_eq!(tail, &[0x00, 65, 0x00, 0x01]);
    }

    #[test]
    fn query_rejects_oversized_label() {
        let label = "x".repeat(64);
        assert!(build_query(&format!("{label}.com"), TYPE_HTTPS).is_err());
        assert!(build_query("", TYPE_HTTPS).is_err());
    }

    #[test]
    fn extracts_ech_param() {
        let ech = b"\x00\x08fakecfg!";
        let resp = https_response(&[(1, b"\x02h2"), (SVC_PARAM_ECH, ech)]);
        let encoded = extract_ech_param(&resp).unwrap();
        assert_eq!(BASE64.decode(encoded).unwrap(), ech);
    }

    #[test]
    fn errors_when_no_ech_param_present() {
        let resp = https_response(&[(1, b"\x02h2")]);
        assert!(extract_ech_param(&resp).is_err());
    }

    #[test]
    fn errors_on_empty_answer_section() {
        let mut resp = https_response(&[(SVC_PARAM_ECH, b"cfg")]);
        resp[6] = 0;
        resp[7] = 0;
        assert!(extract_ech_param(&resp).is_err());
    }

    #[test]
    fn errors_on_truncated_response() {
        let resp = https_response(&[(SVC_PARAM_ECH, b"cfg")]);
        assert!(extract_ech_param(&resp[..resp.len() - 4]).is_err());
        assert!(extract_ech_param(&resp[..8]).is_err());
    }
}
