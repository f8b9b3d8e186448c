//! ECHConfigList acquisition and TLS client-config assembly.
//!
//! The config list is fetched out-of-band through a DoH HTTPS-record query
//! and cached process-wide. Every tunnel dial requires a non-empty list:
//! there is no fallback to plain SNI.

use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::client::{EchConfig, EchMode};
use rustls::pki_types::EchConfigListBytes;
use rustls::{ClientConfig, RootCertStore};
use tracing::info;

use crate::dns;

/// Hostname the DNS-over-UDP special case posts its DoH queries to, reached
/// on the relay's port so the flow blends in with tunnel traffic.
pub const DOH_PROXY_HOST: &str = "cloudflare-dns.com";

/// Process-wide holder of the current raw ECHConfigList.
pub struct EchProvider {
    doh_endpoint: String,
    ech_domain: String,
    raw: RwLock<Vec<u8>>,
}

impl EchProvider {
    pub fn new(doh_endpoint: &str, ech_domain: &str) -> Self {
        Self {
            doh_endpoint: doh_endpoint.to_string(),
            ech_domain: ech_domain.to_string(),
            raw: RwLock::new(Vec::new()),
        }
    }

    /// Fetch the ECHConfigList for the configured domain and cache it.
    pub async fn prepare(&self) -> Result<()> {
        let encoded = self
            .query_https_record()
            .await
            .context("ECH DNS query failed")?;
        let raw = BASE64
            .decode(encoded.as_bytes())
            .context("ech parameter is not valid base64")?;
        if raw.is_empty() {
            bail!("ech parameter decoded to an empty config list");
        }
        let len = raw.len();
        *self.raw.write().expect("ECH lock poisoned") = raw;
        info!(bytes = len, "ECH config list loaded");
        Ok(())
    }

    /// Re-fetch the config list, replacing the cached copy.
    pub async fn refresh(&self) -> Result<()> {
        info!("refreshing ECH config list");
        self.prepare().await
    }

    /// Current raw ECHConfigList. Empty is an error: callers must not dial
    /// without ECH.
    pub fn get(&self) -> Result<Vec<u8>> {
        let raw = self.raw.read().expect("ECH lock poisoned");
        if raw.is_empty() {
            bail!("ECH config list not loaded");
        }
        Ok(raw.clone())
    }

    /// TLS 1.3 client config offering the given ECHConfigList.
    ///
    /// The server name is supplied at connect time by the caller's
    /// transport; when the server rejects ECH the handshake fails rather
    /// than continuing with cleartext SNI.
    pub fn build_tls(&self, raw: &[u8]) -> Result<ClientConfig> {
        if raw.is_empty() {
            bail!("refusing to build a TLS config without ECH");
        }
        let ech = EchConfig::new(
            EchConfigListBytes::from(raw.to_vec()),
            rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
        )
        .context("unusable ECH config list")?;

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_ech(EchMode::from(ech))
        .context("failed to enable ECH")?
        .with_root_certificates(system_roots()?)
        .with_no_client_auth();
        Ok(config)
    }

    /// TLS config for the DoH channel used by the DNS-over-UDP relay,
    /// itself protected by ECH.
    pub fn tls_for_doh(&self) -> Result<ClientConfig> {
        let raw = self.get()?;
        self.build_tls(&raw)
    }

    async fn query_https_record(&self) -> Result<String> {
        let url = if self.doh_endpoint.starts_with("https://") {
            self.doh_endpoint.clone()
        } else {
            format!("https://{}", self.doh_endpoint)
        };
        let query = dns::build_query(&self.ech_domain, dns::TYPE_HTTPS)?;
        let client = reqwest::Client::builder()
            .timeout(dns::DOH_TIMEOUT)
            .no_proxy()
            .build()
            .context("failed to build DoH client")?;
        let response = dns::post_wire_query(&client, &url, query).await?;
        dns::extract_ech_param(&response)
    }
}

fn system_roots() -> Result<RootCertStore> {
    let loaded = rustls_native_certs::load_native_certs();
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(loaded.certs);
    if roots.is_empty() {
        bail!("no usable certificates in the system root store");
    }
    Ok(roots)
}
