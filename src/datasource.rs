//! Acquisition of the country-IP dataset files.
//!
//! Each dataset lives next to the executable; when the file is missing or
//! empty it is fetched from its upstream URL and persisted before use.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

/// Something that can produce the raw bytes of a dataset.
pub trait DataSource {
    async fn sync(&self) -> Result<Vec<u8>>;
}

/// File-backed dataset with an HTTPS fallback download.
pub struct FileSource {
    tag: &'static str,
    file_name: &'static str,
    url: String,
}

impl FileSource {
    pub fn new(tag: &'static str, file_name: &'static str, url: String) -> Self {
        Self {
            tag,
            file_name,
            url,
        }
    }

    fn path(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe().context("failed to locate executable")?;
        let dir = exe.parent().context("executable has no parent directory")?;
        Ok(dir.join(self.file_name))
    }

    async fn download(&self) -> Result<Vec<u8>> {
        info!(tag = self.tag, url = %self.url, "downloading dataset");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()
            .context("failed to build download client")?;
        let resp = client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("download of {} failed", self.tag))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("dataset {} download returned HTTP {status}", self.tag);
        }
        let body = resp.bytes().await.context("failed to read dataset body")?;
        Ok(body.to_vec())
    }
}

impl DataSource for FileSource {
    async fn sync(&self) -> Result<Vec<u8>> {
        let path = self.path()?;
        let needs_download = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        if needs_download {
            let data = self.download().await?;
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("failed to persist dataset to {}", path.display()))?;
            info!(tag = self.tag, path = %path.display(), "dataset saved");
            return Ok(data);
        }

        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read dataset {}", path.display()))
    }
}
