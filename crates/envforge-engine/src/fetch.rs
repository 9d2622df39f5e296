use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};

pub trait InstallerFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>>;
}

/// Downloads installer scripts over HTTPS with a small retry budget.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    attempts: u32,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("envforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            attempts: 3,
        })
    }

    fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to request installer: {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("installer download failed: url={url} status={status}"));
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read installer body: {url}"))?;
        Ok(bytes.to_vec())
    }
}

impl InstallerFetcher for HttpFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match self.fetch_once(url) {
                Ok(bytes) => {
                    debug!("fetched {} bytes from {url}", bytes.len());
                    return Ok(bytes);
                }
                Err(err) => {
                    warn!("installer fetch attempt {attempt}/{} failed: {err:#}", self.attempts);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("installer download failed: url={url}")))
    }
}
