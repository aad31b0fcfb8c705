use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;

#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Turns an image reference seen on the page into bytes.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<FetchedArtifact>;
}

pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, reference: &str) -> Result<FetchedArtifact> {
        if reference.starts_with("data:") {
            return decode_data_url(reference);
        }

        let response = self
            .http
            .get(reference)
            .send()
            .await
            .with_context(|| format!("GET {reference} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GET {reference} returned {status}");
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {reference}"))?;
        if bytes.is_empty() {
            bail!("GET {reference} returned an empty body");
        }

        Ok(FetchedArtifact {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Decodes `data:<mime>[;base64],<payload>` references.
pub fn decode_data_url(reference: &str) -> Result<FetchedArtifact> {
    let rest = reference
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URL has no payload"))?;

    let bytes = if header.ends_with(";base64") {
        STANDARD
            .decode(payload.trim())
            .context("data URL payload is not valid base64")?
    } else {
        payload.as_bytes().to_vec()
    };

    let mime = header.trim_end_matches(";base64");
    Ok(FetchedArtifact {
        bytes,
        content_type: (!mime.is_empty()).then(|| mime.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_data_urls() {
        let artifact = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(artifact.bytes, b"hello");
        assert_eq!(artifact.content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn rejects_malformed_data_urls() {
        assert!(decode_data_url("data:image/png;base64").is_err());
        assert!(decode_data_url("data:image/png;base64,***").is_err());
    }
}
