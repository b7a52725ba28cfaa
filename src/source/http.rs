//! HTTP byte source with range resume

use super::{ByteSource, Opened, SourceError};
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;

pub struct HttpSource {
    client: Client,
    url: String,
}

/// Validate a locator before fetching
fn is_valid_source_url(url_str: &str) -> bool {
    let parsed = match url::Url::parse(url_str) {
        Ok(u) => u,
        Err(_) => return false,
    };
    matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
}

/// Total length from a `Content-Range: bytes a-b/total` header
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

impl HttpSource {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, SourceError> {
        if !is_valid_source_url(url) {
            return Err(SourceError::InvalidLocator(url.to_string()));
        }
        // No overall timeout: a large dataset legitimately streams for a long time
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }

    async fn fetch(&self, offset: u64) -> Result<Opened, SourceError> {
        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        tracing::debug!(url = %self.url, offset, "[Source] Requesting");
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // Everything up to the end was already delivered
            return Ok(Opened { chunks: futures::stream::empty().boxed(), total_bytes: Some(offset) });
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status));
        }

        let total_bytes = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(total_from_content_range)
        } else {
            response.content_length()
        };

        // A server that ignores Range resends from byte zero; drop what we already have
        let mut to_skip = if status == StatusCode::PARTIAL_CONTENT { 0 } else { offset };
        if to_skip > 0 {
            tracing::debug!(offset, "[Source] Server ignored range request, skipping locally");
        }
        let chunks = response
            .bytes_stream()
            .map(move |chunk| -> Result<Vec<u8>, SourceError> {
                let bytes = chunk?;
                let skip = (to_skip as usize).min(bytes.len());
                to_skip -= skip as u64;
                Ok(bytes[skip..].to_vec())
            })
            .boxed();

        Ok(Opened { chunks, total_bytes })
    }
}

impl ByteSource for HttpSource {
    fn open(&mut self, offset: u64) -> BoxFuture<'_, Result<Opened, SourceError>> {
        Box::pin(self.fetch(offset))
    }
}
