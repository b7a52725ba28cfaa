//! Streaming source reader
//!
//! Pulls a delimited dataset through a [`ByteSource`] in chunks of whatever
//! size the transport delivers and yields one [`Record`] at a time. A dropped
//! connection is re-opened at the last confirmed byte offset, so no record is
//! delivered twice or skipped.

mod backoff;
mod decoder;
mod file;
mod http;

pub use backoff::Backoff;
pub use decoder::{Record, RecordDecoder};
pub use file::FileSource;
pub use http::HttpSource;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid source locator: {0}")]
    InvalidLocator(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Stream interrupted: {0}")]
    Interrupted(String),
}

impl SourceError {
    /// Fatal errors are not worth retrying
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::HttpStatus(status) => {
                status.is_client_error()
                    && *status != reqwest::StatusCode::REQUEST_TIMEOUT
                    && *status != reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            SourceError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            SourceError::InvalidLocator(_) | SourceError::RetriesExhausted { .. } => true,
            SourceError::Request(_) | SourceError::Interrupted(_) => false,
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, SourceError>>;

/// An opened byte stream starting at the requested offset
pub struct Opened {
    pub chunks: ChunkStream,
    /// Size of the whole resource, when the transport reports it
    pub total_bytes: Option<u64>,
}

/// Something that can (re)deliver a byte stream from an offset
pub trait ByteSource: Send {
    fn open(&mut self, offset: u64) -> BoxFuture<'_, Result<Opened, SourceError>>;
}

impl ByteSource for Box<dyn ByteSource> {
    fn open(&mut self, offset: u64) -> BoxFuture<'_, Result<Opened, SourceError>> {
        (**self).open(offset)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures allowed before giving up
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, backoff_base_ms: 500, backoff_max_ms: 30_000 }
    }
}

/// Pick a byte source for a locator: http(s) URLs stream over the network,
/// anything else is a local path.
pub fn source_for(locator: &str, timeout: Duration) -> Result<Box<dyn ByteSource>, SourceError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        Ok(Box::new(HttpSource::new(locator, timeout)?))
    } else {
        Ok(Box::new(FileSource::new(locator)))
    }
}

pub struct SourceReader<S: ByteSource> {
    source: S,
    decoder: RecordDecoder,
    policy: RetryPolicy,
    backoff: Backoff,
    stream: Option<ChunkStream>,
    ready: VecDeque<Record>,
    /// Bytes confirmed delivered to the decoder
    offset: u64,
    total_bytes: Option<u64>,
    failures: u32,
    finished: bool,
}

impl<S: ByteSource> SourceReader<S> {
    pub fn new(source: S, delimiter: u8, policy: RetryPolicy) -> Self {
        let backoff = Backoff::new(policy.backoff_base_ms, policy.backoff_max_ms);
        Self {
            source,
            decoder: RecordDecoder::new(delimiter),
            policy,
            backoff,
            stream: None,
            ready: VecDeque::new(),
            offset: 0,
            total_bytes: None,
            failures: 0,
            finished: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn malformed_lines(&self) -> u64 {
        self.decoder.malformed_lines()
    }

    /// Next record, or `None` at the end of the source
    pub async fn next_record(&mut self) -> Result<Option<Record>, SourceError> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Ok(Some(record));
            }
            if self.finished {
                return Ok(None);
            }

            if self.stream.is_none() {
                match self.source.open(self.offset).await {
                    Ok(opened) => {
                        if let Some(total) = opened.total_bytes {
                            self.total_bytes = Some(total.max(self.offset));
                        }
                        self.stream = Some(opened.chunks);
                    }
                    Err(e) => {
                        self.retry_or_fail(e).await?;
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else { continue };
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.offset += chunk.len() as u64;
                    self.failures = 0;
                    self.backoff.reset();
                    self.ready.extend(self.decoder.feed(&chunk));
                }
                Some(Err(e)) => {
                    self.stream = None;
                    self.retry_or_fail(e).await?;
                }
                None => {
                    self.stream = None;
                    match self.total_bytes {
                        Some(total) if self.offset < total => {
                            let e = SourceError::Interrupted(format!(
                                "stream ended at {} of {} bytes",
                                self.offset, total
                            ));
                            self.retry_or_fail(e).await?;
                        }
                        _ => {
                            self.ready.extend(self.decoder.finish());
                            self.finished = true;
                            tracing::debug!(bytes = self.offset, "[Source] Stream complete");
                        }
                    }
                }
            }
        }
    }

    async fn retry_or_fail(&mut self, error: SourceError) -> Result<(), SourceError> {
        if error.is_fatal() {
            tracing::error!(offset = self.offset, error = %error, "[Source] Fatal error");
            return Err(error);
        }
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            tracing::error!(attempts = self.failures, error = %error, "[Source] Retries exhausted");
            return Err(SourceError::RetriesExhausted {
                attempts: self.failures,
                last: error.to_string(),
            });
        }
        let delay = self.backoff.next_delay();
        tracing::warn!(
            offset = self.offset,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "[Source] Transient failure, resuming"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
