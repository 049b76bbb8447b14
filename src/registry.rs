//! # Registry Client
//!
//! Talks the v2 registry protocol with bearer tokens:
//!
//! ```text
//! GET {auth_url}?service={service}&scope=repository:{library}/{image}:pull   -> {"token": ...}
//! GET {registry_url}/{library}/{image}/manifests/{tag}                       -> schema-1 manifest
//! GET {registry_url}/{library}/{image}/blobs/{digest}                        -> layer archive
//! ```
//!
//! ## Streaming
//!
//! Layer blobs are copied chunk by chunk into a caller-supplied sink; no
//! blob is ever held in memory whole. A declared `Content-Length` larger
//! than the layer ceiling is rejected before the body is read, and a body
//! shorter than its declared length is reported as truncated.
//!
//! ## Retries
//!
//! Token and manifest requests are retried internally according to the
//! client's [`RetryPolicy`]. Layer fetches are not, because a failed attempt
//! has already written into the sink; callers wrap them with
//! [`RetryPolicy::run`] and a fresh sink per attempt.
//!
//! ## Trust
//!
//! Blob digests are not verified against content. A pull is
//! trust-on-first-use.

use crate::config::RegistryConfig;
use crate::constants::{MANIFEST_ACCEPT, MAX_MANIFEST_SIZE, MAX_RETRY_DELAY, validate_digest};
use crate::error::{Error, Result};
use crate::manifest::{ImageManifest, ImageRef};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Sleep before retry number `retry` (0-based), capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    /// Runs `attempt` until it succeeds, fails permanently, or the retry
    /// budget is spent. Only [`Error::is_transient`] failures are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        retry = retry + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client bound to one registry and token endpoint.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    auth_url: String,
    service: String,
    timeout: Duration,
    max_layer_bytes: u64,
    retry: RetryPolicy,
}

impl RegistryClient {
    /// Builds a client from registry configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Internal`] if the HTTP client cannot be constructed (TLS
    /// backend initialisation).
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        // Connect and idle reads only. Token and manifest requests carry
        // their own total deadline; layer bodies have none.
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .read_timeout(config.timeout())
            .user_agent(concat!("mocker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.clone(),
            service: config.service.clone(),
            timeout: config.timeout(),
            max_layer_bytes: config.max_layer_bytes,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_delay()),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn max_layer_bytes(&self) -> u64 {
        self.max_layer_bytes
    }

    /// Requests a pull token for `repository` (`library/image`).
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] on a non-2xx response, an unreachable endpoint, or a
    /// payload without a token.
    pub async fn authenticate(&self, repository: &str) -> Result<String> {
        self.retry
            .run("authenticate", || self.request_token(repository))
            .await
    }

    async fn request_token(&self, repository: &str) -> Result<String> {
        let scope = format!("repository:{}:pull", repository);
        debug!(url = %self.auth_url, scope = %scope, "requesting token");

        let auth_err = |status: Option<u16>, reason: String| Error::Auth {
            scope: scope.clone(),
            status,
            reason,
        };

        let response = self
            .http
            .get(&self.auth_url)
            .query(&[("service", self.service.as_str()), ("scope", scope.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, "token request", |reason| auth_err(None, reason)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_err(
                Some(status.as_u16()),
                format!("token endpoint returned {}: {}", status, truncate(&body)),
            ));
        }

        let payload: TokenResponse = response.json().await.map_err(|e| {
            auth_err(Some(status.as_u16()), format!("malformed token payload: {}", e))
        })?;

        payload
            .token
            .or(payload.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| auth_err(Some(status.as_u16()), "token payload carries no token".to_string()))
    }

    /// Fetches and decodes the manifest for `reference`.
    ///
    /// # Errors
    ///
    /// - [`Error::ManifestNotFound`] on 404
    /// - [`Error::Registry`] on any other non-2xx status or transport failure
    /// - [`Error::Decode`] on a malformed body
    pub async fn fetch_manifest(&self, reference: &ImageRef, token: &str) -> Result<ImageManifest> {
        self.retry
            .run("fetch manifest", || self.request_manifest(reference, token))
            .await
    }

    async fn request_manifest(&self, reference: &ImageRef, token: &str) -> Result<ImageManifest> {
        let url = format!(
            "{}/{}/manifests/{}",
            self.registry_url,
            reference.repository(),
            reference.tag
        );
        debug!(url = %url, "fetching manifest");

        let response = self
            .authorized(self.http.get(&url), token)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.transport_error(e, "manifest request", |reason| Error::Registry {
                    status: None,
                    reason,
                })
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::ManifestNotFound {
                image: reference.repository(),
                tag: reference.tag.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Registry {
                status: Some(status.as_u16()),
                reason: format!("manifest request returned {}: {}", status, truncate(&body)),
            });
        }

        if let Some(len) = response.content_length()
            && len > MAX_MANIFEST_SIZE as u64
        {
            return Err(Error::Decode {
                what: format!("manifest for {}", reference),
                reason: format!("declared size {} exceeds {} bytes", len, MAX_MANIFEST_SIZE),
            });
        }

        let body = response.text().await.map_err(|e| Error::Registry {
            status: None,
            reason: format!("failed to read manifest body: {}", e),
        })?;

        let manifest = ImageManifest::from_registry_json(&body, reference)?;
        if manifest.tag != reference.tag {
            return Err(Error::Decode {
                what: format!("manifest for {}", reference),
                reason: format!("body is for tag '{}'", manifest.tag),
            });
        }
        info!(
            image = %reference,
            layers = manifest.layers.len(),
            "fetched manifest"
        );
        Ok(manifest)
    }

    /// Streams a layer blob into `sink`, returning the number of bytes written.
    ///
    /// The download has no total deadline. It fails with [`Error::Timeout`]
    /// only when the connection stays idle for longer than the configured
    /// timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::LayerFetch`] on a non-2xx status, a transport failure, or
    ///   a body shorter than its declared length
    /// - [`Error::ImageTooLarge`] when the blob exceeds the layer ceiling
    /// - [`Error::Io`] when the sink rejects a write
    pub async fn fetch_layer<W>(
        &self,
        reference: &ImageRef,
        digest: &str,
        token: &str,
        sink: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        validate_digest(digest).map_err(|reason| Error::LayerFetch {
            digest: digest.to_string(),
            status: None,
            reason: reason.to_string(),
        })?;

        let url = format!(
            "{}/{}/blobs/{}",
            self.registry_url,
            reference.repository(),
            digest
        );
        debug!(url = %url, "fetching layer");

        let fetch_err = |status: Option<u16>, reason: String| Error::LayerFetch {
            digest: digest.to_string(),
            status,
            reason,
        };

        let response = self
            .authorized(self.http.get(&url), token)
            .send()
            .await
            .map_err(|e| self.transport_error(e, "blob request", |reason| fetch_err(None, reason)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(
                Some(status.as_u16()),
                format!("blob request returned {}", status),
            ));
        }

        let expected = response.content_length();
        if let Some(len) = expected
            && len > self.max_layer_bytes
        {
            return Err(Error::ImageTooLarge {
                size: len,
                limit: self.max_layer_bytes,
            });
        }

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                self.transport_error(e, "blob body", |reason| fetch_err(None, reason))
            })?;
            written += chunk.len() as u64;
            if written > self.max_layer_bytes {
                return Err(Error::ImageTooLarge {
                    size: written,
                    limit: self.max_layer_bytes,
                });
            }
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;

        if let Some(len) = expected
            && written < len
        {
            return Err(fetch_err(
                None,
                format!("stream truncated after {} of {} bytes", written, len),
            ));
        }

        debug!(digest, bytes = written, "layer downloaded");
        Ok(written)
    }

    fn authorized(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.bearer_auth(token)
        }
    }

    /// Maps a transport error, turning reqwest timeouts into [`Error::Timeout`].
    fn transport_error(
        &self,
        e: reqwest::Error,
        operation: &str,
        wrap: impl FnOnce(String) -> Error,
    ) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation: operation.to_string(),
                duration: self.timeout,
            }
        } else {
            wrap(format!("{} failed: {}", operation, e))
        }
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
