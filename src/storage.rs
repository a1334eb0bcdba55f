//! `StorageClient`: best-effort image deletion against the external image
//! host the catalog writer discovers duplicates against.
//!
//! A single configured `reqwest::Client`, bearer auth, and a deliberately
//! lenient status mapping (404 counts as success — the image is already
//! gone).

use std::time::Duration;

use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};
use reqwest::{StatusCode, Url};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

pub struct StorageClient {
    base_url: Url,
    api_token: String,
    fail_on_error: bool,
    http: reqwest::Client,
}

const NAME_PREFIXES: [&str; 3] = ["/api/images/", "/images/", "images/"];

impl StorageClient {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim()).map_err(|_| StorageError::InvalidBaseUrl)?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(StorageError::InvalidBaseUrl.into());
        }
        if config.api_token.trim().is_empty() {
            return Err(StorageError::MissingToken.into());
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|_| StorageError::InvalidBaseUrl)?;

        Ok(Self {
            base_url,
            api_token: config.api_token.clone(),
            fail_on_error: config.fail_on_error,
            http,
        })
    }

    /// Extracts the bare image name from a URL the catalog writer flagged
    /// as a duplicate, accepting either an absolute URL on this client's
    /// origin or a path-only form under one of the known image prefixes.
    fn extract_name(&self, candidate: &str) -> Option<String> {
        let trimmed = candidate.trim();
        let path = if let Ok(parsed) = Url::parse(trimmed) {
            if parsed.origin() != self.base_url.origin() {
                return None;
            }
            parsed.path().to_string()
        } else {
            trimmed.to_string()
        };

        let stripped = NAME_PREFIXES.iter().find_map(|prefix| path.strip_prefix(prefix))?;
        let decoded = percent_decode_str(stripped).decode_utf8().ok()?.into_owned();
        if decoded.is_empty() || decoded.contains('/') || decoded.contains('\\') || decoded.contains("..") {
            return None;
        }
        Some(decoded)
    }

    /// Best-effort by default: logs and continues past non-2xx responses
    /// and transport errors unless `fail_on_error` is set.
    pub async fn delete_images(&self, urls: &[String]) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        for url in urls {
            if let Some(name) = self.extract_name(url) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let mut deleted = 0u64;
        let mut errored = 0u64;

        for name in &names {
            let encoded = percent_encode(name.as_bytes(), NON_ALPHANUMERIC).to_string();
            let target = format!("{}api/images/{}", ensure_trailing_slash(self.base_url.as_str()), encoded);

            match self.http.delete(&target).bearer_auth(&self.api_token).send().await {
                Ok(response) if response.status() == StatusCode::NO_CONTENT || response.status() == StatusCode::NOT_FOUND => {
                    deleted += 1;
                }
                Ok(response) => {
                    errored += 1;
                    let status = response.status().as_u16();
                    tracing::warn!(name = %name, status, "storage delete returned non-success status");
                    if self.fail_on_error {
                        return Err(StorageError::DeleteFailed { name: name.clone(), status }.into());
                    }
                }
                Err(source) => {
                    errored += 1;
                    tracing::warn!(name = %name, error = %source, "storage delete transport error");
                    if self.fail_on_error {
                        return Err(StorageError::Transport { name: name.clone(), source }.into());
                    }
                }
            }
        }

        crate::metrics::images::deleted_success(deleted);
        crate::metrics::images::deleted_error(errored);
        Ok(())
    }
}

fn ensure_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}
