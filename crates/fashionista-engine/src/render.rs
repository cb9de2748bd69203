use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;

use crate::{error_chain_text, truncate_text};

const RENDER_TIMEOUT_SECONDS: u64 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Loaded { bytes: usize },
    /// HTTP 423: the derived image is still being generated remotely.
    RateLimited,
    Failed(String),
}

/// Loads a rendered delivery URL the way a browser would.
pub trait RenderFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> RenderOutcome;
}

pub struct HttpRenderFetcher {
    http: HttpClient,
}

impl HttpRenderFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(RENDER_TIMEOUT_SECONDS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed building render http client")?;
        Ok(Self { http })
    }
}

impl RenderFetcher for HttpRenderFetcher {
    fn fetch(&self, url: &str) -> RenderOutcome {
        let response = match self.http.get(url).send() {
            Ok(response) => response,
            Err(raw) => {
                let err = anyhow::Error::new(raw).context(format!("render request failed ({url})"));
                return RenderOutcome::Failed(error_chain_text(&err, 512));
            }
        };
        let status = response.status();
        let service_error = response
            .headers()
            .get("x-cld-error")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let Some(outcome) = classify_status(status, service_error.as_deref()) {
            return outcome;
        }
        match response.bytes() {
            Ok(bytes) => RenderOutcome::Loaded { bytes: bytes.len() },
            Err(raw) => RenderOutcome::Failed(format!("render body read failed: {raw}")),
        }
    }
}

/// `None` means the body should be read as a successfully rendered image.
pub fn classify_status(status: StatusCode, service_error: Option<&str>) -> Option<RenderOutcome> {
    if status == StatusCode::LOCKED {
        return Some(RenderOutcome::RateLimited);
    }
    if status.is_success() {
        return None;
    }
    let detail = service_error
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| format!(": {}", truncate_text(value, 512)))
        .unwrap_or_default();
    Some(RenderOutcome::Failed(format!(
        "render failed ({}){detail}",
        status.as_u16()
    )))
}
