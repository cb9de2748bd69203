use std::fmt;
use std::fs;
use std::time::Duration;

use fashionista_contracts::controller::SelectedFile;
use fashionista_contracts::descriptor::RemoteImageHandle;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::truncate_text;

pub const RELAY_ENDPOINT_PATH: &str = "/api/generate";
pub const RELAY_FIELD_NAME: &str = "image";
const RELAY_TIMEOUT_SECONDS: u64 = 180;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayClientError {
    InvalidInput(String),
    Transport(String),
    Server { status: u16, message: String },
}

impl RelayClientError {
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidInput(message) | Self::Transport(message) => message,
            Self::Server { message, .. } => message,
        }
    }
}

impl fmt::Display for RelayClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for RelayClientError {}

/// Client side of `POST /api/generate`.
pub trait Relay: Send + Sync {
    fn upload(&self, file: &SelectedFile) -> Result<RemoteImageHandle, RelayClientError>;
}

pub struct HttpRelayClient {
    endpoint: String,
    http: HttpClient,
}

impl HttpRelayClient {
    pub fn new(server: &str) -> Result<Self, RelayClientError> {
        let server = server.trim().trim_end_matches('/');
        if !(server.starts_with("http://") || server.starts_with("https://")) {
            return Err(RelayClientError::InvalidInput(format!(
                "relay server must be an http(s) url, got '{server}'"
            )));
        }
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(RELAY_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| RelayClientError::Transport(err.to_string()))?;
        Ok(Self {
            endpoint: format!("{server}{RELAY_ENDPOINT_PATH}"),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Relay for HttpRelayClient {
    fn upload(&self, file: &SelectedFile) -> Result<RemoteImageHandle, RelayClientError> {
        let bytes = fs::read(&file.path).map_err(|err| {
            RelayClientError::InvalidInput(format!("failed reading {}: {err}", file.path.display()))
        })?;
        let mut part = MultipartPart::bytes(bytes).file_name(file.file_name.clone());
        if let Some(mime) = file.mime_type.as_deref() {
            part = part
                .mime_str(mime)
                .map_err(|err| RelayClientError::InvalidInput(err.to_string()))?;
        }
        let form = MultipartForm::new().part(RELAY_FIELD_NAME, part);

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .map_err(|err| RelayClientError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| RelayClientError::Transport(err.to_string()))?;
        parse_relay_response(status.as_u16(), &body)
    }
}

/// Success bodies carry `public_id`; failures carry `error`, which is
/// returned verbatim.
pub fn parse_relay_response(status: u16, body: &str) -> Result<RemoteImageHandle, RelayClientError> {
    let payload = serde_json::from_str::<Value>(body).ok();
    if !(200..300).contains(&status) {
        let message = payload
            .as_ref()
            .and_then(|value| value.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("Request failed with status code {status}")
                } else {
                    truncate_text(trimmed, 512)
                }
            });
        return Err(RelayClientError::Server { status, message });
    }
    let public_id = payload
        .as_ref()
        .and_then(|value| value.get("public_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| RelayClientError::Server {
            status,
            message: "relay response missing public_id".to_string(),
        })?;
    RemoteImageHandle::new(public_id).map_err(|message| RelayClientError::Server { status, message })
}
