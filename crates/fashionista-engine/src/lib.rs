use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use fashionista_contracts::descriptor::RemoteImageHandle;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod delivery;
pub mod relay_client;
pub mod render;

pub use delivery::DeliveryUrlBuilder;
pub use relay_client::{HttpRelayClient, Relay, RelayClientError};
pub use render::{HttpRenderFetcher, RenderFetcher, RenderOutcome};

pub const CLOUDINARY_API_BASE_DEFAULT: &str = "https://api.cloudinary.com/v1_1";
const UPLOAD_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub handle: RemoteImageHandle,
}

/// Remote storage that accepts image bytes and hands back the id used to
/// address transformations of that image.
pub trait ImageHost: Send + Sync {
    fn name(&self) -> &str;
    fn upload(&self, request: &UploadRequest) -> Result<UploadResponse>;
}

#[derive(Default)]
pub struct ImageHostRegistry {
    hosts: BTreeMap<String, Arc<dyn ImageHost>>,
}

impl ImageHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: ImageHost + 'static>(&mut self, host: H) {
        self.hosts.insert(host.name().to_string(), Arc::new(host));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageHost>> {
        self.hosts.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }
}

pub fn default_host_registry() -> ImageHostRegistry {
    let mut hosts = ImageHostRegistry::new();
    hosts.register(DryrunHost);
    hosts.register(CloudinaryHost::new(CloudinaryConfig::from_env()));
    hosts
}

/// Offline host: derives a stable id from the uploaded bytes.
pub struct DryrunHost;

impl ImageHost for DryrunHost {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn upload(&self, request: &UploadRequest) -> Result<UploadResponse> {
        if request.bytes.is_empty() {
            bail!("Empty file");
        }
        let digest = hex::encode(Sha256::digest(&request.bytes));
        let public_id = format!("dryrun/{}", &digest[..16]);
        let handle = RemoteImageHandle::new(public_id).map_err(anyhow::Error::msg)?;
        Ok(UploadResponse { handle })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudinaryConfig {
    pub cloud_name: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_base: String,
    pub folder: Option<String>,
}

impl CloudinaryConfig {
    pub fn from_env() -> Self {
        Self {
            cloud_name: non_empty_env("CLOUDINARY_CLOUD_NAME"),
            api_key: non_empty_env("CLOUDINARY_API_KEY"),
            api_secret: non_empty_env("CLOUDINARY_API_SECRET"),
            api_base: non_empty_env("CLOUDINARY_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| CLOUDINARY_API_BASE_DEFAULT.to_string()),
            folder: non_empty_env("CLOUDINARY_UPLOAD_FOLDER"),
        }
    }
}

pub struct CloudinaryHost {
    config: CloudinaryConfig,
    http: HttpClient,
}

impl CloudinaryHost {
    pub fn new(config: CloudinaryConfig) -> Self {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self { config, http }
    }

    fn upload_endpoint(&self, cloud_name: &str) -> String {
        format!("{}/{}/image/upload", self.config.api_base, cloud_name)
    }

    fn signed_params(&self, timestamp: u64) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("timestamp".to_string(), timestamp.to_string());
        if let Some(folder) = &self.config.folder {
            params.insert("folder".to_string(), folder.clone());
        }
        params
    }
}

impl ImageHost for CloudinaryHost {
    fn name(&self) -> &str {
        "cloudinary"
    }

    fn upload(&self, request: &UploadRequest) -> Result<UploadResponse> {
        let Some(cloud_name) = self.config.cloud_name.as_deref() else {
            bail!("CLOUDINARY_CLOUD_NAME not set");
        };
        let Some(api_key) = self.config.api_key.as_deref() else {
            bail!("CLOUDINARY_API_KEY not set");
        };
        let Some(api_secret) = self.config.api_secret.as_deref() else {
            bail!("CLOUDINARY_API_SECRET not set");
        };

        let endpoint = self.upload_endpoint(cloud_name);
        let params = self.signed_params(timestamp_seconds());
        let signature = sign_params(&params, api_secret);

        let mut file_part = MultipartPart::bytes(request.bytes.clone())
            .file_name(request.file_name.clone().unwrap_or_else(|| "upload".to_string()));
        if let Some(mime) = request.mime_type.as_deref() {
            file_part = file_part
                .mime_str(mime)
                .with_context(|| format!("invalid upload mime type ({mime})"))?;
        }
        let mut form = MultipartForm::new()
            .part("file", file_part)
            .text("api_key", api_key.to_string())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");
        for (key, value) in &params {
            form = form.text(key.clone(), value.clone());
        }

        log::debug!(
            "uploading {} bytes to cloudinary cloud '{}'",
            request.bytes.len(),
            cloud_name
        );
        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("Cloudinary upload request failed ({endpoint})"))?;
        let status = response.status();
        let body = response
            .text()
            .context("Cloudinary response body read failed")?;
        let payload = serde_json::from_str::<Value>(&body).ok();
        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(service_error_message)
                .unwrap_or_else(|| {
                    format!(
                        "Cloudinary upload failed ({}): {}",
                        status.as_u16(),
                        truncate_text(&body, 512)
                    )
                });
            bail!("{message}");
        }
        let Some(payload) = payload else {
            bail!("Cloudinary returned invalid JSON payload");
        };
        let public_id = payload
            .get("public_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Cloudinary response missing public_id"))?;
        let handle = RemoteImageHandle::new(public_id).map_err(anyhow::Error::msg)?;
        Ok(UploadResponse { handle })
    }
}

/// Hex SHA-256 over `k=v` pairs joined by `&` in key order, followed by the
/// API secret.
pub fn sign_params(params: &BTreeMap<String, String>, api_secret: &str) -> String {
    let to_sign = params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn service_error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn request(bytes: &[u8]) -> UploadRequest {
        UploadRequest {
            bytes: bytes.to_vec(),
            file_name: Some("me.png".to_string()),
            mime_type: Some("image/png".to_string()),
        }
    }

    #[test]
    fn sign_params_hashes_sorted_pairs_with_secret() {
        let mut params = BTreeMap::new();
        params.insert("timestamp".to_string(), "1315060510".to_string());
        assert_eq!(
            sign_params(&params, "abcd"),
            "5652e549a70bdc03f73a633a23b7d3f3b067d72fff26dd15b25997f46fdf6439"
        );

        params.insert("folder".to_string(), "people".to_string());
        params.insert("tags".to_string(), String::new());
        assert_eq!(
            sign_params(&params, "abcd"),
            "271e4ef510510359119e1cd57ea36602dc55095b47f13d0ac9d1ae7c104fa505"
        );
    }

    #[test]
    fn dryrun_host_ids_are_content_addressed() -> Result<()> {
        let host = DryrunHost;
        let first = host.upload(&request(b"hello"))?;
        let second = host.upload(&request(b"hello"))?;
        assert_eq!(first.handle.public_id(), "dryrun/2cf24dba5fb0a30e");
        assert_eq!(first.handle, second.handle);
        Ok(())
    }

    #[test]
    fn dryrun_host_rejects_empty_upload() {
        let err = DryrunHost.upload(&request(b"")).err();
        assert_eq!(err.map(|err| err.to_string()), Some("Empty file".to_string()));
    }

    #[test]
    fn cloudinary_host_requires_credentials() {
        let host = CloudinaryHost::new(CloudinaryConfig {
            cloud_name: Some("demo".to_string()),
            api_base: CLOUDINARY_API_BASE_DEFAULT.to_string(),
            ..CloudinaryConfig::default()
        });
        let err = host.upload(&request(b"png")).err();
        assert_eq!(
            err.map(|err| err.to_string()),
            Some("CLOUDINARY_API_KEY not set".to_string())
        );
    }

    #[test]
    fn cloudinary_endpoint_uses_cloud_name() {
        let host = CloudinaryHost::new(CloudinaryConfig {
            api_base: "https://api.example.test/v1_1".to_string(),
            folder: Some("fashion".to_string()),
            ..CloudinaryConfig::default()
        });
        assert_eq!(
            host.upload_endpoint("demo"),
            "https://api.example.test/v1_1/demo/image/upload"
        );
        let params = host.signed_params(42);
        assert_eq!(params.get("timestamp").map(String::as_str), Some("42"));
        assert_eq!(params.get("folder").map(String::as_str), Some("fashion"));
    }

    #[test]
    fn service_error_message_prefers_nested_message() {
        assert_eq!(
            service_error_message(&json!({"error": {"message": "Invalid image file"}})),
            Some("Invalid image file".to_string())
        );
        assert_eq!(
            service_error_message(&json!({"error": "Rate limited"})),
            Some("Rate limited".to_string())
        );
        assert_eq!(service_error_message(&json!({"public_id": "x"})), None);
    }

    #[test]
    fn registry_lists_builtin_hosts() {
        let registry = default_host_registry();
        assert_eq!(registry.names(), vec!["cloudinary", "dryrun"]);
        assert!(registry.get("dryrun").is_some());
        assert!(registry.get("imgur").is_none());
    }

    #[test]
    fn error_chain_text_joins_causes() {
        let err = anyhow::anyhow!("connection refused").context("upload failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "upload failed | caused by: connection refused"
        );
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }
}
