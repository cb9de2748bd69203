use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fashionista_contracts::events::{new_session_id, EventPayload, EventWriter};
use fashionista_engine::relay_client::{RELAY_ENDPOINT_PATH, RELAY_FIELD_NAME};
use fashionista_engine::{ImageHost, UploadRequest};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_STATIC_DIR: &str = "public";
pub const DEFAULT_BODY_LIMIT: usize = 20 * 1024 * 1024;
pub const MISSING_IMAGE_MESSAGE: &str = "Image file is required";

#[derive(Clone)]
pub struct RelayState {
    host: Arc<dyn ImageHost>,
    events: EventWriter,
}

impl RelayState {
    pub fn new(host: Arc<dyn ImageHost>, events: EventWriter) -> Self {
        Self { host, events }
    }
}

#[derive(Debug)]
pub enum RelayError {
    MissingImage,
    UnexpectedField(String),
    Multipart { status: StatusCode, message: String },
    Upload(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingImage | Self::UnexpectedField(_) => StatusCode::BAD_REQUEST,
            Self::Multipart { status, .. } => *status,
            Self::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingImage => f.write_str(MISSING_IMAGE_MESSAGE),
            Self::UnexpectedField(name) => write!(f, "Unexpected field '{name}'"),
            Self::Multipart { message, .. } | Self::Upload(message) => f.write_str(message),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: RelayState, static_dir: &Path, body_limit: usize) -> Router {
    Router::new()
        .route(RELAY_ENDPOINT_PATH, post(generate))
        .layer(DefaultBodyLimit::max(body_limit))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn generate(
    State(state): State<RelayState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, RelayError> {
    let mut multipart = multipart.map_err(|rejection| {
        log::debug!("rejecting non-multipart upload: {rejection}");
        RelayError::MissingImage
    })?;
    let mut upload: Option<UploadRequest> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| RelayError::Multipart {
            status: err.status(),
            message: err.body_text(),
        })?
    {
        if field.name() != Some(RELAY_FIELD_NAME) || field.file_name().is_none() {
            continue;
        }
        if upload.is_some() {
            return Err(RelayError::UnexpectedField(RELAY_FIELD_NAME.to_string()));
        }
        let file_name = field.file_name().map(str::to_string);
        let mime_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|err| RelayError::Multipart {
            status: err.status(),
            message: err.body_text(),
        })?;
        upload = Some(UploadRequest {
            bytes: bytes.to_vec(),
            file_name,
            mime_type,
        });
    }
    let Some(request) = upload else {
        return Err(RelayError::MissingImage);
    };

    let events = state.events.for_session(new_session_id());
    emit(
        &events,
        "upload_received",
        json!({
            "host": state.host.name(),
            "bytes": request.bytes.len(),
            "file_name": request.file_name,
        }),
    );

    let host = Arc::clone(&state.host);
    let result = tokio::task::spawn_blocking(move || host.upload(&request))
        .await
        .map_err(|err| RelayError::Upload(format!("upload task failed: {err}")))?;
    match result {
        Ok(response) => {
            let public_id = response.handle.public_id().to_string();
            log::info!("uploaded image as '{public_id}'");
            emit(&events, "upload_completed", json!({ "public_id": public_id }));
            Ok(Json(json!({ "public_id": public_id })))
        }
        Err(err) => {
            log::error!("{} error: {err:#}", state.host.name());
            emit(&events, "upload_failed", json!({ "error": format!("{err:#}") }));
            Err(RelayError::Upload(format!("{err:#}")))
        }
    }
}

fn emit(events: &EventWriter, event_type: &str, payload: Value) {
    let payload = payload.as_object().cloned().unwrap_or_else(EventPayload::new);
    if let Err(err) = events.emit(event_type, payload) {
        log::warn!("failed writing {event_type} event: {err:#}");
    }
}

pub struct ServeConfig {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
    pub body_limit: usize,
    pub host: Arc<dyn ImageHost>,
    pub events: EventWriter,
}

pub fn serve(config: ServeConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed building tokio runtime")?;
    let app = router(
        RelayState::new(config.host, config.events),
        &config.static_dir,
        config.body_limit,
    );
    let bind = config.bind;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed binding {bind}"))?;
        log::info!("Server is running on port {}", bind.port());
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                log::info!("shutting down");
            })
            .await
            .context("relay server failed")?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use fashionista_contracts::controller::SelectedFile;
    use fashionista_contracts::descriptor::RemoteImageHandle;
    use fashionista_contracts::events::EventWriter;
    use fashionista_engine::relay_client::{HttpRelayClient, Relay, RelayClientError};
    use fashionista_engine::{ImageHost, UploadRequest, UploadResponse};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, RelayState, DEFAULT_BODY_LIMIT};

    const BOUNDARY: &str = "fashionista-boundary";

    struct FakeHost {
        calls: AtomicUsize,
        failure: Option<String>,
        context: Option<String>,
    }

    impl FakeHost {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failure: None,
                context: None,
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failure: Some(message.to_string()),
                context: None,
            })
        }

        fn failing_with_context(context: &str, cause: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failure: Some(cause.to_string()),
                context: Some(context.to_string()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ImageHost for FakeHost {
        fn name(&self) -> &str {
            "fake"
        }

        fn upload(&self, request: &UploadRequest) -> anyhow::Result<UploadResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.failure {
                let err = anyhow!("{message}");
                return Err(match &self.context {
                    Some(context) => err.context(context.clone()),
                    None => err,
                });
            }
            Ok(UploadResponse {
                handle: RemoteImageHandle::new(format!("fake/{}", request.bytes.len()))
                    .map_err(anyhow::Error::msg)?,
            })
        }
    }

    fn app(host: Arc<FakeHost>, static_dir: &std::path::Path) -> axum::Router {
        router(
            RelayState::new(host, EventWriter::disabled()),
            static_dir,
            DEFAULT_BODY_LIMIT,
        )
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/generate")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap_or_else(|err| panic!("{err}"))
    }

    async fn json_body(response: axum::response::Response) -> anyhow::Result<Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn upload_returns_only_public_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::ok();
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[(
                "image",
                Some("me.png"),
                b"pngbytes",
            )])))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?, json!({ "public_id": "fake/8" }));
        assert_eq!(host.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_image_is_rejected_without_remote_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::ok();
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[(
                "avatar",
                Some("me.png"),
                b"pngbytes",
            )])))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await?,
            json!({ "error": "Image file is required" })
        );
        assert_eq!(host.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn text_field_named_image_is_not_a_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::ok();
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[("image", None, b"hello")])))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(host.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn second_image_field_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::ok();
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[
                ("image", Some("a.png"), b"a"),
                ("image", Some("b.png"), b"b"),
            ])))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(host.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn remote_failure_maps_to_server_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::failing("Invalid image file");
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[(
                "image",
                Some("me.png"),
                b"nope",
            )])))
            .await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await?,
            json!({ "error": "Invalid image file" })
        );
        assert_eq!(host.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn non_multipart_posts_get_json_missing_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::ok();
        let requests = [
            (None, ""),
            (Some("application/json"), "{}"),
            (Some("multipart/form-data"), ""),
        ];
        for (content_type, body) in requests {
            let mut request = Request::builder().method("POST").uri("/api/generate");
            if let Some(content_type) = content_type {
                request = request.header("content-type", content_type);
            }
            let request = request
                .body(Body::from(body))
                .unwrap_or_else(|err| panic!("{err}"));
            let response = app(Arc::clone(&host), temp.path()).oneshot(request).await?;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{content_type:?}");
            assert_eq!(
                json_body(response).await?,
                json!({ "error": "Image file is required" })
            );
        }
        assert_eq!(host.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn remote_failure_keeps_underlying_cause() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let host = FakeHost::failing_with_context(
            "Cloudinary upload request failed (https://api.cloudinary.com/v1_1/demo/image/upload)",
            "connection refused",
        );
        let response = app(Arc::clone(&host), temp.path())
            .oneshot(upload_request(multipart_body(&[(
                "image",
                Some("me.png"),
                b"pngbytes",
            )])))
            .await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await?,
            json!({
                "error": "Cloudinary upload request failed (https://api.cloudinary.com/v1_1/demo/image/upload): connection refused"
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn static_site_is_served_at_root() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("index.html"), "<h1>Fashionista AI</h1>")?;
        let response = app(FakeHost::ok(), temp.path())
            .oneshot(
                Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap_or_else(|err| panic!("{err}")),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(bytes.as_ref(), b"<h1>Fashionista AI</h1>");
        Ok(())
    }

    fn spawn_relay(host: Arc<FakeHost>, static_dir: std::path::PathBuf) -> anyhow::Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap_or_else(|err| panic!("{err}"));
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener)
                    .unwrap_or_else(|err| panic!("{err}"));
                let _ = axum::serve(listener, app(host, &static_dir)).await;
            });
        });
        Ok(format!("http://{addr}"))
    }

    #[test]
    fn client_surfaces_relay_failure_verbatim() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("me.png");
        std::fs::write(&image_path, b"not really a png")?;
        let server = spawn_relay(
            FakeHost::failing("Resource not found - upload preset"),
            temp.path().to_path_buf(),
        )?;

        let client = HttpRelayClient::new(&server)?;
        let err = client.upload(&SelectedFile::from_path(&image_path)).err();
        assert_eq!(
            err,
            Some(RelayClientError::Server {
                status: 500,
                message: "Resource not found - upload preset".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn client_receives_public_id_from_relay() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("me.png");
        std::fs::write(&image_path, b"1234")?;
        let host = FakeHost::ok();
        let server = spawn_relay(Arc::clone(&host), temp.path().to_path_buf())?;

        let handle = HttpRelayClient::new(&server)?.upload(&SelectedFile::from_path(&image_path))?;
        assert_eq!(handle.public_id(), "fake/4");
        assert_eq!(host.calls(), 1);
        Ok(())
    }
}
