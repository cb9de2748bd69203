use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;

use crate::descriptor::{HexColor, RemoteImageHandle, TransformDescriptor};
use crate::presets::{PresetId, STYLE_PRESETS};
use crate::retry::RetryPolicy;

pub const MISSING_FILE_MESSAGE: &str = "Please select an image to upload";
pub const UPLOAD_ERROR_PREFIX: &str = "Error uploading image: ";
pub const RENDER_ERROR_MESSAGE: &str = "Error loading image. Max retries reached.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: Option<String>,
}

impl SelectedFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("upload")
            .to_string();
        let mime_type = mime_for_path(&path).map(str::to_string);
        Self {
            path,
            file_name,
            mime_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Submitting,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderState {
    Rendering { attempt: u32 },
    RetryWait { attempt: u32 },
    Loaded,
    Abandoned { reason: String },
}

impl RenderState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Rendering { .. } | Self::RetryWait { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Rendering { .. } => "rendering",
            Self::RetryWait { .. } => "retry_wait",
            Self::Loaded => "loaded",
            Self::Abandoned { .. } => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderFailure {
    /// The remote service is still generating the variant (HTTP 423).
    RateLimited,
    Other(String),
}

/// Identifies one render sub-machine instance. Events carrying a key that no
/// longer matches the live sub-machine are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub session: SessionId,
    pub preset: PresetId,
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload {
        session: SessionId,
        file: SelectedFile,
    },
    Render {
        key: RenderKey,
        attempt: u32,
        descriptor: TransformDescriptor,
    },
    ScheduleRetry {
        key: RenderKey,
        attempt: u32,
        delay: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    MissingFile,
    NoActiveGeneration,
    NoSelection,
    StillRendering(PresetId),
    InvalidColor(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile => f.write_str(MISSING_FILE_MESSAGE),
            Self::NoActiveGeneration => f.write_str("No generated images yet."),
            Self::NoSelection => f.write_str("Select an image before changing its color."),
            Self::StillRendering(preset) => write!(f, "Image '{preset}' is still loading."),
            Self::InvalidColor(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ControllerError {}

#[derive(Debug, Clone)]
struct StyledRender {
    descriptor: TransformDescriptor,
    revision: u32,
    state: RenderState,
}

/// Upload and render lifecycle for one user.
///
/// Handlers only mutate local state and hand back the [`Command`]s the caller
/// must perform; results come back in through the matching handler.
#[derive(Debug, Clone)]
pub struct GenerationController {
    policy: RetryPolicy,
    last_session: u64,
    session: Option<SessionId>,
    upload: UploadState,
    handle: Option<RemoteImageHandle>,
    preview: Option<TransformDescriptor>,
    styled: IndexMap<PresetId, StyledRender>,
    selected: Option<PresetId>,
    error: Option<String>,
}

impl Default for GenerationController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl GenerationController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            last_session: 0,
            session: None,
            upload: UploadState::Idle,
            handle: None,
            preview: None,
            styled: IndexMap::new(),
            selected: None,
            error: None,
        }
    }

    pub fn select_file(&mut self, file: Option<SelectedFile>) -> Result<Command, ControllerError> {
        let Some(file) = file else {
            return Err(ControllerError::MissingFile);
        };
        self.last_session += 1;
        let session = SessionId(self.last_session);
        self.session = Some(session);
        self.upload = UploadState::Submitting;
        self.handle = None;
        self.preview = None;
        self.styled.clear();
        self.selected = None;
        self.error = None;
        Ok(Command::Upload { session, file })
    }

    pub fn upload_succeeded(
        &mut self,
        session: SessionId,
        handle: RemoteImageHandle,
    ) -> Vec<Command> {
        if !self.is_pending_upload(session) {
            return Vec::new();
        }
        self.upload = UploadState::Succeeded;
        self.error = None;
        self.preview = Some(TransformDescriptor::preview(handle.clone()));

        let mut commands = Vec::with_capacity(STYLE_PRESETS.len());
        for preset in &STYLE_PRESETS {
            let descriptor = TransformDescriptor::styled(handle.clone(), preset);
            let key = RenderKey {
                session,
                preset: preset.id,
                revision: 0,
            };
            commands.push(Command::Render {
                key,
                attempt: 0,
                descriptor: descriptor.clone(),
            });
            self.styled.insert(
                preset.id,
                StyledRender {
                    descriptor,
                    revision: 0,
                    state: RenderState::Rendering { attempt: 0 },
                },
            );
        }
        self.handle = Some(handle);
        commands
    }

    pub fn upload_failed(&mut self, session: SessionId, message: &str) -> bool {
        if !self.is_pending_upload(session) {
            return false;
        }
        let text = format!("{UPLOAD_ERROR_PREFIX}{message}");
        self.upload = UploadState::Failed(text.clone());
        self.error = Some(text);
        true
    }

    pub fn render_loaded(&mut self, key: RenderKey) -> bool {
        let Some(render) = self.live_render_mut(key) else {
            return false;
        };
        if !matches!(render.state, RenderState::Rendering { .. }) {
            return false;
        }
        render.state = RenderState::Loaded;
        true
    }

    pub fn render_failed(&mut self, key: RenderKey, failure: RenderFailure) -> Option<Command> {
        let policy = self.policy;
        let render = self.live_render_mut(key)?;
        let RenderState::Rendering { attempt } = render.state else {
            return None;
        };
        let reason = match failure {
            RenderFailure::RateLimited => match policy.next_delay(attempt) {
                Some(delay) => {
                    let next = attempt + 1;
                    render.state = RenderState::RetryWait { attempt: next };
                    return Some(Command::ScheduleRetry {
                        key,
                        attempt: next,
                        delay,
                    });
                }
                None => format!("still rate limited after {attempt} retries"),
            },
            RenderFailure::Other(message) => message,
        };
        render.state = RenderState::Abandoned { reason };
        self.error = Some(RENDER_ERROR_MESSAGE.to_string());
        None
    }

    pub fn retry_due(&mut self, key: RenderKey, attempt: u32) -> Option<Command> {
        let render = self.live_render_mut(key)?;
        match render.state {
            RenderState::RetryWait { attempt: waiting } if waiting == attempt => {
                render.state = RenderState::Rendering { attempt };
                Some(Command::Render {
                    key,
                    attempt,
                    descriptor: render.descriptor.clone(),
                })
            }
            _ => None,
        }
    }

    /// Opens the recolor selection on `preset`, or closes it when the same
    /// preset is already selected.
    pub fn select_image(&mut self, preset: PresetId) -> Result<Option<PresetId>, ControllerError> {
        let render = self
            .styled
            .get(&preset)
            .ok_or(ControllerError::NoActiveGeneration)?;
        if render.state.is_loading() {
            return Err(ControllerError::StillRendering(preset));
        }
        self.selected = if self.selected == Some(preset) {
            None
        } else {
            Some(preset)
        };
        Ok(self.selected)
    }

    pub fn close_selection(&mut self) {
        self.selected = None;
    }

    pub fn recolor_selected(&mut self, color: &str) -> Result<Command, ControllerError> {
        let preset = self.selected.ok_or(ControllerError::NoSelection)?;
        let command = self.recolor(preset, color)?;
        self.selected = None;
        Ok(command)
    }

    /// Appends a recolor of the preset's shirt to that preset's descriptor
    /// only and restarts its render.
    pub fn recolor(&mut self, preset: PresetId, color: &str) -> Result<Command, ControllerError> {
        let color = HexColor::parse(color).map_err(ControllerError::InvalidColor)?;
        let session = self.session.ok_or(ControllerError::NoActiveGeneration)?;
        let render = self
            .styled
            .get_mut(&preset)
            .ok_or(ControllerError::NoActiveGeneration)?;
        if render.state.is_loading() {
            return Err(ControllerError::StillRendering(preset));
        }
        render.descriptor.recolor(preset.preset().shirt, color);
        render.revision += 1;
        render.state = RenderState::Rendering { attempt: 0 };
        Ok(Command::Render {
            key: RenderKey {
                session,
                preset,
                revision: render.revision,
            },
            attempt: 0,
            descriptor: render.descriptor.clone(),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn upload_state(&self) -> &UploadState {
        &self.upload
    }

    pub fn handle(&self) -> Option<&RemoteImageHandle> {
        self.handle.as_ref()
    }

    pub fn preview(&self) -> Option<&TransformDescriptor> {
        self.preview.as_ref()
    }

    pub fn descriptor(&self, preset: PresetId) -> Option<&TransformDescriptor> {
        self.styled.get(&preset).map(|render| &render.descriptor)
    }

    pub fn render_state(&self, preset: PresetId) -> Option<&RenderState> {
        self.styled.get(&preset).map(|render| &render.state)
    }

    pub fn is_loading(&self, preset: PresetId) -> bool {
        self.styled
            .get(&preset)
            .map(|render| render.state.is_loading())
            .unwrap_or(false)
    }

    pub fn loading_statuses(&self) -> Vec<(PresetId, bool)> {
        self.styled
            .iter()
            .map(|(preset, render)| (*preset, render.state.is_loading()))
            .collect()
    }

    pub fn presets(&self) -> Vec<PresetId> {
        self.styled.keys().copied().collect()
    }

    pub fn selected(&self) -> Option<PresetId> {
        self.selected
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        self.upload != UploadState::Submitting
            && self.styled.values().all(|render| !render.state.is_loading())
    }

    fn is_pending_upload(&self, session: SessionId) -> bool {
        self.session == Some(session) && self.upload == UploadState::Submitting
    }

    fn live_render_mut(&mut self, key: RenderKey) -> Option<&mut StyledRender> {
        if self.session != Some(key.session) {
            return None;
        }
        self.styled
            .get_mut(&key.preset)
            .filter(|render| render.revision == key.revision)
    }
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}
