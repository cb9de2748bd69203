use std::fmt;

use crate::presets::StylePreset;

pub const PREVIEW_SIZE: u32 = 508;
pub const STYLED_SIZE: u32 = 500;

/// Identifier the remote image service assigned to an uploaded original.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteImageHandle(String);

impl RemoteImageHandle {
    pub fn new(public_id: impl Into<String>) -> Result<Self, String> {
        let public_id = public_id.into().trim().to_string();
        if public_id.is_empty() {
            return Err("Remote image handle must not be empty.".to_string());
        }
        Ok(Self(public_id))
    }

    pub fn public_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Six digit RGB color, stored lower-case without the leading `#`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexColor(String);

impl HexColor {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(format!(
                "Invalid color '{trimmed}'. Expected a hex color like #1a2b3c."
            ));
        }
        Ok(Self(digits.to_ascii_lowercase()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    GenerativeReplace { from: String, to: String },
    GenerativeBackgroundReplace { prompt: String },
    GenerativeRestore,
    GenerativeRecolor { prompt: String, to_color: HexColor },
}

impl Effect {
    pub fn component(&self) -> String {
        match self {
            Self::GenerativeReplace { from, to } => format!("e_gen_replace:from_{from};to_{to}"),
            Self::GenerativeBackgroundReplace { prompt } => {
                format!("e_gen_background_replace:prompt_{prompt}")
            }
            Self::GenerativeRestore => "e_gen_restore".to_string(),
            Self::GenerativeRecolor { prompt, to_color } => format!(
                "e_gen_recolor:prompt_{prompt};to-color_{}",
                to_color.as_hex()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub mode: ResizeMode,
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn fill(width: u32, height: u32) -> Self {
        Self {
            mode: ResizeMode::Fill,
            width,
            height,
        }
    }

    pub fn component(&self) -> String {
        let crop = match self.mode {
            ResizeMode::Fill => "fill",
        };
        format!("c_{crop},h_{},w_{}", self.height, self.width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformAction {
    Effect(Effect),
    Resize(Resize),
}

impl TransformAction {
    pub fn component(&self) -> String {
        match self {
            Self::Effect(effect) => effect.component(),
            Self::Resize(resize) => resize.component(),
        }
    }
}

/// Ordered list of remote transformations applied to one uploaded image.
///
/// Order is significant: the remote service applies each action to the output
/// of the previous one, so actions are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformDescriptor {
    handle: RemoteImageHandle,
    actions: Vec<TransformAction>,
}

impl TransformDescriptor {
    pub fn new(handle: RemoteImageHandle) -> Self {
        Self {
            handle,
            actions: Vec::new(),
        }
    }

    pub fn preview(handle: RemoteImageHandle) -> Self {
        let mut descriptor = Self::new(handle);
        descriptor.resize(Resize::fill(PREVIEW_SIZE, PREVIEW_SIZE));
        descriptor
    }

    pub fn styled(handle: RemoteImageHandle, preset: &StylePreset) -> Self {
        let mut descriptor = Self::new(handle);
        descriptor.effect(Effect::GenerativeReplace {
            from: "shirt".to_string(),
            to: preset.shirt.to_string(),
        });
        descriptor.effect(Effect::GenerativeReplace {
            from: "pants".to_string(),
            to: preset.pants.to_string(),
        });
        descriptor.effect(Effect::GenerativeBackgroundReplace {
            prompt: preset.background.to_string(),
        });
        descriptor.effect(Effect::GenerativeRestore);
        descriptor.resize(Resize::fill(STYLED_SIZE, STYLED_SIZE));
        descriptor
    }

    pub fn effect(&mut self, effect: Effect) -> &mut Self {
        self.actions.push(TransformAction::Effect(effect));
        self
    }

    pub fn resize(&mut self, resize: Resize) -> &mut Self {
        self.actions.push(TransformAction::Resize(resize));
        self
    }

    pub fn recolor(&mut self, prompt: impl Into<String>, to_color: HexColor) -> &mut Self {
        self.effect(Effect::GenerativeRecolor {
            prompt: prompt.into(),
            to_color,
        })
    }

    pub fn handle(&self) -> &RemoteImageHandle {
        &self.handle
    }

    pub fn components(&self) -> Vec<String> {
        self.actions.iter().map(TransformAction::component).collect()
    }
}
