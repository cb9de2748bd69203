use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresetId {
    BusinessCasual,
    Sporty,
    Streetwear,
    Elegant,
}

impl PresetId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusinessCasual => "business-casual",
            Self::Sporty => "sporty",
            Self::Streetwear => "streetwear",
            Self::Elegant => "elegant",
        }
    }

    pub fn preset(self) -> &'static StylePreset {
        STYLE_PRESETS
            .iter()
            .find(|preset| preset.id == self)
            .unwrap_or(&STYLE_PRESETS[0])
    }
}

impl fmt::Display for PresetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresetId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        STYLE_PRESETS
            .iter()
            .map(|preset| preset.id)
            .find(|id| id.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown style preset '{}'. Expected one of: {}.",
                    raw.trim(),
                    STYLE_PRESETS
                        .iter()
                        .map(|preset| preset.id.as_str())
                        .collect::<Vec<&str>>()
                        .join(", ")
                )
            })
    }
}

/// Default garments and backdrop for one generated variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylePreset {
    pub id: PresetId,
    pub shirt: &'static str,
    pub pants: &'static str,
    pub background: &'static str,
}

pub static STYLE_PRESETS: [StylePreset; 4] = [
    StylePreset {
        id: PresetId::BusinessCasual,
        shirt: "suit jacket for upper body",
        pants: "suit pants for lower body",
        background: "office",
    },
    StylePreset {
        id: PresetId::Sporty,
        shirt: "sport tshirt for upper body",
        pants: "sport shorts for lower body",
        background: "gym",
    },
    StylePreset {
        id: PresetId::Streetwear,
        shirt: "streetwear shirt for upper body",
        pants: "streetwear pants for lower body",
        background: "street",
    },
    StylePreset {
        id: PresetId::Elegant,
        shirt: "elegant tuxedo for upper body",
        pants: "elegant tuxedo pants for lower body",
        background: "gala",
    },
];
