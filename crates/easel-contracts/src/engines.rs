use serde::{Deserialize, Serialize};

pub const HORDE: &str = "horde";
pub const CRAIYON: &str = "craiyon";
pub const HUGGINGFACE: &str = "huggingface";
pub const DRYRUN: &str = "dryrun";

/// The engines a user can select for their session. Craiyon is reachable
/// only as horde's fallback, dryrun only through offline registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Horde,
    Huggingface,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Horde => HORDE,
            EngineKind::Huggingface => HUGGINGFACE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Horde => "Stable Horde",
            EngineKind::Huggingface => "HuggingFace SD",
        }
    }

    /// Accepts the identifiers a chat user is likely to type.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "horde" | "stablehorde" | "stable_horde" => Some(EngineKind::Horde),
            "huggingface" | "hf" | "hugging_face" => Some(EngineKind::Huggingface),
            _ => None,
        }
    }

    /// The engine tried once after this one fails, if any.
    pub fn fallback(self) -> Option<&'static str> {
        match self {
            EngineKind::Horde => Some(CRAIYON),
            EngineKind::Huggingface => None,
        }
    }

    pub fn all() -> &'static [EngineKind] {
        &[EngineKind::Horde, EngineKind::Huggingface]
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Horde
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
