use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body position of a character. Anything the model says that is not one of
/// the known values collapses to `Unknown` at the parse boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Position {
    LyingFaceDown,
    LyingOnBack,
    Kneeling,
    Standing,
    Sitting,
    Crouching,
    #[default]
    Unknown,
}

impl Position {
    pub const ALL: [Position; 7] = [
        Position::LyingFaceDown,
        Position::LyingOnBack,
        Position::Kneeling,
        Position::Standing,
        Position::Sitting,
        Position::Crouching,
        Position::Unknown,
    ];

    pub fn parse(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "lying_face_down" | "face_down" | "prone" => Self::LyingFaceDown,
            "lying_on_back" | "on_back" | "supine" => Self::LyingOnBack,
            "kneeling" => Self::Kneeling,
            "standing" => Self::Standing,
            "sitting" | "seated" => Self::Sitting,
            "crouching" | "squatting" => Self::Crouching,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LyingFaceDown => "lying_face_down",
            Self::LyingOnBack => "lying_on_back",
            Self::Kneeling => "kneeling",
            Self::Standing => "standing",
            Self::Sitting => "sitting",
            Self::Crouching => "crouching",
            Self::Unknown => "unknown",
        }
    }

    /// Upper-case, space separated form used in prompt directives.
    pub fn directive_label(&self) -> String {
        spaced(self.as_str()).to_ascii_uppercase()
    }
}

impl From<String> for Position {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Position> for String {
    fn from(value: Position) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CameraAngle {
    #[default]
    EyeLevel,
    LowAngle,
    HighAngle,
    BirdsEye,
    Dutch,
    OverTheShoulder,
    Other(String),
}

impl CameraAngle {
    pub fn parse(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "" | "eye_level" => Self::EyeLevel,
            "low_angle" | "low" => Self::LowAngle,
            "high_angle" | "high" => Self::HighAngle,
            "birds_eye" | "bird's_eye" | "overhead" | "top_down" => Self::BirdsEye,
            "dutch" | "dutch_angle" => Self::Dutch,
            "over_the_shoulder" => Self::OverTheShoulder,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EyeLevel => "eye_level",
            Self::LowAngle => "low_angle",
            Self::HighAngle => "high_angle",
            Self::BirdsEye => "birds_eye",
            Self::Dutch => "dutch",
            Self::OverTheShoulder => "over_the_shoulder",
            Self::Other(text) => text.as_str(),
        }
    }
}

impl From<String> for CameraAngle {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<CameraAngle> for String {
    fn from(value: CameraAngle) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CameraDistance {
    ExtremeCloseUp,
    CloseUp,
    #[default]
    Medium,
    MediumWide,
    Wide,
    ExtremeWide,
    Other(String),
}

impl CameraDistance {
    pub fn parse(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "extreme_close_up" | "extreme_closeup" => Self::ExtremeCloseUp,
            "close_up" | "closeup" | "close" => Self::CloseUp,
            "" | "medium" | "medium_shot" | "mid" => Self::Medium,
            "medium_wide" | "medium_long" => Self::MediumWide,
            "wide" | "wide_shot" | "long" => Self::Wide,
            "extreme_wide" | "establishing" => Self::ExtremeWide,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ExtremeCloseUp => "extreme_close_up",
            Self::CloseUp => "close_up",
            Self::Medium => "medium",
            Self::MediumWide => "medium_wide",
            Self::Wide => "wide",
            Self::ExtremeWide => "extreme_wide",
            Self::Other(text) => text.as_str(),
        }
    }
}

impl From<String> for CameraDistance {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<CameraDistance> for String {
    fn from(value: CameraDistance) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CameraMovement {
    #[default]
    Static,
    Pan,
    Tilt,
    Dolly,
    Tracking,
    Zoom,
    Handheld,
    Other(String),
}

impl CameraMovement {
    pub fn parse(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "" | "static" | "still" | "locked_off" => Self::Static,
            "pan" => Self::Pan,
            "tilt" => Self::Tilt,
            "dolly" | "push_in" | "pull_out" => Self::Dolly,
            "tracking" | "track" => Self::Tracking,
            "zoom" => Self::Zoom,
            "handheld" => Self::Handheld,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Static => "static",
            Self::Pan => "pan",
            Self::Tilt => "tilt",
            Self::Dolly => "dolly",
            Self::Tracking => "tracking",
            Self::Zoom => "zoom",
            Self::Handheld => "handheld",
            Self::Other(text) => text.as_str(),
        }
    }
}

impl From<String> for CameraMovement {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<CameraMovement> for String {
    fn from(value: CameraMovement) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterState {
    pub name: String,
    pub position: Position,
    pub props: Vec<String>,
    pub orientation: String,
    pub action: String,
}

impl CharacterState {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
            ..Self::default()
        }
    }

    /// Trims every field and drops blank or repeated props, keeping the
    /// first occurrence of each (case-insensitive).
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.orientation = self.orientation.trim().to_string();
        self.action = self.action.trim().to_string();
        let mut seen: Vec<String> = Vec::new();
        let mut props = Vec::new();
        for prop in self.props {
            let text = prop.trim().to_string();
            if text.is_empty() {
                continue;
            }
            let key = text.to_ascii_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            props.push(text);
        }
        self.props = props;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentState {
    pub location: String,
    pub time_of_day: String,
    pub lighting: String,
    pub weather: String,
    pub key_objects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraState {
    pub angle: CameraAngle,
    pub distance: CameraDistance,
    pub movement: CameraMovement,
}

/// Immutable description of what one generated image is expected to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneStateSnapshot {
    pub scene_id: String,
    pub voice_over_text: String,
    #[serde(default)]
    pub characters: Vec<CharacterState>,
    #[serde(default)]
    pub environment: EnvironmentState,
    #[serde(default)]
    pub camera: CameraState,
    #[serde(default)]
    pub critical_elements: Vec<String>,
    #[serde(default)]
    pub verification_checklist: Vec<String>,
}

impl SceneStateSnapshot {
    pub fn character(&self, name: &str) -> Option<&CharacterState> {
        self.characters
            .iter()
            .find(|character| character.name.eq_ignore_ascii_case(name.trim()))
    }
}

/// Per-group information the planner needs alongside the previous state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupContext {
    pub location_anchor: String,
    pub character_descriptions: String,
    pub is_first_in_group: bool,
}

/// `scene-<unix millis>-<8 hex chars>`; unique per call.
pub fn new_scene_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("scene-{millis}-{}", &suffix[..8])
}

/// Replaces underscores with spaces.
pub fn spaced(value: &str) -> String {
    value.replace('_', " ")
}

fn normalize_token(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .split(|ch: char| ch.is_whitespace() || ch == '-' || ch == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<&str>>()
        .join("_")
}
