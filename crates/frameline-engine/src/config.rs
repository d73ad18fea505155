use std::time::Duration;

use crate::backend::TransportPolicy;
use crate::gemini::DEFAULT_GEMINI_API_BASE;
use crate::openai::DEFAULT_OPENAI_API_BASE;

pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_VISION_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const DEFAULT_TEXT_TIMEOUT_S: u64 = 60;
const DEFAULT_VISION_TIMEOUT_S: u64 = 45;
const DEFAULT_IMAGE_TIMEOUT_S: u64 = 120;
const DEFAULT_TRANSPORT_RETRIES: usize = 2;
const MAX_TRANSPORT_RETRIES: usize = 4;
const DEFAULT_MAX_CORRECTIONS: u32 = 1;

/// Engine settings resolved from the environment. CLI flags override
/// individual fields after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub text_model: String,
    pub vision_model: String,
    pub image_model: String,
    pub text_timeout: Duration,
    pub vision_timeout: Duration,
    pub image_timeout: Duration,
    pub transport: TransportPolicy,
    pub max_corrections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first_non_empty = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };
        let seconds = |key: &str, default: u64| -> Duration {
            let value = first_non_empty(&[key])
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default);
            Duration::from_secs(value)
        };

        let retries = first_non_empty(&["FRAMELINE_TRANSPORT_RETRIES"])
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TRANSPORT_RETRIES)
            .min(MAX_TRANSPORT_RETRIES);

        Self {
            gemini_api_key: first_non_empty(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
            gemini_api_base: first_non_empty(&["GEMINI_API_BASE"])
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            openai_api_key: first_non_empty(&["OPENAI_API_KEY"]),
            openai_api_base: first_non_empty(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
                .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string()),
            text_model: first_non_empty(&["FRAMELINE_TEXT_MODEL"])
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            vision_model: first_non_empty(&["FRAMELINE_VISION_MODEL"])
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            image_model: first_non_empty(&["FRAMELINE_IMAGE_MODEL"])
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            text_timeout: seconds("FRAMELINE_TEXT_TIMEOUT", DEFAULT_TEXT_TIMEOUT_S),
            vision_timeout: seconds("FRAMELINE_VISION_TIMEOUT", DEFAULT_VISION_TIMEOUT_S),
            image_timeout: seconds("FRAMELINE_IMAGE_TIMEOUT", DEFAULT_IMAGE_TIMEOUT_S),
            transport: TransportPolicy {
                retries,
                ..TransportPolicy::default()
            },
            max_corrections: first_non_empty(&["FRAMELINE_MAX_CORRECTIONS"])
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(DEFAULT_MAX_CORRECTIONS),
        }
    }
}
