use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::Response as HttpResponse;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::json::truncate_text;

/// Encoded image plus its mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::new(bytes, mime_for_path(path)))
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }

    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        "png"
    }

    /// Flattens alpha onto white, downsizes to `max_dim` and re-encodes as
    /// JPEG for vision requests. Undecodable input is passed through as-is.
    pub fn prepared_for_vision(&self, max_dim: u32) -> ImageData {
        let dim = max_dim.max(128);
        let Ok(decoded) = image::load_from_memory(&self.bytes) else {
            return self.clone();
        };
        let rgba = decoded.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let flattened = DynamicImage::ImageRgba8(flattened);
        let resized = if flattened.width() > dim || flattened.height() > dim {
            flattened.resize(dim, dim, FilterType::Triangle)
        } else {
            flattened
        };
        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), 90);
        match DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder) {
            Ok(()) => ImageData::new(bytes, "image/jpeg"),
            Err(_) => self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub model: String,
    pub image: &'a ImageData,
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub reference_images: Vec<ImageData>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: ImageData,
    pub provider_metadata: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{provider} api key not set ({hint})")]
    MissingApiKey {
        provider: &'static str,
        hint: &'static str,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} request failed ({code}): {body}")]
    Status {
        provider: &'static str,
        code: u16,
        body: String,
    },
    #[error("{provider} returned no usable output")]
    EmptyResponse { provider: &'static str },
    #[error("{provider} returned an invalid payload: {detail}")]
    InvalidPayload {
        provider: &'static str,
        detail: String,
    },
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Text and vision calls used by planning and verification.
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate_structured_text(&self, request: &TextRequest) -> Result<String, BackendError>;
    fn analyze_image(&self, request: &VisionRequest<'_>) -> Result<String, BackendError>;
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedImage>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportPolicy {
    pub retries: usize,
    pub backoff: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(1200),
        }
    }
}

impl TransportPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Sends with linear backoff on transient failures and returns the decoded
/// JSON body of the first response that is not retried.
pub(crate) fn send_json_with_retries(
    provider: &'static str,
    policy: TransportPolicy,
    mut send: impl FnMut() -> reqwest::Result<HttpResponse>,
) -> Result<Value, BackendError> {
    let mut attempt = 0usize;
    loop {
        let result = send()
            .map_err(|source| BackendError::Transport { provider, source })
            .and_then(|response| response_json_or_error(provider, response));
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                tracing::debug!(
                    provider,
                    attempt,
                    max = policy.retries,
                    error = %err,
                    "transient backend failure, retrying"
                );
                thread::sleep(policy.backoff.mul_f64(attempt as f64));
            }
            Err(err) => return Err(err),
        }
    }
}

fn response_json_or_error(
    provider: &'static str,
    response: HttpResponse,
) -> Result<Value, BackendError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|source| BackendError::Transport { provider, source })?;
    if !status.is_success() {
        return Err(BackendError::Status {
            provider,
            code,
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| BackendError::InvalidPayload {
        provider,
        detail: err.to_string(),
    })
}

/// Backends and image generators keyed by provider name.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerativeBackend>>,
    generators: BTreeMap<String, Arc<dyn ImageGenerator>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_backend(&mut self, backend: Arc<dyn GenerativeBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn register_generator(&mut self, generator: Arc<dyn ImageGenerator>) {
        self.generators
            .insert(generator.name().to_string(), generator);
    }

    pub fn backend(&self, provider: &str) -> Option<Arc<dyn GenerativeBackend>> {
        self.backends.get(provider).cloned()
    }

    pub fn generator(&self, provider: &str) -> Option<Arc<dyn ImageGenerator>> {
        self.generators.get(provider).cloned()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn generator_names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::{mime_for_path, BackendError, ImageData};

    fn png_bytes(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 128]));
        let mut bytes = Vec::new();
        image.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    #[test]
    fn mime_guess_uses_extension() {
        assert_eq!(mime_for_path(Path::new("a/b.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("a/b.webp")), "image/webp");
        assert_eq!(mime_for_path(Path::new("a/b")), "image/png");
    }

    #[test]
    fn prepared_for_vision_downsizes_and_reencodes() -> anyhow::Result<()> {
        let original = ImageData::new(png_bytes(600, 300)?, "image/png");
        let prepared = original.prepared_for_vision(200);
        assert_eq!(prepared.mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&prepared.bytes)?;
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 100);
        Ok(())
    }

    #[test]
    fn prepared_for_vision_passes_through_undecodable_bytes() {
        let original = ImageData::new(b"not an image".to_vec(), "image/png");
        assert_eq!(original.prepared_for_vision(512), original);
    }

    #[test]
    fn data_url_and_digest_are_stable() {
        let image = ImageData::new(b"abc".to_vec(), "image/png");
        assert_eq!(image.data_url(), "data:image/png;base64,YWJj");
        assert_eq!(
            image.sha256_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ImageData::new(Vec::new(), "image/jpeg").extension(), "jpg");
    }

    #[test]
    fn only_transient_statuses_are_retryable() {
        let throttled = BackendError::Status {
            provider: "gemini",
            code: 429,
            body: String::new(),
        };
        let rejected = BackendError::Status {
            provider: "gemini",
            code: 401,
            body: String::new(),
        };
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!BackendError::EmptyResponse { provider: "gemini" }.is_retryable());
    }
}
