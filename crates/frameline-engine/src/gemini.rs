use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::backend::{
    send_json_with_retries, BackendError, GeneratedImage, GenerationRequest, GenerativeBackend,
    ImageData, ImageGenerator, TextRequest, TransportPolicy, VisionRequest,
};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const PROVIDER: &str = "gemini";

/// Google Gemini `generateContent` client: structured text, image analysis,
/// and image generation.
pub struct GeminiBackend {
    api_base: String,
    api_key: Option<String>,
    transport: TransportPolicy,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new(api_base: &str, api_key: Option<String>, transport: TransportPolicy) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_GEMINI_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            transport,
            http: HttpClient::new(),
        }
    }

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or(BackendError::MissingApiKey {
                provider: PROVIDER,
                hint: "set GEMINI_API_KEY or GOOGLE_API_KEY",
            })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn post(&self, model: &str, payload: &Value, timeout: Duration) -> Result<Value, BackendError> {
        let api_key = self.api_key()?;
        let endpoint = self.endpoint_for_model(model);
        send_json_with_retries(PROVIDER, self.transport, || {
            self.http
                .post(&endpoint)
                .query(&[("key", api_key)])
                .timeout(timeout)
                .json(payload)
                .send()
        })
    }

    fn json_payload(parts: Vec<Value>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
            },
        })
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "OFF",
            })
        })
        .collect()
    }
}

impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn generate_structured_text(&self, request: &TextRequest) -> Result<String, BackendError> {
        let payload = Self::json_payload(vec![json!({ "text": request.prompt })]);
        let response = self.post(&request.model, &payload, request.timeout)?;
        non_empty_text(extract_candidate_text(&response))
    }

    fn analyze_image(&self, request: &VisionRequest<'_>) -> Result<String, BackendError> {
        let payload = Self::json_payload(vec![
            inline_image_part(request.image),
            json!({ "text": request.prompt }),
        ]);
        let response = self.post(&request.model, &payload, request.timeout)?;
        non_empty_text(extract_candidate_text(&response))
    }
}

impl ImageGenerator for GeminiBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedImage> {
        let mut parts: Vec<Value> = request
            .reference_images
            .iter()
            .map(inline_image_part)
            .collect();
        parts.push(json!({ "text": request.prompt }));
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
            },
            "safetySettings": Self::default_safety_settings(),
        });

        let response = self
            .post(&request.model, &payload, request.timeout)
            .context("Gemini image generation failed")?;
        let mut images = extract_inline_images(&response)?;
        if images.is_empty() {
            bail!("Gemini returned no images");
        }
        let image = images.remove(0);

        let mut provider_metadata = Map::new();
        provider_metadata.insert("provider".to_string(), json!(PROVIDER));
        provider_metadata.insert("model".to_string(), json!(request.model));
        provider_metadata.insert(
            "reference_images".to_string(),
            json!(request.reference_images.len()),
        );
        provider_metadata.insert(
            "usage_metadata".to_string(),
            response.get("usageMetadata").cloned().unwrap_or(Value::Null),
        );
        let mut warnings = Vec::new();
        if !images.is_empty() {
            warnings.push(format!(
                "Gemini returned {} extra image(s); kept the first.",
                images.len()
            ));
        }
        Ok(GeneratedImage {
            image,
            provider_metadata,
            warnings,
        })
    }
}

fn inline_image_part(image: &ImageData) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.base64(),
        }
    })
}

fn candidate_parts(response: &Value) -> Vec<Value> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

fn extract_candidate_text(response: &Value) -> String {
    candidate_parts(response)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}

fn extract_inline_images(response: &Value) -> anyhow::Result<Vec<ImageData>> {
    let mut out = Vec::new();
    for part in candidate_parts(response) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        out.push(ImageData::new(bytes, mime_type));
    }
    Ok(out)
}

fn non_empty_text(text: String) -> Result<String, BackendError> {
    if text.trim().is_empty() {
        return Err(BackendError::EmptyResponse { provider: PROVIDER });
    }
    Ok(text)
}
