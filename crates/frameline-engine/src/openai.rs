use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::backend::{
    send_json_with_retries, BackendError, GenerativeBackend, TextRequest, TransportPolicy,
    VisionRequest,
};

pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const PROVIDER: &str = "openai";
const DEFAULT_RESPONSES_MODEL: &str = "gpt-4o-mini";
const MAX_OUTPUT_TOKENS: u64 = 2000;

/// OpenAI Responses API client for planning and verification calls.
pub struct OpenAiBackend {
    api_base: String,
    api_key: Option<String>,
    transport: TransportPolicy,
    http: HttpClient,
}

impl OpenAiBackend {
    pub fn new(api_base: &str, api_key: Option<String>, transport: TransportPolicy) -> Self {
        Self {
            api_base: normalize_api_base(api_base),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            transport,
            http: HttpClient::new(),
        }
    }

    fn respond(
        &self,
        model: &str,
        content: Vec<Value>,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let api_key = self.api_key.as_deref().ok_or(BackendError::MissingApiKey {
            provider: PROVIDER,
            hint: "set OPENAI_API_KEY",
        })?;
        let endpoint = format!("{}/responses", self.api_base);
        let payload = json!({
            "model": sanitize_responses_model(model),
            "input": [{
                "role": "user",
                "content": content,
            }],
            "text": {"format": {"type": "json_object"}},
            "max_output_tokens": MAX_OUTPUT_TOKENS,
        });
        let response = send_json_with_retries(PROVIDER, self.transport, || {
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .header(CONTENT_TYPE, "application/json")
                .timeout(timeout)
                .json(&payload)
                .send()
        })?;
        let text = extract_output_text(&response);
        if text.is_empty() {
            return Err(BackendError::EmptyResponse { provider: PROVIDER });
        }
        Ok(text)
    }
}

impl GenerativeBackend for OpenAiBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn generate_structured_text(&self, request: &TextRequest) -> Result<String, BackendError> {
        let content = vec![json!({"type": "input_text", "text": request.prompt})];
        self.respond(&request.model, content, request.timeout)
    }

    fn analyze_image(&self, request: &VisionRequest<'_>) -> Result<String, BackendError> {
        let content = vec![
            json!({"type": "input_text", "text": request.prompt}),
            json!({"type": "input_image", "image_url": request.image.data_url()}),
        ];
        self.respond(&request.model, content, request.timeout)
    }
}

fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_OPENAI_API_BASE.to_string();
    }
    let mut base = trimmed.to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base
}

fn sanitize_responses_model(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.to_ascii_lowercase().contains("realtime") {
        return DEFAULT_RESPONSES_MODEL.to_string();
    }
    trimmed.to_string()
}

fn extract_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }

    parts.join("\n").trim().to_string()
}
