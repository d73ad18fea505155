use std::path::Path;

use serde_json::{Map, Value};

use crate::scene::SceneStateSnapshot;
use crate::verification::VerificationResult;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Everything one pass of the continuity loop produced for a scene.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptParts<'a> {
    pub group_id: &'a str,
    pub base_prompt: &'a str,
    pub final_prompt: &'a str,
    pub state: &'a SceneStateSnapshot,
    pub verification: &'a VerificationResult,
    pub verification_degraded: Option<&'a str>,
    pub planning_degraded: Option<&'a str>,
    pub attempts: u32,
    pub image_path: &'a Path,
    pub image_sha256: &'a str,
    pub provider_metadata: &'a Map<String, Value>,
}

pub fn build_receipt(parts: &ReceiptParts<'_>) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "scene_id".to_string(),
        Value::String(parts.state.scene_id.clone()),
    );
    root.insert(
        "group_id".to_string(),
        Value::String(parts.group_id.to_string()),
    );

    let mut prompts = Map::new();
    prompts.insert(
        "base".to_string(),
        Value::String(parts.base_prompt.to_string()),
    );
    prompts.insert(
        "final".to_string(),
        Value::String(parts.final_prompt.to_string()),
    );
    root.insert("prompts".to_string(), Value::Object(prompts));
    root.insert(
        "state".to_string(),
        serde_json::to_value(parts.state).unwrap_or(Value::Null),
    );

    let mut verification = serde_json::to_value(parts.verification)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default();
    verification.insert(
        "tagged_violations".to_string(),
        Value::Array(
            parts
                .verification
                .tagged_violations()
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
    );
    verification.insert("degraded".to_string(), optional_text(parts.verification_degraded));
    root.insert("verification".to_string(), Value::Object(verification));
    root.insert(
        "planning_degraded".to_string(),
        optional_text(parts.planning_degraded),
    );
    root.insert(
        "attempts".to_string(),
        Value::Number(parts.attempts.into()),
    );

    let mut artifact = Map::new();
    artifact.insert(
        "image_path".to_string(),
        Value::String(parts.image_path.to_string_lossy().to_string()),
    );
    artifact.insert(
        "sha256".to_string(),
        Value::String(parts.image_sha256.to_string()),
    );
    root.insert("artifact".to_string(), Value::Object(artifact));
    root.insert(
        "provider".to_string(),
        sanitize_payload(&Value::Object(parts.provider_metadata.clone())),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn optional_text(value: Option<&str>) -> Value {
    value
        .map(|text| Value::String(text.to_string()))
        .unwrap_or(Value::Null)
}

/// Replaces inline image payloads with a marker so receipts stay small.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data" | "inlinedata" | "inline_data" | "image_url" | "b64_json"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::scene::{CharacterState, Position, SceneStateSnapshot};
    use crate::verification::{VerificationResult, Violation, ViolationCategory};

    use super::{build_receipt, write_receipt, ReceiptParts, RECEIPT_SCHEMA_VERSION};

    #[test]
    fn receipt_builder_writes_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-scene-1.json");
        let image_path = temp.path().join("scene-1.png");

        let state = SceneStateSnapshot {
            scene_id: "scene-1".to_string(),
            voice_over_text: "He kneels.".to_string(),
            characters: vec![CharacterState::new("Remy", Position::Kneeling)],
            environment: Default::default(),
            camera: Default::default(),
            critical_elements: vec!["mask is on face".to_string()],
            verification_checklist: Vec::new(),
        };
        let verification = VerificationResult::judged(
            64,
            vec![Violation::critical(
                ViolationCategory::Placement,
                "mask is on face",
            )],
            vec!["move the mask".to_string()],
        );
        let mut provider = Map::new();
        provider.insert("model".to_string(), json!("dryrun-image-1"));
        provider.insert("parts".to_string(), json!([{"inlineData": {"data": "AAAA"}}]));

        let payload = build_receipt(&ReceiptParts {
            group_id: "alley",
            base_prompt: "a man in an alley",
            final_prompt: "a man in an alley\n\nFIX",
            state: &state,
            verification: &verification,
            verification_degraded: None,
            planning_degraded: Some("timeout"),
            attempts: 2,
            image_path: &image_path,
            image_sha256: "abc123",
            provider_metadata: &provider,
        });
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["scene_id"], json!("scene-1"));
        assert_eq!(parsed["state"]["characters"][0]["position"], json!("kneeling"));
        assert_eq!(parsed["verification"]["passed"], json!(false));
        assert_eq!(
            parsed["verification"]["tagged_violations"][0],
            json!("CRITICAL FAIL: mask is on face")
        );
        assert_eq!(parsed["verification"]["degraded"], Value::Null);
        assert_eq!(parsed["planning_degraded"], json!("timeout"));
        assert_eq!(parsed["provider"]["parts"][0]["inlineData"], json!("<omitted>"));
        assert_eq!(parsed["artifact"]["sha256"], json!("abc123"));
        Ok(())
    }
}
