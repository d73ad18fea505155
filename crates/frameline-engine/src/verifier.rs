//! VERIFY phase: score a generated image against its expected state.
//!
//! Both checks fail open. A broken or unreachable vision model yields an
//! accepted `Degraded` result rather than blocking the pipeline.

use std::sync::Arc;
use std::time::Duration;

use frameline_contracts::{
    Outcome, QuickVerification, SceneStateSnapshot, VerificationResult, Violation,
    ViolationCategory,
};
use serde_json::{Map, Value};

use crate::backend::{GenerativeBackend, ImageData, VisionRequest};
use crate::json::{coerce_score, coerce_text_list, extract_json_object_from_text};

const VISION_MAX_DIM: u32 = 1024;
const MAX_SUGGESTIONS: usize = 8;
const MAX_SUGGESTION_CHARS: usize = 300;

pub struct ImageVerifier {
    backend: Arc<dyn GenerativeBackend>,
    model: String,
    timeout: Duration,
}

impl ImageVerifier {
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout,
        }
    }

    pub fn verify(
        &self,
        image: &ImageData,
        expected: &SceneStateSnapshot,
    ) -> Outcome<VerificationResult> {
        let prompt = verification_prompt(expected);
        let parsed = match self.ask(image, prompt) {
            Ok(parsed) => parsed,
            Err(reason) => return fail_open(&expected.scene_id, reason),
        };
        match result_from_reply(&parsed) {
            Some(result) => {
                tracing::debug!(
                    scene_id = %expected.scene_id,
                    score = result.score,
                    passed = result.passed,
                    violations = result.violations.len(),
                    "verification completed"
                );
                Outcome::Completed(result)
            }
            None => fail_open(
                &expected.scene_id,
                "verification reply had no overallScore and no critical failure".to_string(),
            ),
        }
    }

    /// Cheaper check of the critical elements only. An empty list passes
    /// without calling the model.
    pub fn quick_verify_critical_elements(
        &self,
        image: &ImageData,
        critical_elements: &[String],
    ) -> Outcome<QuickVerification> {
        if critical_elements.is_empty() {
            return Outcome::Completed(QuickVerification::from_failures(Vec::new()));
        }
        let parsed = match self.ask(image, quick_prompt(critical_elements)) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::warn!(reason = %reason, "quick verification degraded");
                return Outcome::degraded(QuickVerification::from_failures(Vec::new()), reason);
            }
        };
        let failed = parsed
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_object)
                    .filter(|row| status_is_fail(row))
                    .filter_map(|row| row.get("element").and_then(Value::as_str))
                    .map(|element| element.trim().to_string())
                    .filter(|element| !element.is_empty())
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();
        Outcome::Completed(QuickVerification::from_failures(failed))
    }

    fn ask(&self, image: &ImageData, prompt: String) -> Result<Map<String, Value>, String> {
        let prepared = image.prepared_for_vision(VISION_MAX_DIM);
        let request = VisionRequest {
            model: self.model.clone(),
            image: &prepared,
            prompt,
            timeout: self.timeout,
        };
        let reply = self
            .backend
            .analyze_image(&request)
            .map_err(|err| format!("vision request failed: {err}"))?;
        extract_json_object_from_text(&reply)
            .ok_or_else(|| "vision reply was not a JSON object".to_string())
    }
}

fn fail_open(scene_id: &str, reason: String) -> Outcome<VerificationResult> {
    tracing::warn!(scene_id = %scene_id, reason = %reason, "verification degraded, failing open");
    Outcome::degraded(VerificationResult::fail_open(&reason), reason)
}

fn verification_prompt(expected: &SceneStateSnapshot) -> String {
    let categories = ViolationCategory::ALL
        .iter()
        .map(ViolationCategory::as_str)
        .collect::<Vec<&str>>()
        .join(" | ");
    let mut lines = vec![
        "You are a strict continuity reviewer. Compare the image against the expected scene state."
            .to_string(),
        String::new(),
        "Expected characters:".to_string(),
    ];
    if expected.characters.is_empty() {
        lines.push("- none specified".to_string());
    }
    for character in &expected.characters {
        let mut parts = vec![format!("position {}", character.position)];
        if !character.props.is_empty() {
            parts.push(format!("props {}", character.props.join(", ")));
        }
        if !character.orientation.is_empty() {
            parts.push(format!("orientation {}", character.orientation));
        }
        if !character.action.is_empty() {
            parts.push(format!("action {}", character.action));
        }
        lines.push(format!("- {}: {}", character.name, parts.join("; ")));
    }
    if !expected.environment.location.is_empty() {
        lines.push(format!("Location: {}", expected.environment.location));
    }
    lines.push(String::new());
    lines.push("Checklist:".to_string());
    for (index, item) in expected.verification_checklist.iter().enumerate() {
        lines.push(format!("{}. {item}", index + 1));
    }
    lines.push(String::new());
    lines.push("Critical elements (any failure is blocking):".to_string());
    for (index, element) in expected.critical_elements.iter().enumerate() {
        lines.push(format!("{}. {element}", index + 1));
    }
    lines.push(String::new());
    lines.push(format!("category must be one of: {categories}."));
    lines.push("Return JSON only:".to_string());
    lines.push(
        r#"{"checklistResults":[{"item":"","status":"PASS|FAIL","reason":"","category":""}],"criticalElementsResults":[{"element":"","status":"PASS|FAIL","reason":"","category":""}],"overallScore":0,"suggestions":[]}"#
            .to_string(),
    );
    lines.join("\n")
}

fn quick_prompt(critical_elements: &[String]) -> String {
    let mut lines = vec!["Check whether each element is clearly true in the image:".to_string()];
    for (index, element) in critical_elements.iter().enumerate() {
        lines.push(format!("{}. {element}", index + 1));
    }
    lines.push(String::new());
    lines.push(
        r#"Return JSON only: {"results":[{"element":"","status":"PASS|FAIL"}]}"#.to_string(),
    );
    lines.join("\n")
}

/// `None` when the reply carries neither a usable score nor a critical
/// failure. A reported critical failure without a score is judged at 0.
fn result_from_reply(parsed: &Map<String, Value>) -> Option<VerificationResult> {
    let mut violations = failed_rows(parsed.get("checklistResults"), "item", |category, text| {
        Violation::checklist(category, text)
    });
    violations.extend(failed_rows(
        parsed.get("criticalElementsResults"),
        "element",
        |category, text| Violation::critical(category, text),
    ));
    let score = match coerce_score(parsed.get("overallScore")) {
        Some(score) => score,
        None if violations.iter().any(Violation::is_critical) => 0,
        None => return None,
    };
    let suggestions =
        coerce_text_list(parsed.get("suggestions"), MAX_SUGGESTIONS, MAX_SUGGESTION_CHARS);
    Some(VerificationResult::judged(score, violations, suggestions))
}

fn failed_rows(
    rows: Option<&Value>,
    label_key: &str,
    build: fn(ViolationCategory, String) -> Violation,
) -> Vec<Violation> {
    let Some(rows) = rows.and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(Value::as_object)
        .filter(|row| status_is_fail(row))
        .filter_map(|row| {
            let label = row.get(label_key).and_then(Value::as_str)?.trim();
            if label.is_empty() {
                return None;
            }
            let reason = row
                .get("reason")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            let text = if reason.is_empty() {
                label.to_string()
            } else {
                format!("{label} ({reason})")
            };
            let category = row
                .get("category")
                .and_then(Value::as_str)
                .and_then(ViolationCategory::parse)
                .unwrap_or_else(|| ViolationCategory::infer_from_text(&text));
            Some(build(category, text))
        })
        .collect()
}

fn status_is_fail(row: &Map<String, Value>) -> bool {
    row.get("status")
        .and_then(Value::as_str)
        .map(|status| status.trim().eq_ignore_ascii_case("fail"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use frameline_contracts::{
        CameraState, CharacterState, Position, SceneStateSnapshot, Severity, ViolationCategory,
    };

    use crate::backend::{BackendError, GenerativeBackend, ImageData, TextRequest, VisionRequest};

    use super::ImageVerifier;

    struct ScriptedVision {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl ScriptedVision {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl GenerativeBackend for ScriptedVision {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_structured_text(&self, _request: &TextRequest) -> Result<String, BackendError> {
            Err(BackendError::Unsupported {
                provider: "scripted",
                capability: "text",
            })
        }

        fn analyze_image(&self, _request: &VisionRequest<'_>) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().ok_or(BackendError::Status {
                provider: "scripted",
                code: 503,
                body: "overloaded".to_string(),
            })
        }
    }

    fn expected() -> SceneStateSnapshot {
        let mut remy = CharacterState::new("Remy", Position::Kneeling);
        remy.props = vec!["mask".to_string()];
        SceneStateSnapshot {
            scene_id: "scene-1".to_string(),
            voice_over_text: "Remy kneels.".to_string(),
            characters: vec![remy],
            environment: Default::default(),
            camera: CameraState::default(),
            critical_elements: vec!["mask is on face".to_string()],
            verification_checklist: vec!["Is Remy kneeling?".to_string()],
        }
    }

    fn image() -> ImageData {
        ImageData::new(b"not decoded by the stub".to_vec(), "image/png")
    }

    fn verifier(backend: Arc<ScriptedVision>) -> ImageVerifier {
        ImageVerifier::new(backend, "test-vision", Duration::from_secs(1))
    }

    #[test]
    fn critical_failure_blocks_despite_high_score() {
        let reply = r#"{
            "checklistResults": [{"item": "Is Remy kneeling?", "status": "PASS"}],
            "criticalElementsResults": [
                {"element": "mask is on face", "status": "FAIL", "reason": "mask in hand"}
            ],
            "overallScore": 92,
            "suggestions": ["show the mask worn over the face"]
        }"#;
        let outcome = verifier(ScriptedVision::replying(reply)).verify(&image(), &expected());
        assert!(!outcome.is_degraded());
        let result = outcome.into_value();
        assert!(!result.passed);
        assert_eq!(result.score, 92);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::Critical);
        assert_eq!(result.violations[0].category, ViolationCategory::Placement);
        assert_eq!(
            result.tagged_violations(),
            vec!["CRITICAL FAIL: mask is on face (mask in hand)"]
        );
        assert_eq!(result.suggestions, vec!["show the mask worn over the face"]);
    }

    #[test]
    fn checklist_failure_alone_does_not_block_at_threshold() {
        let reply = r#"{
            "checklistResults": [
                {"item": "Is Remy kneeling?", "status": "fail", "category": "posture"}
            ],
            "criticalElementsResults": [{"element": "mask is on face", "status": "PASS"}],
            "overallScore": "70"
        }"#;
        let result = verifier(ScriptedVision::replying(reply))
            .verify(&image(), &expected())
            .into_value();
        assert!(result.passed);
        assert_eq!(result.violations[0].severity, Severity::Checklist);
        assert_eq!(result.violations[0].category, ViolationCategory::Posture);
    }

    #[test]
    fn unavailable_model_fails_open() {
        let outcome = verifier(ScriptedVision::unavailable()).verify(&image(), &expected());
        assert!(outcome.is_degraded());
        let result = outcome.into_value();
        assert!(result.passed);
        assert_eq!(result.score, 50);
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].text.contains("system error"));
        assert!(result.suggestions.is_empty());
    }

    #[test]
    fn reply_without_score_fails_open() {
        let outcome = verifier(ScriptedVision::replying(r#"{"suggestions": []}"#))
            .verify(&image(), &expected());
        assert!(outcome.is_degraded());
        assert!(outcome.value().passed);
    }

    #[test]
    fn critical_failure_without_score_still_blocks() {
        let reply =
            r#"{"criticalElementsResults": [{"element": "mask is on face", "status": "FAIL"}]}"#;
        let outcome = verifier(ScriptedVision::replying(reply)).verify(&image(), &expected());
        assert!(!outcome.is_degraded());
        let result = outcome.into_value();
        assert!(!result.passed);
        assert_eq!(result.score, 0);
        assert_eq!(result.tagged_violations(), vec!["CRITICAL FAIL: mask is on face"]);
    }

    #[test]
    fn checklist_failure_without_score_fails_open() {
        let reply = r#"{"checklistResults": [{"item": "Is Remy kneeling?", "status": "FAIL"}]}"#;
        let outcome = verifier(ScriptedVision::replying(reply)).verify(&image(), &expected());
        assert!(outcome.is_degraded());
        assert!(outcome.value().passed);
    }

    #[test]
    fn quick_verify_reports_failed_mask() {
        let backend = ScriptedVision::replying(
            r#"{"results": [{"element": "mask is on face", "status": "FAIL"}]}"#,
        );
        let outcome = verifier(backend)
            .quick_verify_critical_elements(&image(), &["mask is on face".to_string()]);
        assert!(!outcome.is_degraded());
        let quick = outcome.into_value();
        assert!(!quick.passed);
        assert_eq!(quick.failed_elements, vec!["mask is on face"]);
    }

    #[test]
    fn quick_verify_with_no_elements_skips_the_model() {
        let backend = ScriptedVision::replying("{}");
        let quick = verifier(backend.clone())
            .quick_verify_critical_elements(&image(), &[])
            .into_value();
        assert!(quick.passed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn quick_verify_fails_open_and_ignores_omitted_elements() {
        let elements = vec!["mask is on face".to_string(), "torch is lit".to_string()];
        let degraded = verifier(ScriptedVision::unavailable())
            .quick_verify_critical_elements(&image(), &elements);
        assert!(degraded.is_degraded());
        assert!(degraded.value().passed);

        let partial = verifier(ScriptedVision::replying(
            r#"{"results": [{"element": "torch is lit", "status": "pass"}]}"#,
        ))
        .quick_verify_critical_elements(&image(), &elements)
        .into_value();
        assert!(partial.passed);
        assert!(partial.failed_elements.is_empty());
    }
}
