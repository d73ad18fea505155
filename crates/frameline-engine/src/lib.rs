//! Continuity loop for sequences of independently generated images:
//! plan the expected scene state, render it into the generation prompt,
//! generate, verify the image against the state, and regenerate with a
//! correction prompt when verification fails.

pub mod backend;
pub mod config;
pub mod correction;
pub mod dryrun;
pub mod gemini;
mod json;
pub mod materializer;
pub mod openai;
pub mod planner;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use frameline_contracts::events::{EventKind, EventLog, EventPayload};
use frameline_contracts::models::{Capability, ModelSelection, ModelSelector};
use frameline_contracts::{
    GroupContext, Outcome, SceneStateSnapshot, StateTracker, VerificationResult,
};
use serde_json::{json, Value};

pub use backend::{
    BackendError, BackendRegistry, GeneratedImage, GenerationRequest, GenerativeBackend, ImageData,
    ImageGenerator, TextRequest, TransportPolicy, VisionRequest,
};
pub use config::EngineConfig;
pub use correction::amend;
pub use dryrun::DryrunImageGenerator;
pub use gemini::GeminiBackend;
pub use materializer::render;
pub use openai::OpenAiBackend;
pub use planner::StatePlanner;
pub use verifier::ImageVerifier;

pub const DRYRUN_IMAGE_MODEL: &str = "dryrun-image-1";

/// One scene to push through the loop.
#[derive(Debug, Clone, Default)]
pub struct SceneRequest {
    pub group_id: String,
    pub voice_over: String,
    pub visual_prompt: String,
    pub location_anchor: String,
    pub character_descriptions: String,
    pub reference_images: Vec<ImageData>,
}

#[derive(Debug, Clone)]
pub struct SceneReport {
    pub state: Arc<SceneStateSnapshot>,
    pub base_prompt: String,
    pub final_prompt: String,
    pub image: GeneratedImage,
    pub verification: Outcome<VerificationResult>,
    /// Number of images generated, including the first.
    pub attempts: u32,
    pub planning_degraded: Option<String>,
}

impl SceneReport {
    pub fn corrected(&self) -> bool {
        self.attempts > 1
    }
}

pub struct ContinuityEngine {
    planner: StatePlanner,
    verifier: ImageVerifier,
    generator: Arc<dyn ImageGenerator>,
    image_model: String,
    image_timeout: Duration,
    max_corrections: u32,
    events: EventLog,
}

impl ContinuityEngine {
    pub fn new(
        planner: StatePlanner,
        verifier: ImageVerifier,
        generator: Arc<dyn ImageGenerator>,
        image_model: impl Into<String>,
        image_timeout: Duration,
        events: EventLog,
    ) -> Self {
        Self {
            planner,
            verifier,
            generator,
            image_model: image_model.into(),
            image_timeout,
            max_corrections: 1,
            events,
        }
    }

    /// Wires backends from `config`. With `dryrun` set, images come from the
    /// offline generator while planning and verification still use the
    /// configured text and vision models.
    pub fn from_config(config: &EngineConfig, events: EventLog, dryrun: bool) -> Result<Self> {
        let registry = default_backend_registry(config);
        let selector = ModelSelector::new(None);

        let text = select_model(&selector, &config.text_model, Capability::Text)?;
        let vision = select_model(&selector, &config.vision_model, Capability::Vision)?;
        let image_model = if dryrun {
            DRYRUN_IMAGE_MODEL
        } else {
            config.image_model.as_str()
        };
        let image = select_model(&selector, image_model, Capability::Image)?;

        let text_backend = registry
            .backend(&text.model.provider)
            .ok_or_else(|| anyhow!("no text backend for provider '{}'", text.model.provider))?;
        let vision_backend = registry
            .backend(&vision.model.provider)
            .ok_or_else(|| anyhow!("no vision backend for provider '{}'", vision.model.provider))?;
        let generator = registry
            .generator(&image.model.provider)
            .ok_or_else(|| anyhow!("no image generator for provider '{}'", image.model.provider))?;

        tracing::info!(
            text_model = %text.model.name,
            vision_model = %vision.model.name,
            image_model = %image.model.name,
            "continuity engine configured"
        );

        let planner = StatePlanner::new(text_backend, text.model.name, config.text_timeout);
        let verifier = ImageVerifier::new(vision_backend, vision.model.name, config.vision_timeout);
        Ok(Self::new(
            planner,
            verifier,
            generator,
            image.model.name,
            config.image_timeout,
            events,
        )
        .with_max_corrections(config.max_corrections))
    }

    pub fn with_max_corrections(mut self, max_corrections: u32) -> Self {
        self.max_corrections = max_corrections;
        self
    }

    pub fn planner(&self) -> &StatePlanner {
        &self.planner
    }

    pub fn verifier(&self) -> &ImageVerifier {
        &self.verifier
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Runs plan, render, generate and verify for one scene, regenerating
    /// with an amended prompt while verification fails and corrections
    /// remain. The planned state is committed to `tracker` whether or not
    /// the image passed. Only image generation errors are returned.
    pub fn run_scene(
        &self,
        tracker: &mut StateTracker,
        request: SceneRequest,
    ) -> Result<SceneReport> {
        let group_id = request.group_id.trim().to_string();
        let previous = tracker.previous_state_in_group(&group_id);
        let context = GroupContext {
            location_anchor: request.location_anchor.clone(),
            character_descriptions: request.character_descriptions.clone(),
            is_first_in_group: previous.is_none(),
        };

        let planned = self.planner.plan(
            &request.voice_over,
            &request.visual_prompt,
            previous.as_deref(),
            &context,
        );
        let planning_degraded = planned.degraded_reason().map(str::to_string);
        let state = planned.into_value();
        match &planning_degraded {
            Some(reason) => self.emit(
                EventKind::PlanningDegraded,
                json!({
                    "scene_id": state.scene_id,
                    "group_id": group_id,
                    "reason": reason,
                }),
            ),
            None => self.emit(
                EventKind::StatePlanned,
                json!({
                    "scene_id": state.scene_id,
                    "group_id": group_id,
                    "characters": state.characters.len(),
                    "critical_elements": state.critical_elements,
                }),
            ),
        }

        let base_prompt = materializer::append_to_prompt(&request.visual_prompt, &state);
        self.emit(
            EventKind::PromptRendered,
            json!({
                "scene_id": state.scene_id,
                "prompt": base_prompt,
            }),
        );

        let mut final_prompt = base_prompt.clone();
        let mut image =
            self.generate(&state.scene_id, &final_prompt, &request.reference_images, 1)?;
        let mut attempts = 1u32;
        let mut verification = self.verify(&state, &image.image, attempts);

        while !verification.value().passed && attempts <= self.max_corrections {
            final_prompt = amend(&base_prompt, verification.value(), &state);
            self.emit(
                EventKind::CorrectionIssued,
                json!({
                    "scene_id": state.scene_id,
                    "attempt": attempts + 1,
                    "violations": verification.value().tagged_violations(),
                    "prompt": final_prompt,
                }),
            );
            attempts += 1;
            image = self.generate(
                &state.scene_id,
                &final_prompt,
                &request.reference_images,
                attempts,
            )?;
            verification = self.verify(&state, &image.image, attempts);
        }

        let scene_id = state.scene_id.clone();
        let state = tracker.set_scene_state(scene_id.clone(), group_id.clone(), state);
        self.emit(
            EventKind::StateCommitted,
            json!({
                "scene_id": scene_id,
                "group_id": group_id,
                "passed": verification.value().passed,
                "attempts": attempts,
            }),
        );
        tracing::info!(
            scene_id = %scene_id,
            group_id = %group_id,
            score = verification.value().score,
            passed = verification.value().passed,
            attempts,
            "scene finished"
        );

        Ok(SceneReport {
            state,
            base_prompt,
            final_prompt,
            image,
            verification,
            attempts,
            planning_degraded,
        })
    }

    fn generate(
        &self,
        scene_id: &str,
        prompt: &str,
        reference_images: &[ImageData],
        attempt: u32,
    ) -> Result<GeneratedImage> {
        let request = GenerationRequest {
            model: self.image_model.clone(),
            prompt: prompt.to_string(),
            reference_images: reference_images.to_vec(),
            timeout: self.image_timeout,
        };
        let generated = self
            .generator
            .generate(&request)
            .with_context(|| {
                format!("image generation failed for {scene_id} (attempt {attempt})")
            })?;
        for warning in &generated.warnings {
            tracing::warn!(scene_id = %scene_id, warning = %warning, "image generator warning");
        }
        self.emit(
            EventKind::ImageGenerated,
            json!({
                "scene_id": scene_id,
                "attempt": attempt,
                "model": self.image_model,
                "provider": self.generator.name(),
                "bytes": generated.image.bytes.len(),
                "sha256": generated.image.sha256_hex(),
            }),
        );
        Ok(generated)
    }

    fn verify(
        &self,
        state: &SceneStateSnapshot,
        image: &ImageData,
        attempt: u32,
    ) -> Outcome<VerificationResult> {
        let outcome = self.verifier.verify(image, state);
        let result = outcome.value();
        match outcome.degraded_reason() {
            Some(reason) => self.emit(
                EventKind::VerificationDegraded,
                json!({
                    "scene_id": state.scene_id,
                    "attempt": attempt,
                    "reason": reason,
                }),
            ),
            None => self.emit(
                EventKind::VerificationCompleted,
                json!({
                    "scene_id": state.scene_id,
                    "attempt": attempt,
                    "passed": result.passed,
                    "score": result.score,
                    "violations": result.tagged_violations(),
                }),
            ),
        }
        outcome
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        self.events.record_lossy(kind, event_payload(payload));
    }
}

pub fn default_backend_registry(config: &EngineConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    let gemini = Arc::new(GeminiBackend::new(
        &config.gemini_api_base,
        config.gemini_api_key.clone(),
        config.transport,
    ));
    registry.register_backend(gemini.clone());
    registry.register_generator(gemini);
    registry.register_backend(Arc::new(OpenAiBackend::new(
        &config.openai_api_base,
        config.openai_api_key.clone(),
        config.transport,
    )));
    registry.register_generator(Arc::new(DryrunImageGenerator::default()));
    registry
}

fn select_model(
    selector: &ModelSelector,
    requested: &str,
    capability: Capability,
) -> Result<ModelSelection> {
    let selection = selector
        .select(Some(requested), capability)
        .map_err(|message| anyhow!(message))?;
    if let Some(reason) = &selection.fallback_reason {
        tracing::warn!(
            capability = capability.as_str(),
            model = %selection.model.name,
            reason = %reason,
            "model fallback"
        );
    }
    Ok(selection)
}

pub fn event_payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use frameline_contracts::events::EventLog;
    use frameline_contracts::{CharacterState, Position, SceneStateSnapshot, StateTracker};
    use serde_json::Value;

    use crate::backend::{
        BackendError, GeneratedImage, GenerationRequest, GenerativeBackend, ImageData,
        ImageGenerator, TextRequest, VisionRequest,
    };
    use crate::dryrun::DryrunImageGenerator;
    use crate::planner::StatePlanner;
    use crate::verifier::ImageVerifier;

    use super::{ContinuityEngine, SceneRequest};

    /// Text replies and vision replies are popped in order; an exhausted
    /// queue behaves like an unavailable model.
    #[derive(Default)]
    struct ScriptedModel {
        text: Mutex<VecDeque<String>>,
        vision: Mutex<VecDeque<String>>,
    }

    impl ScriptedModel {
        fn new(text: &[&str], vision: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                text: Mutex::new(text.iter().map(|s| s.to_string()).collect()),
                vision: Mutex::new(vision.iter().map(|s| s.to_string()).collect()),
            })
        }

        fn pop(queue: &Mutex<VecDeque<String>>) -> Result<String, BackendError> {
            queue
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front())
                .ok_or(BackendError::EmptyResponse { provider: "scripted" })
        }
    }

    impl GenerativeBackend for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_structured_text(&self, _request: &TextRequest) -> Result<String, BackendError> {
            Self::pop(&self.text)
        }

        fn analyze_image(&self, _request: &VisionRequest<'_>) -> Result<String, BackendError> {
            Self::pop(&self.vision)
        }
    }

    struct RecordingGenerator {
        inner: DryrunImageGenerator,
        prompts: Mutex<Vec<String>>,
        references: Mutex<Vec<Vec<Vec<u8>>>>,
    }

    impl ImageGenerator for RecordingGenerator {
        fn name(&self) -> &str {
            "recording"
        }

        fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedImage> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(request.prompt.clone());
            }
            if let Ok(mut references) = self.references.lock() {
                references.push(
                    request
                        .reference_images
                        .iter()
                        .map(|image| image.bytes.clone())
                        .collect(),
                );
            }
            self.inner.generate(request)
        }
    }

    fn engine(
        model: Arc<ScriptedModel>,
        generator: Arc<RecordingGenerator>,
        events: EventLog,
    ) -> ContinuityEngine {
        ContinuityEngine::new(
            StatePlanner::new(model.clone(), "text", Duration::from_secs(1)),
            ImageVerifier::new(model, "vision", Duration::from_secs(1)),
            generator,
            "dryrun-image-1",
            Duration::from_secs(1),
            events,
        )
    }

    fn recording() -> Arc<RecordingGenerator> {
        Arc::new(RecordingGenerator {
            inner: DryrunImageGenerator::new(8, 8),
            prompts: Mutex::new(Vec::new()),
            references: Mutex::new(Vec::new()),
        })
    }

    fn request(voice_over: &str) -> SceneRequest {
        SceneRequest {
            group_id: "act-1".to_string(),
            voice_over: voice_over.to_string(),
            visual_prompt: "a dim kitchen".to_string(),
            ..SceneRequest::default()
        }
    }

    const COLLAPSE_PLAN: &str = r#"{"characters":[{"name":"Man","position":"lying_face_down"}],
        "camera":{"angle":"high_angle","distance":"wide","movement":"static"},
        "criticalElements":["Man is lying face down"],
        "verificationChecklist":["Is the man on the floor?"]}"#;

    #[test]
    fn collapse_scene_renders_lying_face_down_and_commits() -> anyhow::Result<()> {
        let mut tracker = StateTracker::new();
        let mut man = CharacterState::new("Man", Position::Standing);
        man.props = vec!["hat".to_string()];
        tracker.set_scene_state(
            "scene-0",
            "act-1",
            SceneStateSnapshot {
                scene_id: "scene-0".to_string(),
                voice_over_text: "A man stands.".to_string(),
                characters: vec![man],
                environment: Default::default(),
                camera: Default::default(),
                critical_elements: Vec::new(),
                verification_checklist: Vec::new(),
            },
        );

        let model = ScriptedModel::new(&[COLLAPSE_PLAN], &[r#"{"overallScore": 88}"#]);
        let generator = recording();
        let report = engine(model, generator.clone(), EventLog::disabled("test"))
            .run_scene(&mut tracker, request("He collapses to the floor"))?;

        assert!(report.planning_degraded.is_none());
        assert!(report.base_prompt.starts_with("a dim kitchen\n\n"));
        assert!(report.final_prompt.contains("Man POSITION: LYING FACE DOWN"));
        assert_eq!(report.attempts, 1);
        assert!(report.verification.value().passed);
        let committed = tracker.previous_state_in_group("act-1");
        assert_eq!(
            committed.map(|state| state.scene_id.clone()),
            Some(report.state.scene_id.clone())
        );
        assert_eq!(tracker.group_history("act-1").len(), 2);
        Ok(())
    }

    #[test]
    fn failed_verification_triggers_one_correction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let events_path = dir.path().join("events.jsonl");
        let model = ScriptedModel::new(
            &[COLLAPSE_PLAN],
            &[
                r#"{"criticalElementsResults":[{"element":"Man is lying face down","status":"FAIL","category":"position"}],"overallScore":90}"#,
                r#"{"overallScore": 40}"#,
            ],
        );
        let generator = recording();
        let mut tracker = StateTracker::new();
        let report = engine(model, generator.clone(), EventLog::new(&events_path, "test"))
            .run_scene(&mut tracker, request("He collapses to the floor"))?;

        assert_eq!(report.attempts, 2);
        assert!(report.corrected());
        assert!(!report.verification.value().passed);
        assert!(report.final_prompt.starts_with(&report.base_prompt));
        assert!(report.final_prompt.contains("Man MUST be LYING FACE DOWN"));
        let prompts = generator.prompts.lock().map(|p| p.clone()).unwrap_or_default();
        assert_eq!(prompts, vec![report.base_prompt.clone(), report.final_prompt.clone()]);
        assert!(tracker.get_scene_state(&report.state.scene_id).is_some());

        let kinds: Vec<String> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            kinds,
            vec![
                "state_planned",
                "prompt_rendered",
                "image_generated",
                "verification_completed",
                "correction_issued",
                "image_generated",
                "verification_completed",
                "state_committed",
            ]
        );
        Ok(())
    }

    #[test]
    fn unavailable_models_degrade_but_still_produce_an_image() -> anyhow::Result<()> {
        let mut tracker = StateTracker::new();
        tracker.set_scene_state(
            "scene-0",
            "act-1",
            SceneStateSnapshot {
                scene_id: "scene-0".to_string(),
                voice_over_text: "Remy kneels.".to_string(),
                characters: vec![CharacterState::new("Remy", Position::Kneeling)],
                environment: Default::default(),
                camera: Default::default(),
                critical_elements: Vec::new(),
                verification_checklist: Vec::new(),
            },
        );
        let report = engine(ScriptedModel::new(&[], &[]), recording(), EventLog::disabled("test"))
            .run_scene(&mut tracker, request("He waits."))?;

        assert!(report.planning_degraded.is_some());
        assert!(report.verification.is_degraded());
        assert!(report.verification.value().passed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.state.characters[0].name, "Remy");
        assert_eq!(report.state.characters[0].position, Position::Kneeling);
        Ok(())
    }

    #[test]
    fn zero_corrections_disables_regeneration() -> anyhow::Result<()> {
        let model = ScriptedModel::new(&[COLLAPSE_PLAN], &[r#"{"overallScore": 10}"#]);
        let generator = recording();
        let mut tracker = StateTracker::new();
        let report = engine(model, generator.clone(), EventLog::disabled("test"))
            .with_max_corrections(0)
            .run_scene(&mut tracker, request("He collapses."))?;
        assert_eq!(report.attempts, 1);
        assert!(!report.verification.value().passed);
        assert_eq!(generator.prompts.lock().map(|p| p.len()).unwrap_or(0), 1);
        Ok(())
    }

    #[test]
    fn reference_images_reach_the_generator() -> anyhow::Result<()> {
        let model = ScriptedModel::new(&[COLLAPSE_PLAN], &[r#"{"overallScore": 95}"#]);
        let mut tracker = StateTracker::new();
        let mut scene = request("He collapses.");
        scene.reference_images = vec![ImageData::new(b"ref".to_vec(), "image/png")];
        let generator = recording();
        let report = engine(model, generator.clone(), EventLog::disabled("test"))
            .run_scene(&mut tracker, scene)?;
        assert_eq!(report.attempts, 1);
        let references = generator
            .references
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default();
        assert_eq!(references, vec![vec![b"ref".to_vec()]]);
        Ok(())
    }
}
