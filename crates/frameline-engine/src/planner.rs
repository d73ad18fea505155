//! REASON phase: ask a text model for the next scene state, carrying the
//! previous state forward unless the voice-over changes it.

use std::sync::Arc;
use std::time::Duration;

use frameline_contracts::scene::new_scene_id;
use frameline_contracts::{
    CameraAngle, CameraDistance, CameraMovement, CameraState, CharacterState, EnvironmentState,
    GroupContext, Outcome, Position, SceneStateSnapshot,
};
use serde_json::{Map, Value};

use crate::backend::{GenerativeBackend, TextRequest};
use crate::json::{coerce_text_list, extract_json_object_from_text};

const MAX_CHARACTERS: usize = 12;
const MAX_LIST_ITEMS: usize = 12;
const MAX_ITEM_CHARS: usize = 240;

pub struct StatePlanner {
    backend: Arc<dyn GenerativeBackend>,
    model: String,
    timeout: Duration,
}

impl StatePlanner {
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

    /// Never fails: request or parse errors yield a `Degraded` snapshot that
    /// copies the previous characters and environment with a default camera.
    pub fn plan(
        &self,
        voice_over: &str,
        visual_prompt: &str,
        previous: Option<&SceneStateSnapshot>,
        context: &GroupContext,
    ) -> Outcome<SceneStateSnapshot> {
        let scene_id = new_scene_id();
        let request = TextRequest {
            model: self.model.clone(),
            prompt: planning_prompt(voice_over, visual_prompt, previous, context),
            timeout: self.timeout,
        };
        let reply = match self.backend.generate_structured_text(&request) {
            Ok(reply) => reply,
            Err(err) => {
                let reason = format!("planning request failed: {err}");
                return degrade(scene_id, voice_over, previous, reason);
            }
        };
        let Some(parsed) = extract_json_object_from_text(&reply) else {
            let reason = "planning reply was not a JSON object".to_string();
            return degrade(scene_id, voice_over, previous, reason);
        };
        if !parsed.get("characters").is_some_and(Value::is_array) {
            let reason = "planning reply had no characters array".to_string();
            return degrade(scene_id, voice_over, previous, reason);
        }

        let state = state_from_reply(scene_id, voice_over, &parsed);
        tracing::debug!(
            scene_id = %state.scene_id,
            characters = state.characters.len(),
            critical = state.critical_elements.len(),
            "state planned"
        );
        Outcome::Completed(state)
    }
}

fn degrade(
    scene_id: String,
    voice_over: &str,
    previous: Option<&SceneStateSnapshot>,
    reason: String,
) -> Outcome<SceneStateSnapshot> {
    tracing::warn!(scene_id = %scene_id, reason = %reason, "state planning degraded");
    Outcome::degraded(fallback_state(scene_id, voice_over, previous), reason)
}

/// Snapshot used when the model could not be consulted.
pub fn fallback_state(
    scene_id: String,
    voice_over: &str,
    previous: Option<&SceneStateSnapshot>,
) -> SceneStateSnapshot {
    SceneStateSnapshot {
        scene_id,
        voice_over_text: voice_over.to_string(),
        characters: previous
            .map(|state| state.characters.clone())
            .unwrap_or_default(),
        environment: previous
            .map(|state| state.environment.clone())
            .unwrap_or_default(),
        camera: CameraState::default(),
        critical_elements: Vec::new(),
        verification_checklist: Vec::new(),
    }
}

fn planning_prompt(
    voice_over: &str,
    visual_prompt: &str,
    previous: Option<&SceneStateSnapshot>,
    context: &GroupContext,
) -> String {
    let positions = Position::ALL
        .iter()
        .map(Position::as_str)
        .collect::<Vec<&str>>()
        .join(" | ");
    let previous_json = previous
        .and_then(|state| serde_json::to_string_pretty(state).ok())
        .unwrap_or_else(|| "none (first scene in this group)".to_string());

    let mut lines = vec![
        "You track visual continuity between consecutive generated images of one story."
            .to_string(),
        "Describe the scene state the NEXT image must show.".to_string(),
        String::new(),
        "Rules:".to_string(),
        "1. Preserve every character's position, props and orientation from the previous state unless the voice-over explicitly describes a change.".to_string(),
        "2. Vary ONLY the camera (angle, distance, movement) for visual variety.".to_string(),
        "3. criticalElements are short assertions that MUST be visible in the image (e.g. \"mask is on face\").".to_string(),
        "4. verificationChecklist is a list of yes/no questions a reviewer can answer from the image.".to_string(),
        format!("5. position must be one of: {positions}."),
        String::new(),
    ];
    if !context.location_anchor.trim().is_empty() {
        lines.push(format!("Location anchor: {}", context.location_anchor.trim()));
    }
    if !context.character_descriptions.trim().is_empty() {
        lines.push(format!("Characters: {}", context.character_descriptions.trim()));
    }
    if context.is_first_in_group {
        lines.push(
            "This is the first scene of its group; establish the state from the text.".to_string(),
        );
    }
    lines.push(format!("Voice-over: {}", voice_over.trim()));
    lines.push(format!("Visual prompt: {}", visual_prompt.trim()));
    lines.push(String::new());
    lines.push("Previous state:".to_string());
    lines.push(previous_json);
    lines.push(String::new());
    lines.push("Return JSON only with this shape:".to_string());
    lines.push(
        r#"{"characters":[{"name":"","position":"","props":[],"orientation":"","action":""}],"environment":{"location":"","timeOfDay":"","lighting":"","weather":"","keyObjects":[]},"camera":{"angle":"eye_level","distance":"medium","movement":"static"},"criticalElements":[],"verificationChecklist":[]}"#
            .to_string(),
    );
    lines.join("\n")
}

fn state_from_reply(
    scene_id: String,
    voice_over: &str,
    parsed: &Map<String, Value>,
) -> SceneStateSnapshot {
    let characters = parsed
        .get("characters")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_object)
                .map(character_from_object)
                .filter(|character| !character.name.is_empty())
                .take(MAX_CHARACTERS)
                .collect()
        })
        .unwrap_or_default();

    let empty = Map::new();
    let environment = parsed
        .get("environment")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let camera = parsed.get("camera").and_then(Value::as_object).unwrap_or(&empty);

    SceneStateSnapshot {
        scene_id,
        voice_over_text: voice_over.to_string(),
        characters,
        environment: EnvironmentState {
            location: text_field(environment, "location"),
            time_of_day: text_field(environment, "timeOfDay"),
            lighting: text_field(environment, "lighting"),
            weather: text_field(environment, "weather"),
            key_objects: coerce_text_list(
                environment.get("keyObjects"),
                MAX_LIST_ITEMS,
                MAX_ITEM_CHARS,
            ),
        },
        camera: CameraState {
            angle: CameraAngle::parse(&text_field(camera, "angle")),
            distance: CameraDistance::parse(&text_field(camera, "distance")),
            movement: CameraMovement::parse(&text_field(camera, "movement")),
        },
        critical_elements: coerce_text_list(
            parsed.get("criticalElements"),
            MAX_LIST_ITEMS,
            MAX_ITEM_CHARS,
        ),
        verification_checklist: coerce_text_list(
            parsed.get("verificationChecklist"),
            MAX_LIST_ITEMS,
            MAX_ITEM_CHARS,
        ),
    }
}

fn character_from_object(obj: &Map<String, Value>) -> CharacterState {
    CharacterState {
        name: text_field(obj, "name"),
        position: Position::parse(&text_field(obj, "position")),
        props: coerce_text_list(obj.get("props"), MAX_LIST_ITEMS, MAX_ITEM_CHARS),
        orientation: text_field(obj, "orientation"),
        action: text_field(obj, "action"),
    }
    .normalized()
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|text| text.split_whitespace().collect::<Vec<&str>>().join(" "))
        .unwrap_or_default()
}
