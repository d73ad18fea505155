//! CORRECT phase: fold verification failures back into the prompt.

use frameline_contracts::scene::spaced;
use frameline_contracts::{Position, SceneStateSnapshot, VerificationResult, ViolationCategory};

pub const CORRECTION_HEADER: &str = "[CORRECTION REQUIRED - PREVIOUS ATTEMPT FAILED]";

type DirectiveFn = fn(&SceneStateSnapshot) -> Vec<String>;

/// Fix directives keyed by violation category. Categories without an entry
/// contribute only their failure line and the verifier's suggestions.
const CORRECTION_RULES: &[(ViolationCategory, DirectiveFn)] = &[
    (ViolationCategory::Position, reposition_directives),
    (ViolationCategory::Posture, posture_directives),
    (ViolationCategory::Placement, placement_directives),
    (ViolationCategory::Props, placement_directives),
    (ViolationCategory::Orientation, orientation_directives),
    (ViolationCategory::Location, location_directives),
    (ViolationCategory::Lighting, lighting_directives),
    (ViolationCategory::Camera, camera_directives),
];

/// Appends a correction block to `original_prompt`; the original text is
/// always kept verbatim as the prefix.
pub fn amend(
    original_prompt: &str,
    verification: &VerificationResult,
    expected: &SceneStateSnapshot,
) -> String {
    let mut lines = vec![String::new(), CORRECTION_HEADER.to_string()];

    for violation in &verification.violations {
        lines.push(format!("- {violation}"));
    }

    let mut directives: Vec<String> = Vec::new();
    for violation in &verification.violations {
        for (category, rule) in CORRECTION_RULES {
            if *category != violation.category {
                continue;
            }
            for directive in rule(expected) {
                if !directives.contains(&directive) {
                    directives.push(directive);
                }
            }
        }
    }
    if !directives.is_empty() {
        lines.push("FIX:".to_string());
        lines.extend(directives.into_iter().map(|directive| format!("- {directive}")));
    }

    if !verification.suggestions.is_empty() {
        lines.push("REVIEWER SUGGESTIONS:".to_string());
        lines.extend(
            verification
                .suggestions
                .iter()
                .map(|suggestion| format!("- {suggestion}")),
        );
    }

    if !expected.critical_elements.is_empty() {
        lines.push("MANDATORY:".to_string());
        lines.extend(
            expected
                .critical_elements
                .iter()
                .map(|element| format!("⚠️ {element}")),
        );
    }

    format!("{original_prompt}\n{}", lines.join("\n"))
}

fn reposition_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    expected
        .characters
        .iter()
        .filter(|character| character.position != Position::Unknown)
        .map(|character| {
            format!(
                "{} MUST be {}. Reposition the body exactly as stated.",
                character.name,
                character.position.directive_label()
            )
        })
        .collect()
}

fn posture_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    expected
        .characters
        .iter()
        .filter(|character| character.position != Position::Unknown)
        .map(|character| {
            format!(
                "Correct {}'s posture: {}, not any other stance.",
                character.name,
                character.position.directive_label()
            )
        })
        .collect()
}

fn placement_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    expected
        .characters
        .iter()
        .filter(|character| !character.props.is_empty())
        .map(|character| {
            format!(
                "{} must visibly carry or wear: {}. Place each item exactly where stated.",
                character.name,
                character.props.join(", ")
            )
        })
        .collect()
}

fn orientation_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    expected
        .characters
        .iter()
        .filter(|character| !character.orientation.trim().is_empty())
        .map(|character| format!("{} must be {}.", character.name, character.orientation))
        .collect()
}

fn location_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    let location = expected.environment.location.trim();
    if location.is_empty() {
        return Vec::new();
    }
    vec![format!("The setting must be {location}.")]
}

fn lighting_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    let environment = &expected.environment;
    let mut out = Vec::new();
    if !environment.lighting.trim().is_empty() {
        out.push(format!("Lighting must be {}.", environment.lighting.trim()));
    }
    if !environment.time_of_day.trim().is_empty() {
        out.push(format!("Time of day must read as {}.", environment.time_of_day.trim()));
    }
    out
}

fn camera_directives(expected: &SceneStateSnapshot) -> Vec<String> {
    vec![format!(
        "Frame the shot as {} at {}.",
        spaced(expected.camera.distance.as_str()),
        spaced(expected.camera.angle.as_str())
    )]
}

#[cfg(test)]
mod tests {
    use frameline_contracts::{
        CameraState, CharacterState, EnvironmentState, Position, SceneStateSnapshot,
        VerificationResult, Violation, ViolationCategory,
    };

    use super::{amend, CORRECTION_HEADER};

    fn expected() -> SceneStateSnapshot {
        let mut man = CharacterState::new("Man", Position::LyingFaceDown);
        man.props = vec!["mask".to_string()];
        SceneStateSnapshot {
            scene_id: "scene-1".to_string(),
            voice_over_text: "He collapses to the floor".to_string(),
            characters: vec![man],
            environment: EnvironmentState {
                location: "kitchen".to_string(),
                ..EnvironmentState::default()
            },
            camera: CameraState::default(),
            critical_elements: vec!["mask is on face".to_string()],
            verification_checklist: Vec::new(),
        }
    }

    #[test]
    fn original_prompt_is_kept_as_prefix() {
        let original = "A man in a kitchen.\n\n[SCENE STATE REQUIREMENTS - MANDATORY]";
        let result = VerificationResult::judged(40, Vec::new(), Vec::new());
        let amended = amend(original, &result, &expected());
        assert!(amended.starts_with(original));
        assert!(amended.contains(CORRECTION_HEADER));
    }

    #[test]
    fn directives_follow_violation_categories() {
        let result = VerificationResult::judged(
            55,
            vec![
                Violation::checklist(ViolationCategory::Position, "Man is standing"),
                Violation::critical(ViolationCategory::Placement, "mask is on face"),
            ],
            vec!["put the mask over his face".to_string()],
        );
        let amended = amend("prompt", &result, &expected());
        assert!(amended.contains("- CHECKLIST FAIL: Man is standing"));
        assert!(amended.contains("- CRITICAL FAIL: mask is on face"));
        assert!(amended.contains("Man MUST be LYING FACE DOWN."));
        assert!(amended.contains("Man must visibly carry or wear: mask."));
        assert!(amended.contains("- put the mask over his face"));
        assert!(amended.contains("MANDATORY:\n⚠️ mask is on face"));
        assert!(!amended.contains("posture"));
    }

    #[test]
    fn repeated_categories_emit_each_directive_once() {
        let result = VerificationResult::judged(
            30,
            vec![
                Violation::checklist(ViolationCategory::Position, "not lying"),
                Violation::checklist(ViolationCategory::Position, "wrong position"),
            ],
            Vec::new(),
        );
        let amended = amend("prompt", &result, &expected());
        assert_eq!(amended.matches("Man MUST be LYING FACE DOWN").count(), 1);
    }

    #[test]
    fn uncategorised_violations_only_restate_failure() {
        let result = VerificationResult::judged(
            60,
            vec![Violation::checklist(ViolationCategory::Other, "wrong scarf colour")],
            Vec::new(),
        );
        let amended = amend("prompt", &result, &expected());
        assert!(amended.contains("- CHECKLIST FAIL: wrong scarf colour"));
        assert!(!amended.contains("FIX:"));
    }
}
