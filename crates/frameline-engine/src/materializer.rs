use frameline_contracts::scene::spaced;
use frameline_contracts::{Position, SceneStateSnapshot};

pub const DIRECTIVE_HEADER: &str = "[SCENE STATE REQUIREMENTS - MANDATORY]";
pub const CLOSING_DIRECTIVE: &str =
    "Do NOT deviate from these requirements. They override any conflicting detail above.";

/// Renders a snapshot as the directive block appended to a generation prompt.
///
/// Per character, the POSITION line is omitted for `Position::Unknown` and
/// the PROPS line when there are no props; ORIENTATION and ACTION are
/// omitted when empty or "static". The CAMERA line is always present.
pub fn render(state: &SceneStateSnapshot) -> String {
    let mut lines = vec![DIRECTIVE_HEADER.to_string()];

    for character in &state.characters {
        if character.position != Position::Unknown {
            lines.push(format!(
                "- {} POSITION: {}",
                character.name,
                character.position.directive_label()
            ));
        }
        if !character.props.is_empty() {
            lines.push(format!("- {} PROPS: {}", character.name, character.props.join(", ")));
        }
        if is_meaningful(&character.orientation) {
            lines.push(format!("- {} ORIENTATION: {}", character.name, character.orientation));
        }
        if is_meaningful(&character.action) {
            lines.push(format!("- {} ACTION: {}", character.name, character.action));
        }
    }

    let mut angle = spaced(state.camera.angle.as_str());
    if !angle.ends_with("angle") {
        angle.push_str(" angle");
    }
    lines.push(format!(
        "- CAMERA: {angle}, {} shot",
        spaced(state.camera.distance.as_str())
    ));

    if !state.critical_elements.is_empty() {
        lines.push("CRITICAL ELEMENTS:".to_string());
        for element in &state.critical_elements {
            lines.push(format!("⚠️ {element}"));
        }
    }

    lines.push(CLOSING_DIRECTIVE.to_string());
    lines.join("\n")
}

/// Concatenates the rendered block onto an existing prompt.
pub fn append_to_prompt(prompt: &str, state: &SceneStateSnapshot) -> String {
    let prompt = prompt.trim_end();
    if prompt.is_empty() {
        return render(state);
    }
    format!("{prompt}\n\n{}", render(state))
}

fn is_meaningful(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("static")
}
