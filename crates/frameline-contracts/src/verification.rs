use std::fmt;

use serde::{Deserialize, Serialize};

/// Minimum overall score for an image to be accepted. Empirically tuned;
/// critical violations veto acceptance regardless of score.
pub const PASS_SCORE_THRESHOLD: u8 = 70;

/// Score reported when the verifier itself was unavailable.
pub const FAIL_OPEN_SCORE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Checklist,
    Critical,
}

impl Severity {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Checklist => "CHECKLIST FAIL",
            Self::Critical => "CRITICAL FAIL",
        }
    }
}

/// What kind of continuity break a violation describes. Drives the
/// correction rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Position,
    Posture,
    Placement,
    Props,
    Orientation,
    Action,
    Location,
    Lighting,
    Camera,
    Other,
}

impl ViolationCategory {
    pub const ALL: [ViolationCategory; 10] = [
        ViolationCategory::Position,
        ViolationCategory::Posture,
        ViolationCategory::Placement,
        ViolationCategory::Props,
        ViolationCategory::Orientation,
        ViolationCategory::Action,
        ViolationCategory::Location,
        ViolationCategory::Lighting,
        ViolationCategory::Camera,
        ViolationCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Posture => "posture",
            Self::Placement => "placement",
            Self::Props => "props",
            Self::Orientation => "orientation",
            Self::Action => "action",
            Self::Location => "location",
            Self::Lighting => "lighting",
            Self::Camera => "camera",
            Self::Other => "other",
        }
    }

    /// Returns `None` for anything outside the vocabulary so the caller can
    /// fall back to [`ViolationCategory::infer_from_text`].
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
    }

    /// Keyword fallback for model replies that omit a category.
    pub fn infer_from_text(text: &str) -> Self {
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("position") || lowered.contains("lying") {
            return Self::Position;
        }
        if lowered.contains("mask") && lowered.contains("face") {
            return Self::Placement;
        }
        if lowered.contains("kneeling") || lowered.contains("standing") {
            return Self::Posture;
        }
        Self::Other
    }
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub category: ViolationCategory,
    pub text: String,
}

impl Violation {
    pub fn checklist(category: ViolationCategory, text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Checklist,
            category,
            text: text.into(),
        }
    }

    pub fn critical(category: ViolationCategory, text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            category,
            text: text.into(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity.tag(), self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub score: u8,
    pub violations: Vec<Violation>,
    pub suggestions: Vec<String>,
}

impl VerificationResult {
    /// Builds a result from a model judgement, applying the acceptance rule.
    pub fn judged(score: u8, violations: Vec<Violation>, suggestions: Vec<String>) -> Self {
        let score = score.min(100);
        Self {
            passed: passes(score, &violations),
            score,
            violations,
            suggestions,
        }
    }

    /// Result used when the verifier could not run: accepted, mid score, and
    /// one synthetic violation carrying the reason.
    pub fn fail_open(reason: &str) -> Self {
        Self {
            passed: true,
            score: FAIL_OPEN_SCORE,
            violations: vec![Violation::checklist(
                ViolationCategory::Other,
                format!("verification unavailable (system error: {reason})"),
            )],
            suggestions: Vec::new(),
        }
    }

    pub fn critical_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|violation| violation.is_critical())
    }

    /// Violations in their tagged string form, e.g. `CRITICAL FAIL: mask is on face`.
    pub fn tagged_violations(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

pub fn passes(score: u8, violations: &[Violation]) -> bool {
    score >= PASS_SCORE_THRESHOLD && !violations.iter().any(Violation::is_critical)
}

/// Result of the cheaper critical-elements-only check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickVerification {
    pub passed: bool,
    pub failed_elements: Vec<String>,
}

impl QuickVerification {
    pub fn from_failures(failed_elements: Vec<String>) -> Self {
        Self {
            passed: failed_elements.is_empty(),
            failed_elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn critical() -> Violation {
        Violation::critical(ViolationCategory::Placement, "mask is on face")
    }

    fn checklist() -> Violation {
        Violation::checklist(ViolationCategory::Lighting, "is it night?")
    }

    #[test]
    fn score_seventy_without_critical_passes() {
        assert!(VerificationResult::judged(70, vec![checklist()], Vec::new()).passed);
        assert!(VerificationResult::judged(70, Vec::new(), Vec::new()).passed);
    }

    #[test]
    fn score_sixty_nine_fails() {
        assert!(!VerificationResult::judged(69, Vec::new(), Vec::new()).passed);
    }

    #[test]
    fn critical_violation_vetoes_perfect_score() {
        let result = VerificationResult::judged(100, vec![critical()], Vec::new());
        assert!(!result.passed);
        assert_eq!(result.critical_violations().count(), 1);
    }

    #[test]
    fn scores_above_one_hundred_are_clamped() {
        assert_eq!(VerificationResult::judged(250, Vec::new(), Vec::new()).score, 100);
    }

    #[test]
    fn tagged_violations_carry_severity_prefix() {
        let result = VerificationResult::judged(80, vec![checklist(), critical()], Vec::new());
        assert_eq!(
            result.tagged_violations(),
            vec!["CHECKLIST FAIL: is it night?", "CRITICAL FAIL: mask is on face"]
        );
    }

    #[test]
    fn fail_open_is_accepted_with_one_system_note() {
        let result = VerificationResult::fail_open("timeout");
        assert!(result.passed);
        assert_eq!(result.score, 50);
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].text.contains("timeout"));
        assert!(result.suggestions.is_empty());
    }

    #[test]
    fn category_inference_follows_keyword_table() {
        assert_eq!(
            ViolationCategory::infer_from_text("Man is not lying down"),
            ViolationCategory::Position
        );
        assert_eq!(
            ViolationCategory::infer_from_text("Mask is not on his face"),
            ViolationCategory::Placement
        );
        assert_eq!(
            ViolationCategory::infer_from_text("Remy should be kneeling"),
            ViolationCategory::Posture
        );
        assert_eq!(
            ViolationCategory::infer_from_text("wrong colour scarf"),
            ViolationCategory::Other
        );
        assert_eq!(ViolationCategory::parse(" Props "), Some(ViolationCategory::Props));
        assert_eq!(ViolationCategory::parse("vibes"), None);
    }

    #[test]
    fn quick_verification_passes_only_without_failures() {
        assert!(QuickVerification::from_failures(Vec::new()).passed);
        let failed = QuickVerification::from_failures(vec!["mask is on face".to_string()]);
        assert!(!failed.passed);
    }
}
