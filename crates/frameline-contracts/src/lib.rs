//! Data model and bookkeeping for the frameline continuity loop: scene state
//! snapshots, verification results, the per-session state tracker, and the
//! event/receipt files a run leaves behind.

pub mod events;
pub mod models;
pub mod outcome;
pub mod runs;
pub mod scene;
pub mod tracker;
pub mod verification;

pub use outcome::Outcome;
pub use scene::{
    CameraAngle, CameraDistance, CameraMovement, CameraState, CharacterState, EnvironmentState,
    GroupContext, Position, SceneStateSnapshot,
};
pub use tracker::{StateTracker, TrackerExport};
pub use verification::{
    QuickVerification, Severity, VerificationResult, Violation, ViolationCategory,
    PASS_SCORE_THRESHOLD,
};
