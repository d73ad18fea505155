use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionStarted,
    StatePlanned,
    PlanningDegraded,
    PromptRendered,
    ImageGenerated,
    VerificationCompleted,
    VerificationDegraded,
    CorrectionIssued,
    StateCommitted,
    GroupReset,
    SessionFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::StatePlanned => "state_planned",
            Self::PlanningDegraded => "planning_degraded",
            Self::PromptRendered => "prompt_rendered",
            Self::ImageGenerated => "image_generated",
            Self::VerificationCompleted => "verification_completed",
            Self::VerificationDegraded => "verification_degraded",
            Self::CorrectionIssued => "correction_issued",
            Self::StateCommitted => "state_committed",
            Self::GroupReset => "group_reset",
            Self::SessionFinished => "session_finished",
        }
    }
}

/// Append-only `events.jsonl` log for one continuity session.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Cloning shares the same file handle lock, so clones may be handed to
/// several stages.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: Some(path.into()),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// A log that builds events but writes nothing.
    pub fn disabled(session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: None,
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, kind: EventKind, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Like [`EventLog::record`] but a write failure is logged instead of
    /// returned; the continuity loop must not stall on its audit trail.
    pub fn record_lossy(&self, kind: EventKind, payload: EventPayload) {
        if let Err(err) = self.record(kind, payload) {
            tracing::warn!(event = kind.as_str(), error = %err, "failed to append event");
        }
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
