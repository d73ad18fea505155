use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub scenes_total: u64,
    pub scenes_passed: u64,
    pub scenes_corrected: u64,
    pub planning_degraded: u64,
    pub verification_degraded: u64,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?
        .as_object()
        .cloned()
        .unwrap_or_default();
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}
