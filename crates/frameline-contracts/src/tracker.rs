use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scene::SceneStateSnapshot;

/// Session-scoped record of accepted scene states.
///
/// Owned by the caller (one per editing session or request). Mutation takes
/// `&mut self`, so a single tracker has one writer at a time; callers that
/// share a tracker across threads wrap it in a `Mutex`.
///
/// Ordering within a group is call order: if two plans for the same group are
/// in flight at once, whichever calls [`StateTracker::set_scene_state`] last
/// becomes the previous state. Callers must serialize work per group.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    scenes: HashMap<String, Arc<SceneStateSnapshot>>,
    groups: HashMap<String, Vec<Arc<SceneStateSnapshot>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `state` under the scene index and appends it to the group's
    /// history. Returns the shared handle now held by the tracker.
    pub fn set_scene_state(
        &mut self,
        scene_id: impl Into<String>,
        group_id: impl Into<String>,
        state: SceneStateSnapshot,
    ) -> Arc<SceneStateSnapshot> {
        let scene_id = scene_id.into();
        let group_id = group_id.into();
        let shared = Arc::new(state);
        self.scenes.insert(scene_id.clone(), Arc::clone(&shared));
        let history = self.groups.entry(group_id.clone()).or_default();
        history.push(Arc::clone(&shared));
        tracing::debug!(
            scene_id = %scene_id,
            group_id = %group_id,
            depth = history.len(),
            "scene state committed"
        );
        shared
    }

    pub fn get_scene_state(&self, scene_id: &str) -> Option<Arc<SceneStateSnapshot>> {
        self.scenes.get(scene_id).cloned()
    }

    pub fn previous_state_in_group(&self, group_id: &str) -> Option<Arc<SceneStateSnapshot>> {
        self.groups
            .get(group_id)
            .and_then(|history| history.last())
            .cloned()
    }

    pub fn group_history(&self, group_id: &str) -> &[Arc<SceneStateSnapshot>] {
        self.groups
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drops the group's history so the next plan starts fresh. Point lookups
    /// by scene id are kept. Returns how many entries were discarded.
    pub fn reset_group(&mut self, group_id: &str) -> usize {
        let discarded = self
            .groups
            .remove(group_id)
            .map(|history| history.len())
            .unwrap_or(0);
        tracing::debug!(group_id, discarded, "continuity group reset");
        discarded
    }

    pub fn clear(&mut self) {
        self.scenes.clear();
        self.groups.clear();
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids = self.groups.keys().cloned().collect::<Vec<String>>();
        ids.sort();
        ids
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Copy of every group's history, for callers that persist it themselves.
    /// Scenes still indexed after their group was reset go under `detached`.
    pub fn export(&self) -> TrackerExport {
        let grouped = self
            .groups
            .values()
            .flatten()
            .map(|state| state.scene_id.as_str())
            .collect::<HashSet<&str>>();
        let detached = self
            .scenes
            .iter()
            .filter(|(scene_id, _)| !grouped.contains(scene_id.as_str()))
            .map(|(scene_id, state)| (scene_id.clone(), state.as_ref().clone()))
            .collect();
        let groups = self
            .groups
            .iter()
            .map(|(group_id, history)| {
                (
                    group_id.clone(),
                    history.iter().map(|state| state.as_ref().clone()).collect(),
                )
            })
            .collect();
        TrackerExport { groups, detached }
    }

    /// Rebuilds a tracker from an export; grouped scene ids come from the
    /// snapshots.
    pub fn restore(export: TrackerExport) -> Self {
        let mut tracker = Self::new();
        for (scene_id, state) in export.detached {
            tracker.scenes.insert(scene_id, Arc::new(state));
        }
        for (group_id, history) in export.groups {
            for state in history {
                let scene_id = state.scene_id.clone();
                tracker.set_scene_state(scene_id, group_id.clone(), state);
            }
        }
        tracker
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackerExport {
    pub groups: BTreeMap<String, Vec<SceneStateSnapshot>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detached: BTreeMap<String, SceneStateSnapshot>,
}
