//! Project filter applied to cached actions before they reach the browser.
//!
//! Cached blobs are shared across projects for one configuration, so launcher
//! actions must be narrowed to the software entities the current project can
//! actually see. Precedence:
//!
//! 1. no `engine_name` -> not a launcher, pass through;
//! 2. `software_entity_id` carried: `null` passes, an id passes only when a
//!    matching software entity exists in the snapshot and is visible to the
//!    project;
//! 3. legacy actions (no `software_entity_id` key) match by engine name
//!    against project-visible software entities.

use serde_json::Value;
use wsb_protocol::Action;

pub fn filter_actions(actions: Vec<Action>, site_state: &[Value], project_id: i64) -> Vec<Action> {
    actions
        .into_iter()
        .filter(|action| action_visible(action, site_state, project_id))
        .collect()
}

fn action_visible(action: &Action, site_state: &[Value], project_id: i64) -> bool {
    let Some(engine_name) = action.engine_name.as_deref() else {
        return true;
    };
    match action.software_entity_id {
        Some(None) => true,
        Some(Some(id)) => site_state
            .iter()
            .any(|entity| entity_id(entity) == Some(id) && visible_to_project(entity, project_id)),
        None => site_state.iter().any(|entity| {
            entity_engine(entity) == Some(engine_name) && visible_to_project(entity, project_id)
        }),
    }
}

fn entity_id(entity: &Value) -> Option<i64> {
    entity.get("id").and_then(Value::as_i64)
}

fn entity_engine(entity: &Value) -> Option<&str> {
    entity.get("engine").and_then(Value::as_str)
}

/// A software entity with an empty (or missing) `projects` list is visible
/// everywhere; otherwise the current project must be listed.
fn visible_to_project(entity: &Value, project_id: i64) -> bool {
    match entity.get("projects").and_then(Value::as_array) {
        None => true,
        Some(projects) if projects.is_empty() => true,
        Some(projects) => projects
            .iter()
            .any(|proj| proj.get("id").and_then(Value::as_i64) == Some(project_id)),
    }
}
