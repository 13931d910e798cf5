//! Pages: the long-form document attached to a node, at most one per node.
//!
//! Editors save often, so page writes are keyed per node: however many
//! saves happen offline, one write per node survives in the queue and it
//! carries the full latest snapshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::controller::{CollectionController, CollectionDef};
use crate::error::{ControllerError, Result};
use crate::patch;
use crate::types::{CollectionScope, Entity, EntityId};

use super::{decode_all, decode_one, into_model, object, timestamp};

pub const FAMILY: &str = "pages";

/// Fields owned by the engine or by dedicated writers; never part of a
/// page snapshot.
const RESERVED: &[&str] = &["id", "node_id", "milestones"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, rename = "completedAt")]
    pub completed_at: Option<String>,
}

impl Milestone {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: EntityId::mint_client().to_string(),
            title: title.into(),
            completed: false,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: EntityId,
    pub node_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

pub struct Pages {
    controller: Arc<CollectionController>,
}

impl Pages {
    pub fn def() -> CollectionDef {
        CollectionDef::new(FAMILY)
    }

    pub fn scope(owner_id: &str) -> CollectionScope {
        CollectionScope::new(FAMILY, owner_id)
    }

    pub fn new(controller: Arc<CollectionController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<CollectionController> {
        &self.controller
    }

    pub fn pages(&self) -> Vec<Page> {
        decode_all(&self.controller)
    }

    pub fn page(&self, node_id: &str) -> Option<Page> {
        let entity = self
            .controller
            .entities()
            .into_iter()
            .find(|e| e.get_str("node_id") == Some(node_id))?;
        decode_one(&self.controller, &entity)
    }

    /// Upsert the page of `node_id` with `patch`.
    ///
    /// The first save creates the page. Later saves send the page's full
    /// content snapshot, so a queued save replaced by a newer one loses
    /// nothing.
    pub fn save_page(&self, node_id: &str, patch: Map<String, Value>) -> Result<Page> {
        if let Some(key) = RESERVED.iter().find(|k| patch.contains_key(**k)) {
            let reason = format!("page field {key:?} cannot be saved");
            return Err(ControllerError::Validation(reason).into());
        }
        let Some(existing) = self.latest_page(node_id) else {
            let mut fields = patch;
            fields.retain(|_, v| !v.is_null());
            fields.insert("node_id".into(), Value::from(node_id));
            fields.insert("milestones".into(), json!([]));
            fields.insert("updated_at".into(), Value::from(timestamp()));
            return into_model(self.controller.create(fields)?);
        };
        if patch::is_noop(&existing.fields, &patch) {
            return into_model(existing);
        }

        let mut snapshot = existing.fields.clone();
        patch::merge_fields(&mut snapshot, &patch);
        snapshot.retain(|k, _| !RESERVED.contains(&k.as_str()));
        for (key, value) in &patch {
            if value.is_null() {
                snapshot.insert(key.clone(), Value::Null);
            }
        }
        snapshot.insert("updated_at".into(), Value::from(timestamp()));

        into_model(self.controller.update_keyed(
            &existing.id,
            snapshot,
            format!("page:{node_id}"),
            None,
        )?)
    }

    /// Replace the milestone list of `node_id`'s page, creating the page
    /// when it does not exist yet.
    pub fn save_milestones(&self, node_id: &str, milestones: &[Milestone]) -> Result<Page> {
        let list = serde_json::to_value(milestones)
            .map_err(|e| ControllerError::Validation(e.to_string()))?;
        let Some(existing) = self.latest_page(node_id) else {
            return into_model(self.controller.create(object(json!({
                "node_id": node_id,
                "milestones": list,
                "updated_at": timestamp(),
            })))?);
        };
        into_model(self.controller.update_keyed(
            &existing.id,
            object(json!({ "milestones": list })),
            format!("milestones:{node_id}"),
            None,
        )?)
    }

    /// Flip one milestone's completion, stamping when it was completed.
    pub fn toggle_milestone(&self, node_id: &str, milestone_id: &str) -> Result<Page> {
        let page: Page = self
            .latest_page(node_id)
            .map(into_model::<Page>)
            .transpose()?
            .ok_or_else(|| self.not_found(node_id))?;
        let mut milestones = page.milestones;
        let milestone = milestones
            .iter_mut()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| self.not_found(&format!("{node_id}#{milestone_id}")))?;
        milestone.completed = !milestone.completed;
        milestone.completed_at = milestone.completed.then(timestamp);
        self.save_milestones(node_id, &milestones)
    }

    fn latest_page(&self, node_id: &str) -> Option<Entity> {
        self.controller
            .latest()
            .into_iter()
            .find(|e| e.get_str("node_id") == Some(node_id))
    }

    fn not_found(&self, id: &str) -> crate::error::OffsyncError {
        ControllerError::NotFound {
            collection: self.controller.collection().to_string(),
            id: id.to_string(),
        }
        .into()
    }
}
