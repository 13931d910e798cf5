//! Routines: daily habits on a board, shown on one or more nodes.
//!
//! Two collections back this family. `routines` holds the habits of one
//! board with client-minted ids. `routine_nodes` holds the placements, one
//! row per (routine, node), ordered by `sort_order` within each node. The
//! routines controller must be opened before the links controller so that
//! regain drains replay habits ahead of the placements that point at them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::controller::{CollectionController, CollectionDef};
use crate::error::{ControllerError, OffsyncError, Result};
use crate::types::{CollectionScope, EntityId};

use super::{decode_all, decode_one, into_model, object, timestamp};

pub const FAMILY: &str = "routines";
pub const LINK_FAMILY: &str = "routine_nodes";

pub const ROUTINE_COLORS: &[&str] = &[
    "#8b5cf6", "#06b6d4", "#10b981", "#f59e0b", "#ef4444", "#ec4899", "#3b82f6", "#84cc16",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub id: EntityId,
    #[serde(default)]
    pub board_id: String,
    pub title: String,
    #[serde(default)]
    pub color: Option<String>,
    /// `YYYY-MM-DD` → checked. Unchecked days are absent.
    #[serde(default)]
    pub history: BTreeMap<String, bool>,
    /// Weekdays the routine is due, 0 = Sunday. `None` means every day.
    #[serde(default)]
    pub active_days: Option<Vec<u8>>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Routine {
    pub fn is_checked(&self, date: &str) -> bool {
        self.history.get(date).copied().unwrap_or(false)
    }

    pub fn is_active_on(&self, weekday: u8) -> bool {
        match &self.active_days {
            None => true,
            Some(days) => days.is_empty() || days.contains(&weekday),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineLink {
    pub id: EntityId,
    pub routine_id: String,
    pub node_id: String,
    #[serde(default)]
    pub sort_order: i64,
}

pub struct Routines {
    routines: Arc<CollectionController>,
    links: Arc<CollectionController>,
    board_id: String,
}

impl Routines {
    pub fn def() -> CollectionDef {
        CollectionDef::new(FAMILY)
    }

    pub fn link_def() -> CollectionDef {
        CollectionDef::new(LINK_FAMILY)
            .ordered_by("sort_order")
            .grouped_by("node_id")
    }

    pub fn scope(owner_id: &str, board_id: &str) -> CollectionScope {
        CollectionScope::new(FAMILY, owner_id).with_parent(board_id)
    }

    pub fn link_scope(owner_id: &str) -> CollectionScope {
        CollectionScope::new(LINK_FAMILY, owner_id)
    }

    pub fn new(routines: Arc<CollectionController>, links: Arc<CollectionController>) -> Self {
        let board_id = routines.scope().parent_id.clone().unwrap_or_default();
        Self {
            routines,
            links,
            board_id,
        }
    }

    pub fn controller(&self) -> &Arc<CollectionController> {
        &self.routines
    }

    pub fn link_controller(&self) -> &Arc<CollectionController> {
        &self.links
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn routines(&self) -> Vec<Routine> {
        decode_all(&self.routines)
    }

    pub fn routine(&self, id: &EntityId) -> Option<Routine> {
        let entity = self.routines.get(id)?;
        decode_one(&self.routines, &entity)
    }

    /// Placements of this board's routines, grouped by node in position
    /// order.
    pub fn links(&self) -> Vec<RoutineLink> {
        let ids: Vec<EntityId> = self.routines.entities().into_iter().map(|e| e.id).collect();
        decode_all::<RoutineLink>(&self.links)
            .into_iter()
            .filter(|l| ids.iter().any(|id| id.as_str() == l.routine_id))
            .collect()
    }

    /// Routines shown on `node_id`, in position order.
    pub fn routines_for_node(&self, node_id: &str) -> Vec<Routine> {
        let routines = self.routines();
        self.links
            .group(&Value::from(node_id))
            .iter()
            .filter_map(|e| decode_one::<RoutineLink>(&self.links, e))
            .filter_map(|link| {
                routines
                    .iter()
                    .find(|r| r.id.as_str() == link.routine_id)
                    .cloned()
            })
            .collect()
    }

    /// How many routines are checked on `date`.
    pub fn completed_count(&self, date: &str) -> usize {
        self.routines().iter().filter(|r| r.is_checked(date)).count()
    }

    /// Routines due on `date` (`YYYY-MM-DD`).
    pub fn active_routines_for(&self, date: &str) -> Result<Vec<Routine>> {
        let weekday = weekday_of(date)?;
        Ok(self
            .routines()
            .into_iter()
            .filter(|r| r.is_active_on(weekday))
            .collect())
    }

    pub fn pending_count(&self) -> usize {
        self.routines.status().pending_count + self.links.status().pending_count
    }

    // -----------------------------------------------------------------------
    // Routine mutations
    // -----------------------------------------------------------------------

    /// Create a routine with a random palette color and show it at the end
    /// of `node_id`.
    pub fn create_routine(&self, title: &str, node_id: &str) -> Result<Routine> {
        let title = non_empty(title)?;
        let color = ROUTINE_COLORS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(ROUTINE_COLORS[0]);
        let entity = self.routines.create(object(json!({
            "board_id": self.board_id,
            "title": title,
            "color": color,
            "history": {},
            "created_at": timestamp(),
        })))?;
        self.links.create(object(json!({
            "routine_id": entity.id.as_str(),
            "node_id": node_id,
        })))?;
        into_model(entity)
    }

    pub fn rename(&self, id: &EntityId, title: &str) -> Result<Routine> {
        let title = non_empty(title)?;
        into_model(self.routines.update(id, object(json!({ "title": title })))?)
    }

    pub fn recolor(&self, id: &EntityId, color: &str) -> Result<Routine> {
        into_model(self.routines.update(id, object(json!({ "color": color })))?)
    }

    /// Restrict the routine to the given weekdays (0 = Sunday). An empty
    /// slice makes it due every day.
    pub fn set_active_days(&self, id: &EntityId, days: &[u8]) -> Result<Routine> {
        if let Some(bad) = days.iter().find(|d| **d > 6) {
            let reason = format!("weekday {bad} is not in 0..=6");
            return Err(ControllerError::Validation(reason).into());
        }
        let mut days = days.to_vec();
        days.sort_unstable();
        days.dedup();
        let value = if days.is_empty() { Value::Null } else { json!(days) };
        into_model(self.routines.update(id, object(json!({ "active_days": value })))?)
    }

    /// Flip the check for `date`. Returns the new state.
    ///
    /// Rapid toggles of the same day collapse into one queued write, and an
    /// even number of them cancels out entirely.
    pub fn toggle_check(&self, id: &EntityId, date: &str) -> Result<bool> {
        weekday_of(date)?;
        let current = self
            .routines
            .latest()
            .into_iter()
            .find(|e| &e.id == id)
            .ok_or_else(|| self.routine_not_found(id))?;
        let prior = current
            .get("history")
            .and_then(|h| h.get(date))
            .cloned()
            .unwrap_or(Value::Null);
        let checked = prior.as_bool().unwrap_or(false);

        let next = if checked { Value::Null } else { Value::Bool(true) };
        self.routines.update_keyed(
            id,
            object(json!({ "history": { date: next } })),
            format!("check:{id}:{date}"),
            Some(json!({ "history": { date: prior } })),
        )?;
        Ok(!checked)
    }

    /// Delete a routine and every placement of it.
    pub fn delete_routine(&self, id: &EntityId) -> Result<()> {
        self.routines.delete(id)?;
        for link in self.links.latest() {
            if link.get_str("routine_id") == Some(id.as_str()) {
                self.links.delete(&link.id)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Placement mutations
    // -----------------------------------------------------------------------

    /// Show an existing routine on `node_id` too. Returns the existing
    /// placement when it is already there.
    pub fn add_to_node(&self, routine_id: &EntityId, node_id: &str) -> Result<RoutineLink> {
        if !self.routines.latest().iter().any(|e| &e.id == routine_id) {
            return Err(self.routine_not_found(routine_id));
        }
        if let Some(existing) = self.find_link(routine_id, node_id) {
            return Ok(existing);
        }
        into_model(self.links.create(object(json!({
            "routine_id": routine_id.as_str(),
            "node_id": node_id,
        })))?)
    }

    pub fn remove_from_node(&self, routine_id: &EntityId, node_id: &str) -> Result<()> {
        let link = self
            .find_link(routine_id, node_id)
            .ok_or_else(|| self.link_not_found(routine_id, node_id))?;
        self.links.delete(&link.id)
    }

    /// Move the routine at `from` to `to` within one node.
    pub fn reorder_in_node(&self, node_id: &str, from: usize, to: usize) -> Result<Vec<Routine>> {
        self.links.reorder(&Value::from(node_id), from, to)?;
        Ok(self.routines_for_node(node_id))
    }

    /// Move a routine's placement from one node to another at `position`.
    pub fn move_to_node(
        &self,
        routine_id: &EntityId,
        from_node: &str,
        to_node: &str,
        position: usize,
    ) -> Result<RoutineLink> {
        let link = self
            .find_link(routine_id, from_node)
            .ok_or_else(|| self.link_not_found(routine_id, from_node))?;
        if from_node != to_node && self.find_link(routine_id, to_node).is_some() {
            return Err(ControllerError::InvalidMove(format!(
                "routine {routine_id} is already on node {to_node}"
            ))
            .into());
        }
        into_model(self.links.move_into(&link.id, Value::from(to_node), position)?)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Reload both collections. Returns whether both committed remote state.
    pub async fn reload(&self) -> bool {
        let routines = self.routines.reload().await;
        let links = self.links.reload().await;
        routines && links
    }

    pub async fn process_invalidations(&self) -> usize {
        self.routines.process_invalidations().await + self.links.process_invalidations().await
    }

    pub async fn settle(&self) {
        self.routines.settle().await;
        self.links.settle().await;
    }

    fn find_link(&self, routine_id: &EntityId, node_id: &str) -> Option<RoutineLink> {
        self.links
            .latest()
            .iter()
            .filter(|e| {
                e.get_str("routine_id") == Some(routine_id.as_str())
                    && e.get_str("node_id") == Some(node_id)
            })
            .find_map(|e| decode_one(&self.links, e))
    }

    fn routine_not_found(&self, id: &EntityId) -> OffsyncError {
        ControllerError::NotFound {
            collection: self.routines.collection().to_string(),
            id: id.to_string(),
        }
        .into()
    }

    fn link_not_found(&self, routine_id: &EntityId, node_id: &str) -> OffsyncError {
        ControllerError::NotFound {
            collection: self.links.collection().to_string(),
            id: format!("{routine_id}@{node_id}"),
        }
        .into()
    }
}

fn non_empty(title: &str) -> Result<&str> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ControllerError::Validation("routine title must not be empty".into()).into());
    }
    Ok(title)
}

/// Day of week for `YYYY-MM-DD`, 0 = Sunday.
fn weekday_of(date: &str) -> Result<u8> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| ControllerError::Validation(format!("invalid date {date:?}: {e}")))?;
    Ok(parsed.weekday().num_days_from_sunday() as u8)
}
