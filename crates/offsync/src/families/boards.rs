//! Boards: the top-level containers, listed newest first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::controller::{CollectionController, CollectionDef};
use crate::error::{ControllerError, Result};
use crate::types::{CollectionScope, EntityId};

use super::{decode_all, decode_one, into_model, object, timestamp};

pub const FAMILY: &str = "boards";
pub const DEFAULT_BOARD_TITLE: &str = "New board";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

pub struct Boards {
    controller: Arc<CollectionController>,
}

impl Boards {
    pub fn def() -> CollectionDef {
        CollectionDef::new(FAMILY)
            .server_assigned_ids()
            .newest_first_by("created_at")
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

    /// Every board, newest first.
    pub fn boards(&self) -> Vec<Board> {
        decode_all(&self.controller)
    }

    pub fn board(&self, id: &EntityId) -> Option<Board> {
        let entity = self.controller.get(id)?;
        decode_one(&self.controller, &entity)
    }

    /// Create a board. A missing or blank title falls back to
    /// [`DEFAULT_BOARD_TITLE`].
    pub fn create_board(&self, title: Option<&str>) -> Result<Board> {
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_BOARD_TITLE,
        };
        let now = timestamp();
        let entity = self.controller.create(object(json!({
            "title": title,
            "created_at": now,
            "updated_at": now,
        })))?;
        into_model(entity)
    }

    pub fn rename_board(&self, id: &EntityId, title: &str) -> Result<Board> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ControllerError::Validation("board title must not be empty".into()).into());
        }
        let entity = self.controller.update(
            id,
            object(json!({ "title": title, "updated_at": timestamp() })),
        )?;
        into_model(entity)
    }

    pub fn delete_board(&self, id: &EntityId) -> Result<()> {
        self.controller.delete(id)
    }
}
