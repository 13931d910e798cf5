//! Nodes: the cards placed on one board, stacked by `z_index`.
//!
//! The collection is ordered by `z_index` in a single group, so stacking
//! changes that swap neighbours reuse the generic reorder and travel as one
//! composite action. Jumping to the top or bottom is a plain update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::controller::{CollectionController, CollectionDef};
use crate::error::{ControllerError, Result};
use crate::types::{CollectionScope, EntityId};

use super::{decode_all, decode_one, into_model, object, timestamp};

pub const FAMILY: &str = "nodes";
pub const DEFAULT_NODE_KIND: &str = "image";
pub const DEFAULT_NODE_SIZE: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: EntityId,
    #[serde(default)]
    pub board_id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_size")]
    pub width: f64,
    #[serde(default = "default_size")]
    pub height: f64,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub z_index: i64,
}

fn default_kind() -> String {
    DEFAULT_NODE_KIND.to_string()
}

fn default_size() -> f64 {
    DEFAULT_NODE_SIZE
}

/// Fields for a node about to be placed. `z_index` is assigned on top of
/// the current stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Default for NewNode {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            x: 0.0,
            y: 0.0,
            width: DEFAULT_NODE_SIZE,
            height: DEFAULT_NODE_SIZE,
            image_url: None,
            content: None,
            color: None,
        }
    }
}

impl NewNode {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }
}

pub struct Nodes {
    controller: Arc<CollectionController>,
    board_id: String,
}

impl Nodes {
    pub fn def() -> CollectionDef {
        CollectionDef::new(FAMILY)
            .server_assigned_ids()
            .ordered_by("z_index")
    }

    pub fn scope(owner_id: &str, board_id: &str) -> CollectionScope {
        CollectionScope::new(FAMILY, owner_id).with_parent(board_id)
    }

    pub fn new(controller: Arc<CollectionController>) -> Self {
        let board_id = controller.scope().parent_id.clone().unwrap_or_default();
        Self {
            controller,
            board_id,
        }
    }

    pub fn controller(&self) -> &Arc<CollectionController> {
        &self.controller
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Nodes from bottom to top.
    pub fn sorted_by_z(&self) -> Vec<Node> {
        decode_all(&self.controller)
    }

    pub fn node(&self, id: &EntityId) -> Option<Node> {
        let entity = self.controller.get(id)?;
        decode_one(&self.controller, &entity)
    }

    pub fn add_node(&self, node: NewNode) -> Result<Node> {
        let mut fields = match serde_json::to_value(&node) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => Map::new(),
            Err(e) => return Err(ControllerError::Validation(e.to_string()).into()),
        };
        fields.insert("board_id".into(), Value::from(self.board_id.clone()));
        fields.insert("created_at".into(), Value::from(timestamp()));
        into_model(self.controller.create(fields)?)
    }

    pub fn update_node(&self, id: &EntityId, patch: Map<String, Value>) -> Result<Node> {
        into_model(self.controller.update(id, patch)?)
    }

    /// Point an image node at an uploaded file.
    pub fn set_image(&self, id: &EntityId, url: &str) -> Result<Node> {
        self.update_node(id, object(json!({ "image_url": url })))
    }

    pub fn delete_node(&self, id: &EntityId) -> Result<()> {
        self.controller.delete(id)
    }

    /// Raise `id` above every other node.
    pub fn bring_to_front(&self, id: &EntityId) -> Result<Node> {
        let (current, others) = self.stack_around(id)?;
        match others.iter().map(|n| n.z_index).max() {
            Some(top) if current.z_index <= top => {
                self.update_node(id, object(json!({ "z_index": top + 1 })))
            }
            _ => Ok(current),
        }
    }

    /// Lower `id` beneath every other node.
    pub fn send_to_back(&self, id: &EntityId) -> Result<Node> {
        let (current, others) = self.stack_around(id)?;
        match others.iter().map(|n| n.z_index).min() {
            Some(bottom) if current.z_index >= bottom => {
                self.update_node(id, object(json!({ "z_index": bottom - 1 })))
            }
            _ => Ok(current),
        }
    }

    /// Swap `id` with the node directly above it. Returns the new stack.
    pub fn bring_forward(&self, id: &EntityId) -> Result<Vec<Node>> {
        let index = self.stack_index(id)?;
        let len = self.controller.latest().len();
        if index + 1 >= len {
            return Ok(self.sorted_by_z());
        }
        self.controller.reorder(&Value::Null, index, index + 1)?;
        Ok(self.sorted_by_z())
    }

    /// Swap `id` with the node directly beneath it. Returns the new stack.
    pub fn send_backward(&self, id: &EntityId) -> Result<Vec<Node>> {
        let index = self.stack_index(id)?;
        if index == 0 {
            return Ok(self.sorted_by_z());
        }
        self.controller.reorder(&Value::Null, index, index - 1)?;
        Ok(self.sorted_by_z())
    }

    fn stack_index(&self, id: &EntityId) -> Result<usize> {
        self.controller
            .latest()
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| self.not_found(id))
    }

    fn stack_around(&self, id: &EntityId) -> Result<(Node, Vec<Node>)> {
        let mut current = None;
        let mut others = Vec::new();
        for entity in self.controller.latest() {
            let Some(node) = decode_one::<Node>(&self.controller, &entity) else {
                continue;
            };
            if &node.id == id {
                current = Some(node);
            } else {
                others.push(node);
            }
        }
        let current = current.ok_or_else(|| self.not_found(id))?;
        Ok((current, others))
    }

    fn not_found(&self, id: &EntityId) -> crate::error::OffsyncError {
        ControllerError::NotFound {
            collection: self.controller.collection().to_string(),
            id: id.to_string(),
        }
        .into()
    }
}
