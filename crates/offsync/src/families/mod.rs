//! Typed facades over the generic controller, one per entity family.

pub mod boards;
pub mod nodes;
pub mod pages;
pub mod routines;
pub mod uploads;

pub use boards::{Board, Boards};
pub use nodes::{NewNode, Node, Nodes};
pub use pages::{Milestone, Page, Pages};
pub use routines::{Routine, RoutineLink, Routines};
pub use uploads::{PendingUpload, UploadOutcome, UploadSyncReport, Uploads};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::controller::CollectionController;
use crate::error::{ControllerError, Result};
use crate::types::Entity;

/// Decode every entity of `controller`, skipping (and logging) rows that do
/// not fit the model.
pub(crate) fn decode_all<T: DeserializeOwned>(controller: &CollectionController) -> Vec<T> {
    controller
        .entities()
        .iter()
        .filter_map(|entity| decode_one(controller, entity))
        .collect()
}

pub(crate) fn decode_one<T: DeserializeOwned>(
    controller: &CollectionController,
    entity: &Entity,
) -> Option<T> {
    match entity.decode() {
        Ok(model) => Some(model),
        Err(e) => {
            tracing::warn!(
                collection = %controller.collection(),
                id = %entity.id,
                error = %e,
                "skipping undecodable entity"
            );
            None
        }
    }
}

/// Decode a freshly written entity into its model.
pub(crate) fn into_model<T: DeserializeOwned>(entity: Entity) -> Result<T> {
    entity.decode().map_err(|source| {
        ControllerError::Decode {
            id: entity.id.to_string(),
            source,
        }
        .into()
    })
}

/// Unwrap a `json!` object literal.
pub(crate) fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Current UTC time as a fixed-width RFC 3339 string, so that lexical and
/// chronological order agree.
pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
