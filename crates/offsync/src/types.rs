//! Core data model: entities, cache envelopes, pending actions and
//! invalidation events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix carried by ids minted locally before the remote confirms a create.
pub const DEFAULT_LOCAL_ID_PREFIX: &str = "temp_";

// ============================================================================
// EntityId
// ============================================================================

/// Stable identifier of an entity within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a provisional id that the remote will replace on confirmation.
    pub fn mint_local(prefix: &str) -> Self {
        Self(format!("{prefix}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Mint a final id for collections whose remote accepts client ids.
    pub fn mint_client() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted locally and is still unconfirmed.
    pub fn is_local(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(prefix)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for EntityId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EntityId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ============================================================================
// Entity
// ============================================================================

/// An opaque collection-scoped record. Field mapping is left to the entity
/// families; the engine only looks at `id` and the configured order/group
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Decode into a typed model.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::to_value(self).and_then(serde_json::from_value)
    }

    /// Encode a typed model. The model must serialize to an object with a
    /// string `id` field.
    pub fn encode<T: Serialize>(model: &T) -> serde_json::Result<Self> {
        serde_json::to_value(model).and_then(serde_json::from_value)
    }
}

// ============================================================================
// CacheEnvelope
// ============================================================================

/// Serialized snapshot of a collection's known-good state. This is the only
/// thing read on cold start before any network activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub entities: Vec<Entity>,
}

impl CacheEnvelope {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }
}

// ============================================================================
// PendingAction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    /// Full post-state of one sibling ordering.
    Reorder,
    /// Move into a group at a position; carries the post-state of every
    /// ordering it touched.
    Move,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reorder => "reorder",
            Self::Move => "move",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Reorder | Self::Move)
    }
}

/// One entity's share of a composite write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    pub id: EntityId,
    pub patch: Map<String, Value>,
}

/// An unconfirmed write, as persisted in the pending queue.
///
/// Payload shapes by kind:
/// - `Create`: the full entity (`{"id": .., ..fields}`)
/// - `Update`: a JSON merge patch of the entity's fields
/// - `Delete`: `null`
/// - `Reorder` / `Move`: `{"updates": [{"id": .., "patch": {..}}, ..]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub kind: ActionKind,
    pub target_id: EntityId,
    pub payload: Value,
    pub logged_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Confirmed value the dedupe-keyed write started from. A replacement
    /// whose payload equals it cancels the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingAction {
    fn with_payload(kind: ActionKind, target_id: EntityId, payload: Value) -> Self {
        Self {
            kind,
            target_id,
            payload,
            logged_at: Utc::now(),
            dedupe_key: None,
            baseline: None,
            attempts: 0,
        }
    }

    pub fn create(entity: &Entity) -> Self {
        let payload = serde_json::to_value(entity).unwrap_or(Value::Null);
        Self::with_payload(ActionKind::Create, entity.id.clone(), payload)
    }

    pub fn update(id: EntityId, patch: Map<String, Value>) -> Self {
        Self::with_payload(ActionKind::Update, id, Value::Object(patch))
    }

    pub fn delete(id: EntityId) -> Self {
        Self::with_payload(ActionKind::Delete, id, Value::Null)
    }

    pub fn composite(kind: ActionKind, target_id: EntityId, updates: &[EntityPatch]) -> Self {
        let updates = serde_json::to_value(updates).unwrap_or(Value::Array(Vec::new()));
        let mut payload = Map::new();
        payload.insert("updates".to_string(), updates);
        Self::with_payload(kind, target_id, Value::Object(payload))
    }

    /// Attach a latest-value-wins identity.
    pub fn with_dedupe(mut self, key: impl Into<String>, baseline: Option<Value>) -> Self {
        self.dedupe_key = Some(key.into());
        self.baseline = baseline;
        self
    }

    /// The entity carried by a `Create` payload.
    pub fn created_entity(&self) -> Option<Entity> {
        if self.kind != ActionKind::Create {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// The merge patch carried by an `Update` payload.
    pub fn update_patch(&self) -> Option<&Map<String, Value>> {
        match self.kind {
            ActionKind::Update => self.payload.as_object(),
            _ => None,
        }
    }

    /// Per-entity writes of a composite action.
    pub fn composite_updates(&self) -> Vec<EntityPatch> {
        if !self.kind.is_composite() {
            return Vec::new();
        }
        self.payload
            .get("updates")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_composite_updates(&mut self, updates: &[EntityPatch]) {
        if let Some(obj) = self.payload.as_object_mut() {
            obj.insert(
                "updates".to_string(),
                serde_json::to_value(updates).unwrap_or(Value::Array(Vec::new())),
            );
        }
    }

    /// Every entity id this action writes to.
    pub fn referenced_ids(&self) -> Vec<EntityId> {
        if self.kind.is_composite() {
            let mut ids: Vec<EntityId> = self
                .composite_updates()
                .into_iter()
                .map(|u| u.id)
                .collect();
            if !ids.contains(&self.target_id) {
                ids.push(self.target_id.clone());
            }
            ids
        } else {
            vec![self.target_id.clone()]
        }
    }

    pub fn references(&self, id: &EntityId) -> bool {
        &self.target_id == id || self.referenced_ids().iter().any(|r| r == id)
    }

    /// Replace every reference to `local` with `server`: the target, the
    /// created entity's id, composite members, and top-level field values
    /// equal to `local`. Returns whether anything changed.
    pub fn rewrite_id(&mut self, local: &EntityId, server: &EntityId) -> bool {
        let mut changed = false;
        if &self.target_id == local {
            self.target_id = server.clone();
            changed = true;
        }
        if self.kind.is_composite() {
            let mut updates = self.composite_updates();
            let mut touched = false;
            for update in updates.iter_mut() {
                if &update.id == local {
                    update.id = server.clone();
                    touched = true;
                }
                touched |= rewrite_field_values(&mut update.patch, local, server);
            }
            if touched {
                self.set_composite_updates(&updates);
                changed = true;
            }
        } else if let Some(fields) = self.payload.as_object_mut() {
            changed |= rewrite_field_values(fields, local, server);
        }
        changed
    }
}

/// Replace top-level string fields equal to `local`. Returns whether
/// anything changed.
pub fn rewrite_field_values(
    fields: &mut Map<String, Value>,
    local: &EntityId,
    server: &EntityId,
) -> bool {
    let mut changed = false;
    for value in fields.values_mut() {
        if value.as_str() == Some(local.as_str()) {
            *value = Value::String(server.to_string());
            changed = true;
        }
    }
    changed
}

// ============================================================================
// Collection identity
// ============================================================================

/// Addresses one remote-backed collection: the entity family, the owner
/// (session/user) and an optional parent such as a board id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionScope {
    pub family: String,
    pub owner_id: String,
    pub parent_id: Option<String>,
}

impl CollectionScope {
    pub fn new(family: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            owner_id: owner_id.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Namespace key used for the cache, the queue and the bus.
    pub fn key(&self) -> String {
        match &self.parent_id {
            Some(parent) => format!("{}:{parent}", self.family),
            None => self.family.clone(),
        }
    }
}

/// Random identity of one live controller instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn random(family: &str) -> Self {
        Self(format!("{family}_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A collection's authoritative state may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub collection: String,
    pub source_instance_id: InstanceId,
}
