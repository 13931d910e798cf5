//! CollectionDef: what the engine needs to know about one entity family,
//! plus the apply function every layer shares.

use std::cmp::Ordering;

use serde_json::Value;

use crate::patch;
use crate::types::{ActionKind, Entity, PendingAction};

#[derive(Debug, Clone)]
pub struct CollectionDef {
    pub family: String,
    /// The remote mints ids; creates carry a local id until confirmed.
    pub server_assigned_ids: bool,
    /// Integer position field used by reorder and move.
    pub order_field: Option<String>,
    /// Field naming the group an ordered entity belongs to.
    pub group_field: Option<String>,
    /// Field sorted descending for unordered collections (newest first).
    pub newest_first_by: Option<String>,
}

impl CollectionDef {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            server_assigned_ids: false,
            order_field: None,
            group_field: None,
            newest_first_by: None,
        }
    }

    pub fn server_assigned_ids(mut self) -> Self {
        self.server_assigned_ids = true;
        self
    }

    pub fn ordered_by(mut self, field: impl Into<String>) -> Self {
        self.order_field = Some(field.into());
        self
    }

    pub fn grouped_by(mut self, field: impl Into<String>) -> Self {
        self.group_field = Some(field.into());
        self
    }

    pub fn newest_first_by(mut self, field: impl Into<String>) -> Self {
        self.newest_first_by = Some(field.into());
        self
    }

    /// The group `entity` belongs to (`Null` when ungrouped).
    pub fn group_of<'a>(&self, entity: &'a Entity) -> &'a Value {
        self.group_field
            .as_ref()
            .and_then(|f| entity.get(f))
            .unwrap_or(&Value::Null)
    }

    pub fn position_of(&self, entity: &Entity) -> Option<i64> {
        self.order_field.as_ref().and_then(|f| entity.get_i64(f))
    }

    /// Put entities into presentation order. Stable, so ties keep their
    /// current relative order.
    pub fn sort(&self, entities: &mut [Entity]) {
        if self.order_field.is_some() {
            entities.sort_by(|a, b| {
                compare_values(self.group_of(a), self.group_of(b)).then_with(|| {
                    self.position_of(a)
                        .unwrap_or(i64::MAX)
                        .cmp(&self.position_of(b).unwrap_or(i64::MAX))
                })
            });
        } else if let Some(field) = &self.newest_first_by {
            entities.sort_by(|a, b| {
                compare_values(
                    b.get(field).unwrap_or(&Value::Null),
                    a.get(field).unwrap_or(&Value::Null),
                )
            });
        }
    }

    /// Apply `action` to `entities` and restore presentation order.
    pub fn apply(&self, entities: &mut Vec<Entity>, action: &PendingAction) {
        apply_action(entities, action, self.newest_first_by.is_some());
        self.sort(entities);
    }
}

/// Apply one action to a collection's entity list.
///
/// Idempotent: applying the same action twice equals applying it once,
/// which rebasing relies on. A create of an existing id replaces it; writes
/// to missing ids are ignored.
pub fn apply_action(entities: &mut Vec<Entity>, action: &PendingAction, prepend: bool) {
    match action.kind {
        ActionKind::Create => {
            let Some(entity) = action.created_entity() else {
                return;
            };
            if let Some(existing) = entities.iter_mut().find(|e| e.id == entity.id) {
                *existing = entity;
            } else if prepend {
                entities.insert(0, entity);
            } else {
                entities.push(entity);
            }
        }
        ActionKind::Update => {
            let Some(update) = action.update_patch() else {
                return;
            };
            if let Some(entity) = entities.iter_mut().find(|e| e.id == action.target_id) {
                patch::merge_fields(&mut entity.fields, update);
                entity.fields.remove("id");
            }
        }
        ActionKind::Delete => entities.retain(|e| e.id != action.target_id),
        ActionKind::Reorder | ActionKind::Move => {
            for update in action.composite_updates() {
                if let Some(entity) = entities.iter_mut().find(|e| e.id == update.id) {
                    patch::merge_fields(&mut entity.fields, &update.patch);
                    entity.fields.remove("id");
                }
            }
        }
    }
}

/// Total order over JSON scalars good enough for grouping and sorting:
/// null < bool < number < string; arrays and objects compare as equal.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
