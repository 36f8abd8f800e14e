// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Raw change payloads and their classification into [`ChangeEvent`]s.
//!
//! The change stream delivers row-level before/after images. Only UPDATEs
//! carry a delta worth surfacing; the old and new rows are diffed field by
//! field and the delta is classified:
//!
//! | Delta                                   | Event type    | Priority |
//! |-----------------------------------------|---------------|----------|
//! | status moved into a terminal state      | Critical      | High     |
//! | status moved into a completion state    | Completion    | Normal   |
//! | exactly one low-impact field (venue...) | Informational | Low      |
//! | anything else                           | Informational | Normal   |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Row operation reported by the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Row-level change as received from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "type")]
    pub op: ChangeOp,
    #[serde(default)]
    pub old: Option<Map<String, Value>>,
    #[serde(default)]
    pub new: Option<Map<String, Value>>,
    /// Epoch ms.
    pub commit_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Critical,
    Completion,
    Informational,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Completion => "completion",
            Self::Informational => "informational",
        }
    }

    pub const ALL: [EventType; 3] = [Self::Critical, Self::Completion, Self::Informational];
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// A classified update to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub table: String,
    pub event_type: EventType,
    pub field_changes: BTreeMap<String, FieldChange>,
    pub timestamp: i64,
    pub priority: Priority,
}

impl ChangeEvent {
    /// New values of every changed field.
    pub fn new_values(&self) -> impl Iterator<Item = (String, Value)> + '_ {
        self.field_changes
            .iter()
            .map(|(field, change)| (field.clone(), change.new.clone()))
    }
}

/// How deltas are classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationRules {
    /// Row field holding the entity id.
    pub id_field: String,
    /// Row field holding the match status.
    pub status_field: String,
    /// Statuses that make a change critical (lowercase).
    pub terminal_statuses: Vec<String>,
    /// Statuses that mark a match finished (lowercase).
    pub completion_statuses: Vec<String>,
    /// Fields whose sole change is low priority.
    pub low_impact_fields: Vec<String>,
    /// Bookkeeping fields left out of the diff.
    pub ignored_fields: Vec<String>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            id_field: "id".into(),
            status_field: "status".into(),
            terminal_statuses: strings(&["cancelled", "canceled", "abandoned", "postponed", "forfeited"]),
            completion_statuses: strings(&["completed", "final", "finished"]),
            low_impact_fields: strings(&["venue", "venue_id", "venue_name", "field_number", "court"]),
            ignored_fields: strings(&["updated_at"]),
        }
    }
}

impl ClassificationRules {
    /// Field-by-field delta between the old and new row images.
    pub fn diff(&self, old: &Map<String, Value>, new: &Map<String, Value>) -> BTreeMap<String, FieldChange> {
        let mut changes = BTreeMap::new();
        for (field, new_value) in new {
            if self.ignored_fields.iter().any(|f| f == field) {
                continue;
            }
            let old_value = old.get(field).cloned().unwrap_or(Value::Null);
            if &old_value != new_value {
                changes.insert(
                    field.clone(),
                    FieldChange {
                        old: old_value,
                        new: new_value.clone(),
                    },
                );
            }
        }
        for (field, old_value) in old {
            if !new.contains_key(field) && !self.ignored_fields.iter().any(|f| f == field) {
                changes.insert(
                    field.clone(),
                    FieldChange {
                        old: old_value.clone(),
                        new: Value::Null,
                    },
                );
            }
        }
        changes
    }

    fn status_in(value: &Value, set: &[String]) -> bool {
        value
            .as_str()
            .map(|s| s.to_lowercase())
            .is_some_and(|s| set.iter().any(|t| *t == s))
    }

    /// Event type and priority for a delta.
    pub fn classify(&self, changes: &BTreeMap<String, FieldChange>) -> (EventType, Priority) {
        if let Some(status) = changes.get(&self.status_field) {
            if Self::status_in(&status.new, &self.terminal_statuses) {
                return (EventType::Critical, Priority::High);
            }
            if Self::status_in(&status.new, &self.completion_statuses) {
                return (EventType::Completion, Priority::Normal);
            }
        }
        let single_low_impact =
            changes.len() == 1 && changes.keys().all(|k| self.low_impact_fields.iter().any(|f| f == k));
        if single_low_impact {
            (EventType::Informational, Priority::Low)
        } else {
            (EventType::Informational, Priority::Normal)
        }
    }

    /// Build an event from a raw change. `None` for non-updates, rows
    /// without an id, and updates that change nothing.
    pub fn to_event(&self, raw: &RawChange) -> Option<ChangeEvent> {
        if raw.op != ChangeOp::Update {
            return None;
        }
        let new = raw.new.as_ref()?;
        let empty = Map::new();
        let old = raw.old.as_ref().unwrap_or(&empty);

        let entity_id = match new.get(&self.id_field).or_else(|| old.get(&self.id_field))? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let field_changes = self.diff(old, new);
        if field_changes.is_empty() {
            return None;
        }
        let (event_type, priority) = self.classify(&field_changes);
        Some(ChangeEvent {
            entity_id,
            table: raw.table.clone(),
            event_type,
            field_changes,
            timestamp: raw.commit_timestamp,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn update(old: Value, new: Value) -> RawChange {
        RawChange {
            table: "matches".into(),
            op: ChangeOp::Update,
            old: Some(row(old)),
            new: Some(row(new)),
            commit_timestamp: 1_000,
        }
    }

    #[test]
    fn test_cancellation_is_critical() {
        let rules = ClassificationRules::default();
        let event = rules
            .to_event(&update(
                json!({"id": "m1", "status": "scheduled"}),
                json!({"id": "m1", "status": "Cancelled"}),
            ))
            .unwrap();
        assert_eq!(event.entity_id, "m1");
        assert_eq!(event.event_type, EventType::Critical);
        assert_eq!(event.priority, Priority::High);
        assert_eq!(event.field_changes["status"].old, json!("scheduled"));
    }

    #[test]
    fn test_completion() {
        let rules = ClassificationRules::default();
        let event = rules
            .to_event(&update(
                json!({"id": 7, "status": "live", "home_score": 1}),
                json!({"id": 7, "status": "final", "home_score": 2}),
            ))
            .unwrap();
        assert_eq!(event.entity_id, "7");
        assert_eq!(event.event_type, EventType::Completion);
        assert_eq!(event.priority, Priority::Normal);
        assert_eq!(event.field_changes.len(), 2);
    }

    #[test]
    fn test_venue_only_change_is_low() {
        let rules = ClassificationRules::default();
        let event = rules
            .to_event(&update(
                json!({"id": "m1", "venue": "Field A", "updated_at": 1}),
                json!({"id": "m1", "venue": "Field B", "updated_at": 2}),
            ))
            .unwrap();
        assert_eq!(event.event_type, EventType::Informational);
        assert_eq!(event.priority, Priority::Low);
    }

    #[test]
    fn test_schedule_change_is_normal() {
        let rules = ClassificationRules::default();
        let event = rules
            .to_event(&update(
                json!({"id": "m1", "venue": "A", "kickoff": "10:00"}),
                json!({"id": "m1", "venue": "B", "kickoff": "11:00"}),
            ))
            .unwrap();
        assert_eq!(event.event_type, EventType::Informational);
        assert_eq!(event.priority, Priority::Normal);
    }

    #[test]
    fn test_non_updates_and_noops_are_ignored() {
        let rules = ClassificationRules::default();
        let mut insert = update(json!({}), json!({"id": "m1"}));
        insert.op = ChangeOp::Insert;
        assert!(rules.to_event(&insert).is_none());

        let noop = update(json!({"id": "m1", "updated_at": 1}), json!({"id": "m1", "updated_at": 2}));
        assert!(rules.to_event(&noop).is_none());

        let no_id = update(json!({"status": "a"}), json!({"status": "b"}));
        assert!(rules.to_event(&no_id).is_none());
    }

    #[test]
    fn test_removed_field_shows_as_null() {
        let rules = ClassificationRules::default();
        let changes = rules.diff(&row(json!({"id": "m1", "notes": "x"})), &row(json!({"id": "m1"})));
        assert_eq!(changes["notes"].new, Value::Null);
    }

    #[test]
    fn test_raw_change_wire_format() {
        let raw: RawChange = serde_json::from_value(json!({
            "table": "matches",
            "type": "UPDATE",
            "old": {"id": "m1"},
            "new": {"id": "m1", "status": "final"},
            "commit_timestamp": 5
        }))
        .unwrap();
        assert_eq!(raw.op, ChangeOp::Update);
    }

    #[test]
    fn test_custom_rules() {
        let rules = ClassificationRules {
            status_field: "state".into(),
            terminal_statuses: vec!["void".into()],
            ..Default::default()
        };
        let event = rules
            .to_event(&update(json!({"id": "m1", "state": "open"}), json!({"id": "m1", "state": "void"})))
            .unwrap();
        assert_eq!(event.event_type, EventType::Critical);
    }
}
