use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type ToastId = Uuid;
pub type HistoryId = Uuid;

/// Logical collection on the server whose mutations are broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Entity {
    LeaveRecords,
    Personnel,
    UserAccounts,
    LeaveTypes,
    Holidays,
    Audit,
    Other(String),
}

impl Entity {
    pub fn as_str(&self) -> &str {
        match self {
            Entity::LeaveRecords => "leave_records",
            Entity::Personnel => "personnel",
            Entity::UserAccounts => "user_accounts",
            Entity::LeaveTypes => "leave_types",
            Entity::Holidays => "holidays",
            Entity::Audit => "audit",
            Entity::Other(raw) => raw,
        }
    }

    pub fn is_audit(&self) -> bool {
        matches!(self, Entity::Audit)
    }
}

impl From<&str> for Entity {
    fn from(raw: &str) -> Self {
        match raw {
            "leave_records" | "leaves" => Entity::LeaveRecords,
            "personnel" => Entity::Personnel,
            "user_accounts" | "users" => Entity::UserAccounts,
            "leave_types" => Entity::LeaveTypes,
            "holidays" => Entity::Holidays,
            "audit" => Entity::Audit,
            other => Entity::Other(other.to_string()),
        }
    }
}

impl From<String> for Entity {
    fn from(raw: String) -> Self {
        Entity::from(raw.as_str())
    }
}

impl From<Entity> for String {
    fn from(entity: Entity) -> Self {
        entity.as_str().to_string()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Create,
    Update,
    Delete,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Other(raw) => raw,
        }
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            _ => Action::Other(raw),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A single server-pushed notice that one entity instance changed.
///
/// Only `entity` and `action` are required. The remaining fields are decoded
/// leniently so an unexpected shape never costs the whole event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: Entity,
    pub action: Action,
    #[serde(rename = "username", default, deserialize_with = "actor_name")]
    pub actor_name: String,
    #[serde(default)]
    pub details: Value,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub entity_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

// Mismatched types decode as None instead of failing the frame.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn actor_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(name) => name,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    DataChange(ChangeEvent),
    /// Transport-level frames (acks and the like) this hub does not act on.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn data_change_frame_decodes_with_wire_aliases() {
        let frame = json!({
            "type": "data_change",
            "entity": "leaves",
            "action": "delete",
            "username": "admin1",
            "entity_id": 42,
            "details": {"id": 42},
        });

        let msg: ServerMsg = serde_json::from_value(frame).unwrap();
        let ServerMsg::DataChange(event) = msg else {
            panic!("expected data_change");
        };
        assert_eq!(event.entity, Entity::LeaveRecords);
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.actor_name, "admin1");
        assert_eq!(event.entity_id, Some(42));
        assert_eq!(event.details, json!({"id": 42}));
    }

    #[test]
    fn unknown_frame_kind_is_other() {
        let msg: ServerMsg = serde_json::from_str(r#"{"type":"heartbeat_ack"}"#).unwrap();
        assert!(matches!(msg, ServerMsg::Other));
    }

    #[test]
    fn data_change_without_action_is_rejected() {
        let res = serde_json::from_str::<ServerMsg>(
            r#"{"type":"data_change","entity":"personnel","username":"x"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn unknown_entity_and_action_are_preserved() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"entity":"payroll","action":"archive","username":"x"}"#,
        )
        .unwrap();
        assert_eq!(event.entity, Entity::Other("payroll".into()));
        assert_eq!(event.action, Action::Other("archive".into()));
        assert_eq!(event.details, Value::Null);
    }

    #[test]
    fn optional_fields_with_unexpected_types_do_not_reject_frame() {
        let msg: ServerMsg = serde_json::from_str(
            r#"{"type":"data_change","entity":"personnel","action":"update","username":null,"entity_id":"NIP-1987","timestamp":1700000000}"#,
        )
        .unwrap();
        let ServerMsg::DataChange(event) = msg else {
            panic!("expected data_change");
        };
        assert_eq!(event.actor_name, "");
        assert_eq!(event.entity_id, None);
        assert_eq!(event.timestamp, None);
    }

    #[test]
    fn heartbeat_serializes_as_typed_frame() {
        let text = serde_json::to_string(&ClientMsg::Heartbeat).unwrap();
        assert_eq!(text, r#"{"type":"heartbeat"}"#);
    }
}
