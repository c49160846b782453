use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

/// Session variables: reserved orchestration keys as typed fields, everything
/// else kept verbatim in `extra`. Serializes back to one flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionVars {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub previous_block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub last_user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub last_reply_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub last_reply_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub last_message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<Handover>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offhours: Option<bool>,
    #[serde(
        rename = "offhours_reason",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub offhours_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub fila: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub ticket_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Suspension>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handover {
    #[serde(default)]
    pub status: HandoverStatus,
    #[serde(default)]
    pub origin_block: Option<String>,
    #[serde(default)]
    pub pre_msg_sent: bool,
}

/// A turn parked on `awaitTimeInSeconds`. The session's current block is
/// where it continues once `until` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub id: Uuid,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoverStatus {
    #[default]
    Open,
    Closed,
}

impl SessionVars {
    /// Builds vars from a stored JSON object. A reserved key with an unusable
    /// shape drops the typed view and keeps the raw map as tenant data.
    pub fn from_map(map: Map<String, Value>) -> Self {
        match serde_json::from_value::<SessionVars>(Value::Object(map.clone())) {
            Ok(vars) => vars,
            Err(e) => {
                warn!(error = %e, "Session vars have malformed reserved keys, keeping raw map");
                SessionVars {
                    extra: map,
                    ..Default::default()
                }
            }
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Self::default(),
        }
    }

    /// Flat JSON object view used for templates, conditions and persistence.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => self.extra.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Overlays `other` on top of these vars; keys in `other` win.
    pub fn merge(&mut self, other: &Map<String, Value>) {
        if other.is_empty() {
            return;
        }
        let mut map = self.to_map();
        for (key, value) in other {
            map.insert(key.clone(), value.clone());
        }
        *self = Self::from_map(map);
    }

    pub fn set(&mut self, key: &str, value: Value) {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.merge(&patch);
    }

    pub fn handover_status(&self) -> Option<HandoverStatus> {
        self.handover.as_ref().map(|h| h.status)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_and_tenant_keys_round_trip() {
        let raw = json!({
            "channel": "whatsapp",
            "previousBlock": "menu",
            "handover": {"status": "open", "originBlock": "support", "preMsgSent": true},
            "offhours_reason": "holiday",
            "customerName": "Ana",
            "cart": {"items": 2}
        });
        let vars = SessionVars::from_value(raw.clone());
        assert_eq!(vars.channel.as_deref(), Some("whatsapp"));
        assert_eq!(vars.previous_block.as_deref(), Some("menu"));
        assert_eq!(vars.handover_status(), Some(HandoverStatus::Open));
        assert_eq!(vars.offhours_reason.as_deref(), Some("holiday"));
        assert_eq!(vars.extra.get("customerName"), Some(&json!("Ana")));
        assert_eq!(vars.to_value(), raw);
    }

    #[test]
    fn numeric_reserved_values_become_strings() {
        let vars = SessionVars::from_value(json!({"ticketNumber": 42, "fila": null}));
        assert_eq!(vars.ticket_number.as_deref(), Some("42"));
        assert_eq!(vars.fila, None);
    }

    #[test]
    fn malformed_reserved_key_keeps_raw_map() {
        let vars = SessionVars::from_value(json!({"handover": "yes", "name": "Bo"}));
        assert!(vars.handover.is_none());
        assert_eq!(vars.extra.get("handover"), Some(&json!("yes")));
        assert_eq!(vars.extra.get("name"), Some(&json!("Bo")));
    }

    #[test]
    fn merge_overrides_and_keeps_existing() {
        let mut vars = SessionVars::from_value(json!({"name": "Ana", "fila": "Sales"}));
        vars.merge(json!({"fila": "Support", "channel": "telegram"}).as_object().unwrap());
        assert_eq!(vars.fila.as_deref(), Some("Support"));
        assert_eq!(vars.channel.as_deref(), Some("telegram"));
        assert_eq!(vars.extra.get("name"), Some(&json!("Ana")));
    }
}
