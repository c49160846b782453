use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::FlowError;

/// A published conversation graph. Read-only once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub start: String,
    #[serde(default, deserialize_with = "keyed_blocks")]
    pub blocks: HashMap<String, Block>,
    #[serde(rename = "onError", default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorBlockRef>,
}

/// Blocks are keyed by id; the key is authoritative over any `id` inside.
fn keyed_blocks<'de, D>(deserializer: D) -> Result<HashMap<String, Block>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut blocks = HashMap::<String, Block>::deserialize(deserializer)?;
    for (id, block) in &mut blocks {
        block.id = id.clone();
    }
    Ok(blocks)
}

/// `onError` may be a bare block id or an object carrying the id (and optional
/// inline content the error block falls back to).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorBlockRef {
    Id(String),
    Inline {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        content: Option<Value>,
    },
}

impl Flow {
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.start.trim().is_empty() {
            return Err(FlowError::FlowDefinition("flow has no start block".into()));
        }
        if self.blocks.is_empty() {
            return Err(FlowError::FlowDefinition("flow has no blocks".into()));
        }
        if !self.blocks.contains_key(&self.start) {
            return Err(FlowError::FlowDefinition(format!(
                "start block '{}' is not defined",
                self.start
            )));
        }
        Ok(())
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn has_block(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    /// Id of the error block, if the flow declares one that exists.
    pub fn error_block_id(&self) -> Option<&str> {
        let id = match self.on_error.as_ref()? {
            ErrorBlockRef::Id(id) => id.as_str(),
            ErrorBlockRef::Inline { id, .. } => id.as_deref()?,
        };
        self.has_block(id).then_some(id)
    }

    /// Inline content of the error reference, used when no error block exists.
    pub fn error_content(&self) -> Option<&Value> {
        match self.on_error.as_ref()? {
            ErrorBlockRef::Inline { content, .. } => content.as_ref(),
            ErrorBlockRef::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Interactive,
    ApiCall,
    Script,
    Human,
}

impl BlockKind {
    /// The unified message kind sent for this block, if it sends one.
    pub fn message_kind(self) -> Option<MessageKind> {
        match self {
            BlockKind::Text => Some(MessageKind::Text),
            BlockKind::Image => Some(MessageKind::Image),
            BlockKind::Audio => Some(MessageKind::Audio),
            BlockKind::Video => Some(MessageKind::Video),
            BlockKind::Document => Some(MessageKind::Document),
            BlockKind::Location => Some(MessageKind::Location),
            BlockKind::Interactive => Some(MessageKind::Interactive),
            BlockKind::ApiCall | BlockKind::Script | BlockKind::Human => None,
        }
    }
}

/// Unified outbound message kind shared by every channel adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Interactive,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Location => "location",
            MessageKind::Interactive => "interactive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(rename = "defaultNext", default)]
    pub default_next: Option<String>,
    #[serde(rename = "awaitResponse", default)]
    pub await_response: bool,
    #[serde(rename = "awaitTimeInSeconds", default)]
    pub await_time_in_seconds: u64,
    #[serde(rename = "sendDelayInSeconds", default)]
    pub send_delay_in_seconds: u64,

    // api_call
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(rename = "outputVar", default)]
    pub output_var: Option<String>,
    #[serde(rename = "statusVar", default)]
    pub status_var: Option<String>,

    // script
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
}

impl Block {
    /// Queue name configured on a `human` block.
    pub fn queue_name(&self) -> Option<&str> {
        self.content
            .get("queueName")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub op: ConditionOp,
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    #[serde(other)]
    Unknown,
}

impl ConditionOp {
    pub fn is_negated(self) -> bool {
        matches!(
            self,
            ConditionOp::NotEquals | ConditionOp::NotContains | ConditionOp::NotExists
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flow_document() {
        let flow: Flow = serde_json::from_value(json!({
            "id": "f1",
            "start": "welcome",
            "onError": "oops",
            "blocks": {
                "welcome": {
                    "type": "text",
                    "content": "Hi {{name}}",
                    "awaitResponse": true,
                    "actions": [
                        {"conditions": [{"type": "equals", "variable": "lastUserMessage", "value": "1"}], "next": "sales"}
                    ],
                    "defaultNext": "oops"
                },
                "sales": {"type": "human", "content": {"queueName": "Sales"}},
                "oops": {"type": "text", "content": "Sorry"}
            }
        }))
        .unwrap();

        assert!(flow.validate().is_ok());
        assert_eq!(flow.error_block_id(), Some("oops"));
        let welcome = flow.block("welcome").unwrap();
        assert!(welcome.await_response);
        assert_eq!(welcome.actions[0].conditions[0].op, ConditionOp::Equals);
        assert_eq!(flow.block("sales").unwrap().queue_name(), Some("Sales"));
    }

    #[test]
    fn block_ids_come_from_map_keys() {
        let flow: Flow = serde_json::from_value(json!({
            "start": "a",
            "blocks": {
                "a": {"type": "text", "content": "x"},
                "b": {"id": "stale", "type": "text", "content": "y"}
            }
        }))
        .unwrap();
        assert_eq!(flow.block("a").unwrap().id, "a");
        assert_eq!(flow.block("b").unwrap().id, "b");
    }

    #[test]
    fn unknown_operator_is_captured() {
        let cond: Condition =
            serde_json::from_value(json!({"type": "sounds_like", "variable": "x", "value": "y"}))
                .unwrap();
        assert_eq!(cond.op, ConditionOp::Unknown);
    }

    #[test]
    fn validate_rejects_missing_start() {
        let flow: Flow = serde_json::from_value(json!({
            "start": "nowhere",
            "blocks": {"a": {"type": "text", "content": "x"}}
        }))
        .unwrap();
        assert!(matches!(flow.validate(), Err(FlowError::FlowDefinition(_))));

        let empty: Flow = serde_json::from_value(json!({"start": "a"})).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn inline_error_reference() {
        let flow: Flow = serde_json::from_value(json!({
            "start": "a",
            "blocks": {"a": {"type": "text", "content": "x"}},
            "onError": {"content": "Something went wrong"}
        }))
        .unwrap();
        assert_eq!(flow.error_block_id(), None);
        assert_eq!(flow.error_content(), Some(&json!("Something went wrong")));
    }
}
