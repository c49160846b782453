use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::flow::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Webchat,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Whatsapp, Channel::Telegram, Channel::Webchat];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Webchat => "webchat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whatsapp" => Ok(Channel::Whatsapp),
            "telegram" => Ok(Channel::Telegram),
            "webchat" => Ok(Channel::Webchat),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Channel-qualified end-user identity. `key()` is the session/ticket user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub channel: Channel,
    pub address: String,
}

impl Identity {
    pub fn new(channel: Channel, address: impl Into<String>) -> Self {
        Identity {
            channel,
            address: address.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.channel, self.address)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (channel, address) = key.split_once(':')?;
        let channel = channel.parse().ok()?;
        (!address.is_empty()).then(|| Identity::new(channel, address))
    }
}

/// Normalized projection of an inbound webhook, extracted upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl InboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        InboundMessage {
            kind: Some("text".into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reply(id: impl Into<String>, title: impl Into<String>) -> Self {
        InboundMessage {
            kind: Some("interactive".into()),
            text: None,
            id: Some(id.into()),
            title: Some(title.into()),
        }
    }

    /// A message carries input when any of text/id/title is non-blank.
    pub fn is_empty(&self) -> bool {
        [&self.text, &self.id, &self.title]
            .iter()
            .all(|v| v.as_deref().is_none_or(|s| s.trim().is_empty()))
    }

    /// The best human-readable text of the message.
    pub fn display_text(&self) -> Option<&str> {
        [&self.text, &self.title, &self.id]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|s| !s.trim().is_empty())
    }
}

/// Envelope consumed from the ingestion stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingEvent {
    Message {
        channel: Channel,
        from: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        message: InboundMessage,
        #[serde(default)]
        external_id: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    TicketStatus(TicketStatusEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStatusEvent {
    pub status: String,
    pub user_id: String,
    #[serde(default)]
    pub ticket_number: Option<Value>,
    #[serde(default)]
    pub fila: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl TicketStatusEvent {
    pub fn is_closed(&self) -> bool {
        self.status.eq_ignore_ascii_case("closed")
    }
}

/// One queued outbound message; `content` is already in the channel's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingJob {
    pub temp_id: Uuid,
    pub channel: Channel,
    pub to: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_key_round_trip() {
        let id = Identity::new(Channel::Whatsapp, "5511999990000");
        assert_eq!(id.key(), "whatsapp:5511999990000");
        assert_eq!(Identity::parse(&id.key()), Some(id));
        assert_eq!(Identity::parse("fax:123"), None);
        assert_eq!(Identity::parse("telegram:"), None);
    }

    #[test]
    fn parses_message_event() {
        let event: IncomingEvent = serde_json::from_value(json!({
            "type": "message",
            "channel": "telegram",
            "from": "9911",
            "payload": {"update_id": 1},
            "message": {"type": "text", "text": "hello"},
            "external_id": "m-1"
        }))
        .unwrap();
        match event {
            IncomingEvent::Message { channel, message, external_id, .. } => {
                assert_eq!(channel, Channel::Telegram);
                assert_eq!(message.text.as_deref(), Some("hello"));
                assert_eq!(external_id.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_ticket_status_event() {
        let event: IncomingEvent = serde_json::from_value(json!({
            "type": "ticket_status",
            "status": "closed",
            "userId": "whatsapp:55119",
            "ticketNumber": 17,
            "fila": "Support"
        }))
        .unwrap();
        let IncomingEvent::TicketStatus(status) = event else {
            panic!("expected ticket status");
        };
        assert!(status.is_closed());
        assert_eq!(status.user_id, "whatsapp:55119");
    }

    #[test]
    fn blank_message_is_empty() {
        assert!(InboundMessage::text("   ").is_empty());
        assert!(!InboundMessage::reply("opt_1", "").is_empty());
        assert_eq!(InboundMessage::reply("opt_1", "Pricing").display_text(), Some("Pricing"));
    }
}
