//! Pure mappings from the unified `(kind, content)` message to each channel's
//! wire shape.
//!
//! Unified content conventions:
//! - text: a string, or `{body}` / `{text}`
//! - image/audio/video/document: a URL string, or `{url|link, caption?, filename?}`
//! - location: `{latitude, longitude, name?, address?}`
//! - interactive: WhatsApp-style `{type: button|list|cta_url, header?, body, footer?, action}`

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::models::flow::MessageKind;
use crate::models::payloads::Channel;

#[derive(Debug, Error, PartialEq)]
pub enum AdaptError {
    #[error("{kind} messages are not supported on {channel}")]
    Unsupported { channel: Channel, kind: String },
    #[error("invalid {kind} content: {reason}")]
    InvalidContent { kind: &'static str, reason: String },
}

pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Applies the channel's addressing convention to a recipient.
    fn normalize_recipient(&self, to: &str) -> String;

    fn adapt(&self, kind: MessageKind, content: &Value) -> Result<Value, AdaptError>;
}

pub fn adapter_for(channel: Channel) -> Box<dyn ChannelAdapter> {
    match channel {
        Channel::Whatsapp => Box::new(WhatsappAdapter),
        Channel::Telegram => Box::new(TelegramAdapter),
        Channel::Webchat => Box::new(WebchatAdapter),
    }
}

fn invalid(kind: MessageKind, reason: impl Into<String>) -> AdaptError {
    AdaptError::InvalidContent {
        kind: kind.as_str(),
        reason: reason.into(),
    }
}

fn text_of(content: &Value) -> Option<String> {
    let text = match content {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["body", "text", "message"]
            .iter()
            .find_map(|k| match map.get(*k) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Object(inner)) => inner.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            }),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    text.filter(|t| !t.trim().is_empty())
}

struct Media {
    url: String,
    caption: Option<String>,
    filename: Option<String>,
}

fn media_of(kind: MessageKind, content: &Value) -> Result<Media, AdaptError> {
    match content {
        Value::String(url) if !url.trim().is_empty() => Ok(Media {
            url: url.trim().to_string(),
            caption: None,
            filename: None,
        }),
        Value::Object(map) => {
            let url = ["url", "link", "mediaUrl"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| invalid(kind, "missing url"))?;
            let field = |k: &str| map.get(k).and_then(Value::as_str).map(str::to_string);
            Ok(Media {
                url: url.to_string(),
                caption: field("caption"),
                filename: field("filename"),
            })
        }
        _ => Err(invalid(kind, "expected a url or an object with url")),
    }
}

struct Location {
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    address: Option<String>,
}

fn location_of(content: &Value) -> Result<Location, AdaptError> {
    let coord = |k: &str| -> Option<f64> {
        match content.get(k)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    let (Some(latitude), Some(longitude)) = (coord("latitude"), coord("longitude")) else {
        return Err(invalid(MessageKind::Location, "latitude and longitude are required"));
    };
    let field = |k: &str| content.get(k).and_then(Value::as_str).map(str::to_string);
    Ok(Location {
        latitude,
        longitude,
        name: field("name"),
        address: field("address"),
    })
}

fn interactive_type(content: &Value) -> Result<&str, AdaptError> {
    content
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(MessageKind::Interactive, "missing interactive type"))
}

/// Body text of an interactive message, accepting `body` as string or `{text}`.
fn interactive_body(content: &Value) -> Option<String> {
    match content.get("body")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// `(id, title)` of every button or list row.
fn interactive_options(content: &Value) -> Vec<(String, String)> {
    let action = content.get("action");
    let buttons = action
        .and_then(|a| a.get("buttons"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|b| b.get("reply").unwrap_or(b));
    let rows = action
        .and_then(|a| a.get("sections"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|s| s.get("rows").and_then(Value::as_array))
        .flatten();
    buttons
        .chain(rows)
        .filter_map(|o| {
            let title = o.get("title").and_then(Value::as_str)?;
            let id = o.get("id").and_then(Value::as_str).unwrap_or(title);
            Some((id.to_string(), title.to_string()))
        })
        .collect()
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v));
    }
}

/// WhatsApp Cloud API message objects (without `messaging_product`/`to`,
/// which the sender adds).
pub struct WhatsappAdapter;

impl ChannelAdapter for WhatsappAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn normalize_recipient(&self, to: &str) -> String {
        let bare = to.split('@').next().unwrap_or(to);
        bare.chars().filter(char::is_ascii_digit).collect()
    }

    fn adapt(&self, kind: MessageKind, content: &Value) -> Result<Value, AdaptError> {
        match kind {
            MessageKind::Text => {
                let body = text_of(content).ok_or_else(|| invalid(kind, "empty text"))?;
                let preview = body.contains("http://") || body.contains("https://");
                Ok(json!({"type": "text", "text": {"body": body, "preview_url": preview}}))
            }
            MessageKind::Image | MessageKind::Audio | MessageKind::Video | MessageKind::Document => {
                let media = media_of(kind, content)?;
                let mut obj = Map::new();
                obj.insert("link".into(), Value::String(media.url));
                if kind != MessageKind::Audio {
                    insert_opt(&mut obj, "caption", media.caption);
                }
                if kind == MessageKind::Document {
                    insert_opt(&mut obj, "filename", media.filename);
                }
                let key = kind.as_str();
                Ok(json!({"type": key, key: Value::Object(obj)}))
            }
            MessageKind::Location => {
                let loc = location_of(content)?;
                let mut obj = Map::new();
                obj.insert("latitude".into(), json!(loc.latitude));
                obj.insert("longitude".into(), json!(loc.longitude));
                insert_opt(&mut obj, "name", loc.name);
                insert_opt(&mut obj, "address", loc.address);
                Ok(json!({"type": "location", "location": Value::Object(obj)}))
            }
            MessageKind::Interactive => {
                let itype = interactive_type(content)?;
                if !matches!(itype, "button" | "list" | "cta_url") {
                    return Err(AdaptError::Unsupported {
                        channel: Channel::Whatsapp,
                        kind: format!("interactive/{itype}"),
                    });
                }
                let mut interactive = content
                    .as_object()
                    .cloned()
                    .ok_or_else(|| invalid(kind, "expected an object"))?;
                let body = interactive_body(content).ok_or_else(|| invalid(kind, "missing body text"))?;
                interactive.insert("body".into(), json!({"text": body}));
                for key in ["header", "footer"] {
                    if let Some(Value::String(text)) = interactive.get(key).cloned() {
                        let wrapped = if key == "header" {
                            json!({"type": "text", "text": text})
                        } else {
                            json!({"text": text})
                        };
                        interactive.insert(key.into(), wrapped);
                    }
                }
                Ok(json!({"type": "interactive", "interactive": Value::Object(interactive)}))
            }
        }
    }
}

/// Telegram Bot API calls: `{method, body}`; the sender adds `chat_id`.
pub struct TelegramAdapter;

impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn normalize_recipient(&self, to: &str) -> String {
        to.trim().to_string()
    }

    fn adapt(&self, kind: MessageKind, content: &Value) -> Result<Value, AdaptError> {
        match kind {
            MessageKind::Text => {
                let text = text_of(content).ok_or_else(|| invalid(kind, "empty text"))?;
                Ok(json!({"method": "sendMessage", "body": {"text": text}}))
            }
            MessageKind::Image | MessageKind::Audio | MessageKind::Video | MessageKind::Document => {
                let media = media_of(kind, content)?;
                let (method, field) = match kind {
                    MessageKind::Image => ("sendPhoto", "photo"),
                    MessageKind::Audio => ("sendAudio", "audio"),
                    MessageKind::Video => ("sendVideo", "video"),
                    _ => ("sendDocument", "document"),
                };
                let mut body = Map::new();
                body.insert(field.into(), Value::String(media.url));
                insert_opt(&mut body, "caption", media.caption);
                Ok(json!({"method": method, "body": Value::Object(body)}))
            }
            MessageKind::Location => {
                let loc = location_of(content)?;
                match (loc.name, loc.address) {
                    (Some(title), Some(address)) => Ok(json!({
                        "method": "sendVenue",
                        "body": {"latitude": loc.latitude, "longitude": loc.longitude, "title": title, "address": address}
                    })),
                    _ => Ok(json!({
                        "method": "sendLocation",
                        "body": {"latitude": loc.latitude, "longitude": loc.longitude}
                    })),
                }
            }
            MessageKind::Interactive => {
                let itype = interactive_type(content)?;
                let text = interactive_body(content).ok_or_else(|| invalid(kind, "missing body text"))?;
                let keyboard: Vec<Value> = match itype {
                    "button" | "list" => interactive_options(content)
                        .into_iter()
                        .map(|(id, title)| json!([{"text": title, "callback_data": id}]))
                        .collect(),
                    "cta_url" => {
                        let params = content.get("action").and_then(|a| a.get("parameters"));
                        let label = params.and_then(|p| p.get("display_text")).and_then(Value::as_str);
                        let url = params.and_then(|p| p.get("url")).and_then(Value::as_str);
                        match (label, url) {
                            (Some(label), Some(url)) => vec![json!([{"text": label, "url": url}])],
                            _ => return Err(invalid(kind, "cta_url needs display_text and url")),
                        }
                    }
                    other => {
                        return Err(AdaptError::Unsupported {
                            channel: Channel::Telegram,
                            kind: format!("interactive/{other}"),
                        });
                    }
                };
                if keyboard.is_empty() {
                    return Err(invalid(kind, "no options to render"));
                }
                Ok(json!({
                    "method": "sendMessage",
                    "body": {"text": text, "reply_markup": {"inline_keyboard": keyboard}}
                }))
            }
        }
    }
}

/// Browser webchat bridge: unified shape, validated and passed through.
pub struct WebchatAdapter;

impl ChannelAdapter for WebchatAdapter {
    fn channel(&self) -> Channel {
        Channel::Webchat
    }

    fn normalize_recipient(&self, to: &str) -> String {
        to.to_string()
    }

    fn adapt(&self, kind: MessageKind, content: &Value) -> Result<Value, AdaptError> {
        let content = match kind {
            MessageKind::Text => json!({"text": text_of(content).ok_or_else(|| invalid(kind, "empty text"))?}),
            MessageKind::Image | MessageKind::Audio | MessageKind::Video | MessageKind::Document => {
                let media = media_of(kind, content)?;
                json!({"url": media.url, "caption": media.caption, "filename": media.filename})
            }
            MessageKind::Location => {
                let loc = location_of(content)?;
                json!({"latitude": loc.latitude, "longitude": loc.longitude, "name": loc.name, "address": loc.address})
            }
            MessageKind::Interactive => {
                interactive_type(content)?;
                content.clone()
            }
        };
        Ok(json!({"type": kind.as_str(), "content": content}))
    }
}

/// URL carried by rich content, used for the plain-text fallback.
pub fn content_url(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => Some(s.clone()),
        Value::Object(map) => ["url", "link", "mediaUrl"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_text_and_recipient() {
        let a = WhatsappAdapter;
        assert_eq!(a.normalize_recipient("+55 (11) 99999-0000"), "5511999990000");
        assert_eq!(a.normalize_recipient("5511999990000@s.whatsapp.net"), "5511999990000");
        let wire = a.adapt(MessageKind::Text, &json!("see https://x.io")).unwrap();
        assert_eq!(wire, json!({"type": "text", "text": {"body": "see https://x.io", "preview_url": true}}));
    }

    #[test]
    fn whatsapp_media_fields() {
        let a = WhatsappAdapter;
        let doc = a
            .adapt(MessageKind::Document, &json!({"url": "https://x/a.pdf", "caption": "Invoice", "filename": "a.pdf"}))
            .unwrap();
        assert_eq!(doc["document"], json!({"link": "https://x/a.pdf", "caption": "Invoice", "filename": "a.pdf"}));

        let audio = a.adapt(MessageKind::Audio, &json!({"url": "https://x/a.ogg", "caption": "dropped"})).unwrap();
        assert_eq!(audio["audio"], json!({"link": "https://x/a.ogg"}));

        let err = a.adapt(MessageKind::Image, &json!({"caption": "no url"})).unwrap_err();
        assert!(matches!(err, AdaptError::InvalidContent { .. }));
    }

    #[test]
    fn whatsapp_interactive_body_is_wrapped() {
        let content = json!({
            "type": "button",
            "body": "Choose",
            "footer": "Thanks",
            "action": {"buttons": [{"type": "reply", "reply": {"id": "a", "title": "A"}}]}
        });
        let wire = WhatsappAdapter.adapt(MessageKind::Interactive, &content).unwrap();
        assert_eq!(wire["interactive"]["body"], json!({"text": "Choose"}));
        assert_eq!(wire["interactive"]["footer"], json!({"text": "Thanks"}));

        let err = WhatsappAdapter
            .adapt(MessageKind::Interactive, &json!({"type": "carousel", "body": "x"}))
            .unwrap_err();
        assert!(matches!(err, AdaptError::Unsupported { channel: Channel::Whatsapp, .. }));
    }

    #[test]
    fn telegram_buttons_become_inline_keyboard() {
        let content = json!({
            "type": "list",
            "body": {"text": "Menu"},
            "action": {"button": "Open", "sections": [{"rows": [
                {"id": "r1", "title": "Billing"},
                {"id": "r2", "title": "Support"}
            ]}]}
        });
        let wire = TelegramAdapter.adapt(MessageKind::Interactive, &content).unwrap();
        assert_eq!(wire["method"], "sendMessage");
        assert_eq!(
            wire["body"]["reply_markup"]["inline_keyboard"],
            json!([[{"text": "Billing", "callback_data": "r1"}], [{"text": "Support", "callback_data": "r2"}]])
        );
    }

    #[test]
    fn telegram_location_and_media() {
        let venue = TelegramAdapter
            .adapt(MessageKind::Location, &json!({"latitude": "-23.5", "longitude": -46.6, "name": "HQ", "address": "Av. Paulista"}))
            .unwrap();
        assert_eq!(venue["method"], "sendVenue");
        let photo = TelegramAdapter.adapt(MessageKind::Image, &json!("https://x/p.png")).unwrap();
        assert_eq!(photo, json!({"method": "sendPhoto", "body": {"photo": "https://x/p.png"}}));
        let err = TelegramAdapter.adapt(MessageKind::Location, &json!({"latitude": 1})).unwrap_err();
        assert!(matches!(err, AdaptError::InvalidContent { .. }));
    }

    #[test]
    fn telegram_rejects_unknown_interactive() {
        let err = TelegramAdapter
            .adapt(MessageKind::Interactive, &json!({"type": "product", "body": "x"}))
            .unwrap_err();
        assert_eq!(
            err,
            AdaptError::Unsupported { channel: Channel::Telegram, kind: "interactive/product".into() }
        );
    }

    #[test]
    fn webchat_passes_through() {
        let wire = WebchatAdapter.adapt(MessageKind::Text, &json!({"body": "hi"})).unwrap();
        assert_eq!(wire, json!({"type": "text", "content": {"text": "hi"}}));
    }

    #[test]
    fn fallback_url_extraction() {
        assert_eq!(content_url(&json!({"url": "https://x/a.png"})).as_deref(), Some("https://x/a.png"));
        assert_eq!(content_url(&json!("https://x/b.png")).as_deref(), Some("https://x/b.png"));
        assert_eq!(content_url(&json!("plain")), None);
    }
}
