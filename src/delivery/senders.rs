use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::payloads::{Channel, OutgoingJob};

#[derive(Debug, Error, PartialEq)]
pub enum SendError {
    /// Permanent: retrying cannot succeed.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Anything else: worth another attempt later.
    #[error("transient: {0}")]
    Transient(String),
}

impl SendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::Fatal(_))
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            SendError::Fatal(format!("invalid request: {e}"))
        } else {
            SendError::Transient(format!("network error: {e}"))
        }
    }
}

/// Performs the network call for one channel and classifies the outcome.
/// Returns the provider message id on success.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, job: &OutgoingJob) -> Result<String, SendError>;
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Status codes that are permanent on every channel.
fn generic_fatal(status: StatusCode) -> bool {
    matches!(status.as_u16(), 400 | 401 | 403 | 404 | 413 | 422)
}

pub struct WhatsappSender {
    client: reqwest::Client,
    base_url: String,
    token: String,
    phone_id: String,
}

impl WhatsappSender {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str, phone_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            phone_id: phone_id.to_string(),
        }
    }
}

/// WhatsApp error codes that never succeed on retry.
const WHATSAPP_FATAL_CODES: &[i64] = &[
    100,    // invalid parameter
    131008, // required parameter missing
    131009, // parameter value invalid
    131021, // recipient cannot be sender
    131026, // message undeliverable / not on WhatsApp
    131047, // re-engagement window closed
    131051, // unsupported message type
    131052, // media download error
    131053, // media upload error
    132000, // template param count mismatch
    132001, // template does not exist
    190,    // access token expired
];

/// WhatsApp error codes meaning "slow down".
const WHATSAPP_RATE_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

pub fn classify_whatsapp(status: StatusCode, body: &Value) -> SendError {
    let code = body.pointer("/error/code").and_then(Value::as_i64);
    let message = body
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let reason = format!("whatsapp {status} (code {}): {message}", code.unwrap_or_default());

    if let Some(code) = code {
        if WHATSAPP_RATE_CODES.contains(&code) {
            return SendError::Transient(reason);
        }
        if WHATSAPP_FATAL_CODES.contains(&code) {
            return SendError::Fatal(reason);
        }
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendError::Transient(reason)
    } else if generic_fatal(status) {
        SendError::Fatal(reason)
    } else {
        SendError::Transient(reason)
    }
}

#[async_trait]
impl ChannelSender for WhatsappSender {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(&self, job: &OutgoingJob) -> Result<String, SendError> {
        let mut payload = job.content.clone();
        let obj = payload
            .as_object_mut()
            .ok_or_else(|| SendError::Fatal("whatsapp payload must be an object".into()))?;
        obj.insert("messaging_product".into(), json!("whatsapp"));
        obj.insert("recipient_type".into(), json!("individual"));
        obj.insert("to".into(), json!(job.to));
        if let Some(reply_to) = job.context.as_ref().and_then(|c| c.get("message_id")) {
            obj.insert("context".into(), json!({"message_id": reply_to}));
        }

        let url = format!("{}/{}/messages", self.base_url, self.phone_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(SendError::from_reqwest)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        debug!(status = %status, temp_id = %job.temp_id, "WhatsApp response received");

        if status.is_success() {
            // A 2xx means the provider accepted the message, id or not.
            let id = body.pointer("/messages/0/id").and_then(Value::as_str).unwrap_or_default();
            if id.is_empty() {
                warn!(temp_id = %job.temp_id, "WhatsApp accepted the message without returning an id");
            }
            return Ok(id.to_string());
        }
        Err(classify_whatsapp(status, &body))
    }
}

pub struct TelegramSender {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramSender {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

pub fn classify_telegram(status: StatusCode, body: &Value) -> SendError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let code = body
        .get("error_code")
        .and_then(Value::as_u64)
        .and_then(|c| StatusCode::from_u16(c as u16).ok())
        .unwrap_or(status);
    let reason = format!("telegram {code}: {description}");

    if code == StatusCode::TOO_MANY_REQUESTS || code.is_server_error() {
        SendError::Transient(reason)
    } else if generic_fatal(code) {
        SendError::Fatal(reason)
    } else {
        SendError::Transient(reason)
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn send(&self, job: &OutgoingJob) -> Result<String, SendError> {
        let method = job
            .content
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| SendError::Fatal("telegram payload has no method".into()))?;
        let mut body = job.content.get("body").cloned().unwrap_or_else(|| json!({}));
        let obj = body
            .as_object_mut()
            .ok_or_else(|| SendError::Fatal("telegram body must be an object".into()))?;
        obj.insert("chat_id".into(), json!(job.to));
        if let Some(reply_to) = job.context.as_ref().and_then(|c| c.get("message_id")) {
            obj.insert("reply_parameters".into(), json!({"message_id": reply_to}));
        }

        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(SendError::from_reqwest)?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() && payload.get("ok").and_then(Value::as_bool) == Some(true) {
            return payload
                .pointer("/result/message_id")
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .ok_or_else(|| SendError::Transient("telegram response without message_id".into()));
        }
        Err(classify_telegram(status, &payload))
    }
}

/// Posts the unified message to the webchat bridge.
pub struct WebchatSender {
    client: reqwest::Client,
    url: String,
}

impl WebchatSender {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ChannelSender for WebchatSender {
    fn channel(&self) -> Channel {
        Channel::Webchat
    }

    async fn send(&self, job: &OutgoingJob) -> Result<String, SendError> {
        let payload = json!({
            "tempId": job.temp_id,
            "to": job.to,
            "userId": job.user_id,
            "message": job.content,
            "context": job.context,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(SendError::from_reqwest)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| job.temp_id.to_string()));
        }
        let reason = format!("webchat bridge returned {status}");
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            Err(SendError::Fatal(reason))
        } else {
            Err(SendError::Transient(reason))
        }
    }
}
