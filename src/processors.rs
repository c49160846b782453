//! Side effects of individual blocks: sending rendered content, HTTP calls
//! and sandboxed scripts. The interpreter decides what runs; these decide how.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::delivery::adapters::content_url;
use crate::delivery::{Outbound, OutboundMessage};
use crate::error::FlowError;
use crate::models::flow::{Block, MessageKind};
use crate::models::payloads::Identity;
use crate::models::vars::SessionVars;
use crate::scripting::ScriptSandbox;
use crate::template::{substitute, substitute_value};

pub const FALLBACK_TEXT: &str = "Sorry, this message could not be displayed.";

/// Renders a content template: strings directly, structured content per string leaf.
pub fn render_content(template: &Value, vars: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => Value::String(substitute(s, vars)),
        other => substitute_value(other, vars),
    }
}

pub struct Processors {
    outbound: Arc<dyn Outbound>,
    http: reqwest::Client,
    sandbox: Arc<ScriptSandbox>,
    api_timeout: Duration,
}

impl Processors {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        http: reqwest::Client,
        sandbox: Arc<ScriptSandbox>,
        api_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            http,
            sandbox,
            api_timeout,
        }
    }

    /// Renders and hands a message to delivery, to be sent no sooner than
    /// `delay` from now. When the pipeline refuses it, a plain-text fallback
    /// goes out instead. Returns what was actually sent.
    pub async fn send(
        &self,
        identity: &Identity,
        kind: MessageKind,
        template: &Value,
        vars: &Map<String, Value>,
        delay: Duration,
    ) -> Option<Value> {
        let content = render_content(template, vars);
        if !delay.is_zero() {
            debug!(user_id = identity.key(), delay_ms = delay.as_millis() as u64, "Scheduling delayed send");
        }

        let err = match self.deliver(identity, kind, content.clone(), delay).await {
            Ok(()) => return Some(content),
            Err(e) => e,
        };
        warn!(
            user_id = identity.key(),
            kind = kind.as_str(),
            error = %err,
            "Delivery refused, sending text fallback"
        );
        if kind == MessageKind::Text {
            return None;
        }

        let fallback = Value::String(content_url(&content).unwrap_or_else(|| FALLBACK_TEXT.to_string()));
        match self.deliver(identity, MessageKind::Text, fallback.clone(), delay).await {
            Ok(()) => Some(fallback),
            Err(e) => {
                warn!(user_id = identity.key(), error = %e, "Fallback text was refused too");
                None
            }
        }
    }

    async fn deliver(
        &self,
        identity: &Identity,
        kind: MessageKind,
        content: Value,
        delay: Duration,
    ) -> Result<(), FlowError> {
        self.outbound
            .send(OutboundMessage {
                channel: identity.channel,
                to: identity.address.clone(),
                user_id: identity.key(),
                kind,
                content,
                context: None,
                delay,
            })
            .await?;
        Ok(())
    }

    /// Issues the block's HTTP request and records `responseStatus` and
    /// `responseData`. A transport failure records status 0 and the error text.
    /// Returns the block's content: the post-script output if one is
    /// configured, otherwise the response body.
    pub async fn api_call(&self, block: &Block, vars: &mut SessionVars) -> Value {
        let bag = vars.to_map();
        let Some(url) = block
            .url
            .as_deref()
            .map(|u| substitute(u, &bag))
            .filter(|u| !u.trim().is_empty())
        else {
            warn!(block = block.id, "api_call block has no url, skipping");
            return Value::Null;
        };
        let method = block
            .method
            .as_deref()
            .map(|m| m.trim().to_uppercase())
            .and_then(|m| reqwest::Method::from_bytes(m.as_bytes()).ok())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.http.request(method.clone(), &url).timeout(self.api_timeout);
        for (name, value) in &block.headers {
            request = request.header(name.as_str(), substitute(value, &bag));
        }
        match &block.body {
            Some(Value::String(raw)) => {
                let rendered = substitute(raw, &bag);
                request = match serde_json::from_str::<Value>(&rendered) {
                    Ok(parsed) => request.json(&parsed),
                    Err(_) => request.body(rendered),
                };
            }
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(&substitute_value(body, &bag)),
        }

        let (status, data) = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                (status, data)
            }
            Err(e) => {
                warn!(block = block.id, url = url, error = %e, "api_call request failed");
                (0, json!({"error": e.to_string()}))
            }
        };
        info!(block = block.id, method = %method, url = url, status, "api_call completed");

        vars.response_status = Some(json!(status));
        vars.response_data = Some(data.clone());

        let content = match block.script.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(code) => {
                let input = json!({"response": data, "vars": vars.to_value()});
                self.run_script(block, code, None, &input).await
            }
            None => data,
        };

        if let Some(name) = block.output_var.as_deref().filter(|n| !n.is_empty()) {
            vars.set(name, content.clone());
        }
        if let Some(name) = block.status_var.as_deref().filter(|n| !n.is_empty()) {
            vars.set(name, json!(status));
        }
        content
    }

    /// Runs a script block against `{vars}` and stores its output in `outputVar`.
    pub async fn script(&self, block: &Block, vars: &mut SessionVars) -> Value {
        let Some(code) = block.code.as_deref().filter(|c| !c.trim().is_empty()) else {
            warn!(block = block.id, "script block has no code, skipping");
            return Value::Null;
        };
        let input = json!({"vars": vars.to_value()});
        let output = self.run_script(block, code, block.function.as_deref(), &input).await;
        if let Some(name) = block.output_var.as_deref().filter(|n| !n.is_empty()) {
            vars.set(name, output.clone());
        }
        output
    }

    async fn run_script(&self, block: &Block, code: &str, function: Option<&str>, input: &Value) -> Value {
        match self.sandbox.run(code, function, input).await {
            Ok(output) => output,
            Err(e) => {
                let e = FlowError::ScriptExecution(e.to_string());
                warn!(block = block.id, error = %e, "Script failed, using empty output");
                Value::Null
            }
        }
    }
}
