//! Provider-shaped request/response transforms.
//!
//! The gateway speaks the OpenAI wire format to clients. A provider that speaks
//! something else plugs in a [`ProviderTransform`]; [`OpenAiCompatible`] is the
//! identity transform used for every configured provider by default.

use serde_json::{Map, Value};

use super::endpoint::Endpoint;
use super::{GatewayError, now_epoch_seconds, openai_error_body};

/// Rewrites one upstream SSE `data:` payload into zero or more client payloads.
pub trait StreamChunkTransform: Send {
    fn transform(&mut self, data: &str) -> Vec<String>;

    /// Payloads to emit once the upstream stream ends (before `[DONE]`).
    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub trait ProviderTransform: Send + Sync {
    fn transform_request(&self, _endpoint: Endpoint, body: &Value) -> Result<Value, GatewayError> {
        Ok(body.clone())
    }

    fn transform_response(
        &self,
        _endpoint: Endpoint,
        _status: u16,
        body: Value,
        _strict_openai_compliance: bool,
    ) -> Value {
        body
    }

    /// `None` relays upstream SSE bytes untouched.
    fn stream_transformer(
        &self,
        _endpoint: Endpoint,
        _strict_openai_compliance: bool,
    ) -> Option<Box<dyn StreamChunkTransform>> {
        None
    }

    /// Maps a `text/plain` / `text/html` body to JSON; `None` passes it through.
    fn transform_text(&self, _endpoint: Endpoint, _status: u16, _text: &str) -> Option<Value> {
        None
    }

    /// Replays a buffered response as SSE payloads (without `[DONE]`).
    fn json_to_stream(&self, _endpoint: Endpoint, _body: &Value) -> Option<Vec<String>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    provider: String,
}

impl OpenAiCompatible {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl ProviderTransform for OpenAiCompatible {
    fn transform_response(
        &self,
        _endpoint: Endpoint,
        _status: u16,
        mut body: Value,
        strict_openai_compliance: bool,
    ) -> Value {
        if strict_openai_compliance {
            return body;
        }
        if let Some(object) = body.as_object_mut() {
            if object.contains_key("object") && !object.contains_key("provider") {
                object.insert("provider".to_string(), Value::String(self.provider.clone()));
            }
        }
        body
    }

    fn transform_text(&self, _endpoint: Endpoint, status: u16, text: &str) -> Option<Value> {
        if status < 400 {
            return None;
        }
        Some(openai_error_body("api_error", None, text.trim()))
    }

    fn json_to_stream(&self, endpoint: Endpoint, body: &Value) -> Option<Vec<String>> {
        let object = body.get("object").and_then(Value::as_str);
        match (endpoint, object) {
            (Endpoint::ChatComplete | Endpoint::Proxy, Some("chat.completion")) => {
                Some(chat_completion_to_chunks(body))
            }
            (Endpoint::Complete | Endpoint::Proxy, Some("text_completion")) => {
                Some(text_completion_to_chunks(body))
            }
            _ => None,
        }
    }
}

fn chunk_header(body: &Value, object: &str) -> Map<String, Value> {
    let mut header = Map::new();
    header.insert(
        "id".to_string(),
        body.get("id").cloned().unwrap_or_else(|| Value::String(String::new())),
    );
    header.insert("object".to_string(), Value::String(object.to_string()));
    header.insert(
        "created".to_string(),
        body.get("created")
            .cloned()
            .unwrap_or_else(|| Value::from(now_epoch_seconds())),
    );
    header.insert(
        "model".to_string(),
        body.get("model").cloned().unwrap_or(Value::Null),
    );
    for extra in ["system_fingerprint", "provider", "hook_results"] {
        if let Some(value) = body.get(extra) {
            header.insert(extra.to_string(), value.clone());
        }
    }
    header
}

fn with_choices(header: &Map<String, Value>, choices: Vec<Value>) -> String {
    let mut chunk = header.clone();
    chunk.insert("choices".to_string(), Value::Array(choices));
    Value::Object(chunk).to_string()
}

fn chat_completion_to_chunks(body: &Value) -> Vec<String> {
    let header = chunk_header(body, "chat.completion.chunk");
    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::with_capacity(choices.len() * 2 + 1);

    for (position, choice) in choices.iter().enumerate() {
        let index = choice.get("index").cloned().unwrap_or(Value::from(position));
        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        let mut delta = Map::new();
        delta.insert(
            "role".to_string(),
            message.get("role").cloned().unwrap_or(Value::from("assistant")),
        );
        for field in ["content", "tool_calls", "refusal"] {
            if let Some(value) = message.get(field).filter(|value| !value.is_null()) {
                delta.insert(field.to_string(), value.clone());
            }
        }
        out.push(with_choices(
            &header,
            vec![serde_json::json!({
                "index": index,
                "delta": Value::Object(delta),
                "finish_reason": Value::Null,
            })],
        ));
        out.push(with_choices(
            &header,
            vec![serde_json::json!({
                "index": index,
                "delta": {},
                "finish_reason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
            })],
        ));
    }

    if let Some(usage) = body.get("usage").filter(|usage| !usage.is_null()) {
        let mut chunk = header.clone();
        chunk.insert("choices".to_string(), Value::Array(Vec::new()));
        chunk.insert("usage".to_string(), usage.clone());
        out.push(Value::Object(chunk).to_string());
    }
    out
}

fn text_completion_to_chunks(body: &Value) -> Vec<String> {
    let header = chunk_header(body, "text_completion");
    let mut out: Vec<String> = body
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .enumerate()
                .map(|(position, choice)| {
                    with_choices(
                        &header,
                        vec![serde_json::json!({
                            "index": choice.get("index").cloned().unwrap_or(Value::from(position)),
                            "text": choice.get("text").cloned().unwrap_or(Value::from("")),
                            "logprobs": Value::Null,
                            "finish_reason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
                        })],
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    if let Some(usage) = body.get("usage").filter(|usage| !usage.is_null()) {
        let mut chunk = header.clone();
        chunk.insert("choices".to_string(), Value::Array(Vec::new()));
        chunk.insert("usage".to_string(), usage.clone());
        out.push(Value::Object(chunk).to_string());
    }
    out
}
