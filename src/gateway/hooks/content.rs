use serde::Serialize;
use serde_json::{Map, Value};

use crate::gateway::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentShape {
    Chat,
    Completion,
    Embeddings,
    Opaque,
}

/// The text a check inspects, extracted from a known request/response shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "camelCase")]
pub enum HookContent {
    /// Last chat message of a request, or the first choice of a response.
    Chat { role: String, texts: Vec<String> },
    /// Prompt(s) of a request, or the first choice of a response.
    Completion { texts: Vec<String> },
    Embeddings { inputs: Vec<String> },
    Opaque,
}

impl HookContent {
    pub fn shape(&self) -> ContentShape {
        match self {
            HookContent::Chat { .. } => ContentShape::Chat,
            HookContent::Completion { .. } => ContentShape::Completion,
            HookContent::Embeddings { .. } => ContentShape::Embeddings,
            HookContent::Opaque => ContentShape::Opaque,
        }
    }

    pub fn texts(&self) -> &[String] {
        match self {
            HookContent::Chat { texts, .. } | HookContent::Completion { texts } => texts,
            HookContent::Embeddings { inputs } => inputs,
            HookContent::Opaque => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Request,
    Response,
}

/// A JSON body together with the content parsed out of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentSnapshot {
    pub json: Value,
    pub content: HookContent,
    #[serde(skip)]
    side: Side,
}

impl ContentSnapshot {
    pub fn request(json: Value) -> Self {
        let content = parse_request(&json);
        Self {
            json,
            content,
            side: Side::Request,
        }
    }

    pub fn response(json: Value) -> Self {
        let content = parse_response(&json);
        Self {
            json,
            content,
            side: Side::Response,
        }
    }

    pub fn shape(&self) -> ContentShape {
        self.content.shape()
    }

    pub fn text(&self) -> String {
        self.content.texts().join("\n")
    }

    /// Rewrites every inspected text through `f`, returning the new body.
    /// Fields outside the inspected content are left untouched.
    pub fn map_text(&self, f: impl Fn(&str) -> String) -> Value {
        let mut json = self.json.clone();
        match (self.side, self.content.shape()) {
            (Side::Request, ContentShape::Chat) => {
                if let Some(content) = json
                    .get_mut("messages")
                    .and_then(Value::as_array_mut)
                    .and_then(|messages| messages.last_mut())
                    .and_then(|last| last.get_mut("content"))
                {
                    map_text_value(content, &f);
                }
            }
            (Side::Request, ContentShape::Completion) => {
                if let Some(prompt) = json.get_mut("prompt") {
                    map_text_value(prompt, &f);
                }
            }
            (Side::Request, ContentShape::Embeddings) => {
                if let Some(input) = json.get_mut("input") {
                    map_text_value(input, &f);
                }
            }
            (Side::Response, ContentShape::Chat) => {
                if let Some(content) = json
                    .pointer_mut("/choices/0/message/content")
                    .filter(|content| content.is_string())
                {
                    map_text_value(content, &f);
                }
            }
            (Side::Response, ContentShape::Completion) => {
                if let Some(text) = json.pointer_mut("/choices/0/text") {
                    map_text_value(text, &f);
                }
            }
            _ => {}
        }
        json
    }

    /// Replaces the body, re-deriving the content from it.
    pub fn replace(&mut self, json: Value) {
        *self = match self.side {
            Side::Request => Self::request(json),
            Side::Response => Self::response(json),
        };
    }
}

fn map_text_value(value: &mut Value, f: &impl Fn(&str) -> String) {
    match value {
        Value::String(text) => *text = f(text),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(text) => *text = f(text),
                    Value::Object(part) => {
                        if part.get("type").and_then(Value::as_str) != Some("text") {
                            continue;
                        }
                        if let Some(Value::String(text)) = part.get_mut("text") {
                            *text = f(text);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn collect_texts(value: &Value) -> Vec<String> {
    match value {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Object(part) if part.get("type").and_then(Value::as_str) == Some("text") => {
                    part.get("text").and_then(Value::as_str).map(str::to_string)
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_request(json: &Value) -> HookContent {
    if let Some(messages) = json.get("messages").and_then(Value::as_array) {
        let Some(last) = messages.last() else {
            return HookContent::Chat {
                role: String::new(),
                texts: Vec::new(),
            };
        };
        return HookContent::Chat {
            role: last
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            texts: last.get("content").map(collect_texts).unwrap_or_default(),
        };
    }
    if let Some(prompt) = json.get("prompt") {
        return HookContent::Completion {
            texts: collect_texts(prompt),
        };
    }
    if let Some(input) = json.get("input") {
        return HookContent::Embeddings {
            inputs: collect_texts(input),
        };
    }
    HookContent::Opaque
}

fn parse_response(json: &Value) -> HookContent {
    let Some(choice) = json.pointer("/choices/0") else {
        return HookContent::Opaque;
    };
    if let Some(message) = choice.get("message") {
        return HookContent::Chat {
            role: message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("assistant")
                .to_string(),
            texts: message.get("content").map(collect_texts).unwrap_or_default(),
        };
    }
    if let Some(text) = choice.get("text") {
        return HookContent::Completion {
            texts: collect_texts(text),
        };
    }
    HookContent::Opaque
}

/// Everything a check may look at. Owned, so async hooks can carry a copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookContext {
    pub request: ContentSnapshot,
    pub response: Option<ContentSnapshot>,
    pub response_status: Option<u16>,
    pub provider: String,
    pub endpoint: Endpoint,
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(
        request: Value,
        provider: impl Into<String>,
        endpoint: Endpoint,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            request: ContentSnapshot::request(request),
            response: None,
            response_status: None,
            provider: provider.into(),
            endpoint,
            metadata,
        }
    }

    /// The snapshot a check of `phase` inspects.
    pub fn target(&self, phase: super::HookPhase) -> Option<&ContentSnapshot> {
        match phase {
            super::HookPhase::BeforeRequest => Some(&self.request),
            super::HookPhase::AfterRequest => self.response.as_ref(),
        }
    }

    pub(crate) fn apply_transform(&mut self, phase: super::HookPhase, json: Value) {
        match phase {
            super::HookPhase::BeforeRequest => self.request.replace(json),
            super::HookPhase::AfterRequest => match self.response.as_mut() {
                Some(response) => response.replace(json),
                None => self.response = Some(ContentSnapshot::response(json)),
            },
        }
    }
}
