use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;

use super::content::{ContentShape, ContentSnapshot, HookContext};
use super::registry::{Check, CheckOptions, CheckOutcome, CheckRegistry};
use super::{CheckError, HookPhase, TransformedData};

pub(crate) fn register_builtin_checks(registry: &mut CheckRegistry) {
    registry
        .register(ContainsCheck)
        .register(RegexMatchCheck)
        .register(WordCountCheck)
        .register(PiiCheck)
        .register(WebhookCheck::default());
}

fn parse_parameters<T: for<'de> Deserialize<'de>>(
    check: &str,
    parameters: &Value,
) -> Result<T, CheckError> {
    let parameters = if parameters.is_null() {
        Value::Object(Default::default())
    } else {
        parameters.clone()
    };
    serde_json::from_value(parameters)
        .map_err(|err| CheckError::new("InvalidParameters", format!("{check}: {err}")))
}

fn target<'a>(context: &'a HookContext, phase: HookPhase) -> Option<&'a ContentSnapshot> {
    context.target(phase)
}

fn is_text_shape(shape: ContentShape) -> bool {
    !matches!(shape, ContentShape::Opaque)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ContainsOperator {
    Any,
    All,
    #[default]
    None,
}

#[derive(Debug, Deserialize)]
struct ContainsParams {
    #[serde(default)]
    words: Vec<String>,
    #[serde(default)]
    operator: ContainsOperator,
}

/// `default.contains`: word presence. `none` (the default) fails when any
/// listed word appears; `any` / `all` pass when some / every word appears.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainsCheck;

#[async_trait]
impl Check for ContainsCheck {
    fn name(&self) -> &str {
        "default.contains"
    }

    fn supports(&self, shape: ContentShape) -> bool {
        is_text_shape(shape)
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        _options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let params: ContainsParams = parse_parameters(self.name(), parameters)?;
        let words: Vec<&str> = params
            .words
            .iter()
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .collect();
        if words.is_empty() {
            return Ok(CheckOutcome::fail_open(CheckError::new(
                "InvalidParameters",
                "default.contains: `words` is empty",
            )));
        }

        let text = target(context, phase)
            .map(ContentSnapshot::text)
            .unwrap_or_default()
            .to_lowercase();
        let found: Vec<&str> = words
            .iter()
            .copied()
            .filter(|word| text.contains(&word.to_lowercase()))
            .collect();

        let verdict = match params.operator {
            ContainsOperator::Any => !found.is_empty(),
            ContainsOperator::All => found.len() == words.len(),
            ContainsOperator::None => found.is_empty(),
        };
        Ok(CheckOutcome::verdict(verdict).with_data(serde_json::json!({
            "found_words": found,
            "operator": match params.operator {
                ContainsOperator::Any => "any",
                ContainsOperator::All => "all",
                ContainsOperator::None => "none",
            },
        })))
    }
}

#[derive(Debug, Deserialize)]
struct RegexMatchParams {
    rule: String,
    #[serde(default)]
    not: bool,
}

/// `default.regexMatch`: passes when `rule` matches (or, with `not`, when it doesn't).
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexMatchCheck;

#[async_trait]
impl Check for RegexMatchCheck {
    fn name(&self) -> &str {
        "default.regexMatch"
    }

    fn supports(&self, shape: ContentShape) -> bool {
        is_text_shape(shape)
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        _options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let params: RegexMatchParams = parse_parameters(self.name(), parameters)?;
        let regex = Regex::new(params.rule.trim()).map_err(|err| {
            CheckError::new("InvalidParameters", format!("invalid rule {}: {err}", params.rule))
        })?;
        let text = target(context, phase)
            .map(ContentSnapshot::text)
            .unwrap_or_default();
        let matched = regex.find(&text).map(|m| m.as_str().to_string());
        let verdict = matched.is_some() != params.not;
        Ok(CheckOutcome::verdict(verdict).with_data(serde_json::json!({
            "rule": params.rule,
            "not": params.not,
            "match": matched,
        })))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WordCountParams {
    #[serde(default)]
    min_words: usize,
    #[serde(default = "default_max_words")]
    max_words: usize,
    #[serde(default)]
    not: bool,
}

fn default_max_words() -> usize {
    99_999
}

/// `default.wordCount`: passes when the word count lies in `[minWords, maxWords]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountCheck;

#[async_trait]
impl Check for WordCountCheck {
    fn name(&self) -> &str {
        "default.wordCount"
    }

    fn supports(&self, shape: ContentShape) -> bool {
        is_text_shape(shape)
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        _options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let params: WordCountParams = parse_parameters(self.name(), parameters)?;
        let text = target(context, phase)
            .map(ContentSnapshot::text)
            .unwrap_or_default();
        let count = text.split_whitespace().count();
        let in_range = count >= params.min_words && count <= params.max_words;
        Ok(
            CheckOutcome::verdict(in_range != params.not).with_data(serde_json::json!({
                "word_count": count,
                "min_words": params.min_words,
                "max_words": params.max_words,
            })),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PiiCategory {
    Email,
    Ssn,
}

impl PiiCategory {
    fn regex(self) -> &'static Regex {
        match self {
            PiiCategory::Email => email_pii_regex(),
            PiiCategory::Ssn => ssn_pii_regex(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PiiCategory::Email => "email",
            PiiCategory::Ssn => "ssn",
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            PiiCategory::Email => "[EMAIL_ADDRESS]",
            PiiCategory::Ssn => "[SSN]",
        }
    }
}

fn default_pii_categories() -> Vec<PiiCategory> {
    vec![PiiCategory::Email, PiiCategory::Ssn]
}

#[derive(Debug, Deserialize)]
struct PiiParams {
    #[serde(default = "default_pii_categories")]
    categories: Vec<PiiCategory>,
    #[serde(default)]
    redact: bool,
}

/// `default.pii`: fails on detected emails/SSNs. With `redact`, the content is
/// rewritten with placeholders and the check passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PiiCheck;

#[async_trait]
impl Check for PiiCheck {
    fn name(&self) -> &str {
        "default.pii"
    }

    fn supports(&self, shape: ContentShape) -> bool {
        is_text_shape(shape)
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        _options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let params: PiiParams = parse_parameters(self.name(), parameters)?;
        let Some(snapshot) = target(context, phase) else {
            return Ok(CheckOutcome::pass());
        };
        let text = snapshot.text();

        let mut detected = BTreeMap::new();
        for category in &params.categories {
            let count = category.regex().find_iter(&text).count();
            if count > 0 {
                detected.insert(category.as_str(), count);
            }
        }
        let data = serde_json::json!({ "detected": detected });
        if detected.is_empty() {
            return Ok(CheckOutcome::pass().with_data(data));
        }
        if !params.redact {
            return Ok(CheckOutcome::fail().with_data(data));
        }

        let categories = params.categories.clone();
        let redacted = snapshot.map_text(|text| {
            let mut out = text.to_string();
            for category in &categories {
                out = category
                    .regex()
                    .replace_all(&out, category.placeholder())
                    .into_owned();
            }
            out
        });
        Ok(CheckOutcome::pass()
            .with_data(data)
            .with_transform(phase, redacted))
    }
}

fn email_pii_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        RegexBuilder::new(r"\b[A-Z0-9._%+\-]+@[A-Z0-9.\-]+\.[A-Z]{2,}\b")
            .case_insensitive(true)
            .build()
            .expect("email regex is valid")
    })
}

fn ssn_pii_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex is valid"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookParams {
    #[serde(alias = "webhookURL", alias = "url")]
    webhook_url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default = "default_webhook_timeout_ms", alias = "timeout")]
    timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReply {
    #[serde(default = "default_verdict")]
    verdict: bool,
    #[serde(default)]
    data: Value,
    #[serde(default, alias = "transformed_data")]
    transformed_data: Option<TransformedData>,
}

fn default_verdict() -> bool {
    true
}

/// `default.webhook`: delegates the verdict to an HTTP endpoint. Transport and
/// decoding failures pass with the error recorded.
#[derive(Debug, Clone, Default)]
pub struct WebhookCheck {
    client: reqwest::Client,
}

impl WebhookCheck {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn call(
        &self,
        params: &WebhookParams,
        payload: &Value,
    ) -> Result<WebhookReply, CheckError> {
        let mut request = self
            .client
            .post(params.webhook_url.trim())
            .timeout(Duration::from_millis(params.timeout_ms.max(1)))
            .json(payload);
        for (name, value) in &params.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|err| CheckError::new("WebhookError", err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = crate::utils::http::response_text_truncated(response, 4096).await;
            return Err(CheckError::new(
                "WebhookError",
                format!("webhook returned {status}: {body}"),
            ));
        }
        response
            .json::<WebhookReply>()
            .await
            .map_err(|err| CheckError::new("WebhookError", err.to_string()))
    }
}

#[async_trait]
impl Check for WebhookCheck {
    fn name(&self) -> &str {
        "default.webhook"
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        _options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let params: WebhookParams = parse_parameters(self.name(), parameters)?;
        let payload = serde_json::json!({
            "request": {
                "json": context.request.json,
                "text": context.request.text(),
            },
            "response": context.response.as_ref().map(|response| serde_json::json!({
                "json": response.json,
                "text": response.text(),
                "statusCode": context.response_status,
            })),
            "provider": context.provider,
            "endpoint": context.endpoint,
            "metadata": context.metadata,
            "eventType": phase,
        });

        match self.call(&params, &payload).await {
            Ok(reply) => {
                let transformed = reply
                    .transformed_data
                    .as_ref()
                    .and_then(|data| data.for_phase(phase))
                    .is_some();
                Ok(CheckOutcome {
                    verdict: reply.verdict,
                    error: None,
                    data: reply.data,
                    transformed,
                    transformed_data: reply.transformed_data.filter(|_| transformed),
                })
            }
            Err(err) => {
                tracing::warn!(webhook = %params.webhook_url, error = %err, "guardrail webhook failed");
                Ok(CheckOutcome::fail_open(err))
            }
        }
    }
}
