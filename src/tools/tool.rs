//! Tool trait and the request/response types that cross the tool boundary.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keychain::KeyChain;

/// Everything a tool receives for one request.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub request_id: u64,
    /// Tool name as requested in the payload.
    pub tool: String,
    pub prompt: String,
    /// Requested model, falling back to the manifest's `default_model`.
    pub model: Option<String>,
    /// Parameters declared by the tool manifest.
    pub params: Map<String, Value>,
    /// Remaining payload fields, passed through untouched.
    pub extra: Map<String, Value>,
    pub api_keys: KeyChain,
}

/// Token and cost accounting for one tool run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMeter {
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Decimal,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one model call priced per input/output token.
    pub fn record(
        &mut self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_per_token: (Decimal, Decimal),
    ) {
        self.model = Some(model.to_string());
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_cost += cost_per_token.0 * Decimal::from(input_tokens)
            + cost_per_token.1 * Decimal::from(output_tokens);
    }

    /// The `cost_dict` section of a response envelope.
    pub fn cost_dict(&self) -> Value {
        serde_json::json!({
            "model": self.model,
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "total_tokens": self.input_tokens + self.output_tokens,
            "total_cost": self.total_cost.to_string(),
        })
    }
}

/// What a tool body produces before the key chain is attached.
#[derive(Debug, Clone, Default)]
pub struct ToolReply {
    pub message: String,
    pub prompt: Option<String>,
    pub transaction: Option<Value>,
    pub usage: Option<UsageMeter>,
}

impl ToolReply {
    /// A plain text reply.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_transaction(mut self, transaction: Value) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_usage(mut self, usage: UsageMeter) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The full result of a tool run.
///
/// A recoverable failure is a response whose `message` explains the error,
/// with an empty prompt and no transaction or usage.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub message: String,
    pub prompt: Option<String>,
    pub transaction: Option<Value>,
    pub usage: Option<UsageMeter>,
    /// The key chain after any rotations the tool performed.
    pub keys: KeyChain,
}

impl ToolResponse {
    pub fn from_reply(reply: ToolReply, keys: KeyChain) -> Self {
        Self {
            message: reply.message,
            prompt: reply.prompt,
            transaction: reply.transaction,
            usage: reply.usage,
            keys,
        }
    }

    pub fn failure(message: impl Into<String>, keys: KeyChain) -> Self {
        Self {
            message: message.into(),
            prompt: Some(String::new()),
            transaction: None,
            usage: None,
            keys,
        }
    }
}

/// An executable tool implementation.
///
/// Implementations own their external-API retry policy; see
/// [`crate::keychain::with_key_rotation`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Callable name that tool manifests refer to.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, request: ToolRequest) -> ToolResponse;
}
