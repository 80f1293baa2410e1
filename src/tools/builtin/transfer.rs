//! Native transfer tool: turns a prompt such as
//! `"send 0.5 xDAI to 0x7d3a..."` into an unsigned transfer transaction.

use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::keychain::with_key_rotation;
use crate::tools::tool::{Tool, ToolReply, ToolRequest, ToolResponse};

/// Wei per whole native token.
const WEI_PER_TOKEN: Decimal = dec!(1_000_000_000_000_000_000);

static TRANSFER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<amount>\d+(?:\.\d+)?)\s*(?:x?dai|eth|ether|wxdai)?\s+to\s+(?P<to>0x[0-9a-f]{40})\b",
    )
    .expect("transfer pattern is valid")
});

/// Builds native-token transfer transactions from natural-language prompts.
#[derive(Debug)]
pub struct NativeTransferTool {
    pattern: &'static Regex,
}

impl NativeTransferTool {
    pub fn new() -> Self {
        Self {
            pattern: &TRANSFER_PATTERN,
        }
    }

    fn build_transaction(&self, prompt: &str) -> Result<Value, ToolError> {
        let invalid = |reason: &str| ToolError::InvalidParameters {
            name: "native_transfer".to_string(),
            reason: reason.to_string(),
        };

        let captures = self
            .pattern
            .captures(prompt)
            .ok_or_else(|| invalid("prompt does not name an amount and a 0x recipient"))?;

        let amount = Decimal::from_str(&captures["amount"])
            .map_err(|e| invalid(&format!("unreadable amount: {e}")))?;
        let wei = amount
            .checked_mul(WEI_PER_TOKEN)
            .ok_or_else(|| invalid("amount too large"))?
            .trunc();

        Ok(json!({
            "to": captures["to"].to_string(),
            "value": wei.to_string(),
            "data": "0x",
        }))
    }

    fn prepare_reply(&self, prompt: &str) -> Result<ToolReply, ToolError> {
        let transaction = self.build_transaction(prompt)?;
        let message = format!(
            "Transfer of {} wei to {} prepared",
            transaction["value"].as_str().unwrap_or_default(),
            transaction["to"].as_str().unwrap_or_default()
        );
        Ok(ToolReply::text(message)
            .with_prompt(prompt)
            .with_transaction(transaction))
    }
}

impl Default for NativeTransferTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for NativeTransferTool {
    fn name(&self) -> &str {
        "native_transfer"
    }

    fn description(&self) -> &str {
        "Prepare a native token transfer transaction from a prompt"
    }

    async fn run(&self, request: ToolRequest) -> ToolResponse {
        let ToolRequest {
            prompt, api_keys, ..
        } = request;
        with_key_rotation(api_keys, |_keys| {
            std::future::ready(self.prepare_reply(&prompt))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::KeyChain;

    fn request(prompt: &str) -> ToolRequest {
        ToolRequest {
            request_id: 1,
            tool: "native_transfer".into(),
            prompt: prompt.into(),
            model: None,
            params: Default::default(),
            extra: Default::default(),
            api_keys: KeyChain::default(),
        }
    }

    #[tokio::test]
    async fn builds_transfer() {
        let to = "0x7d3A625977bFD7445466439E60C495bdc2855367";
        let response = NativeTransferTool::new()
            .run(request(&format!("please send 0.5 xDAI to {to} asap")))
            .await;

        let tx = response.transaction.unwrap();
        assert_eq!(tx["to"], to);
        assert_eq!(tx["value"], "500000000000000000");
        assert_eq!(tx["data"], "0x");
        assert!(response.message.contains("500000000000000000"));
    }

    #[tokio::test]
    async fn unparseable_prompt_is_a_failure() {
        let response = NativeTransferTool::new()
            .run(request("buy me something nice"))
            .await;
        assert!(response.transaction.is_none());
        assert!(response.message.contains("recipient"));
        assert_eq!(response.prompt.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn hands_back_the_key_chain() {
        let mut req = request("send 1 xDAI to 0x7d3A625977bFD7445466439E60C495bdc2855367");
        req.api_keys = KeyChain::new([("openai".to_string(), vec!["k1".to_string()])].into());
        let response = NativeTransferTool::new().run(req).await;
        assert_eq!(response.keys.services(), vec!["openai".to_string()]);
        assert_eq!(response.transaction.unwrap()["value"], "1000000000000000000");
    }
}
