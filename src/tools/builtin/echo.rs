//! Echo tool: returns the prompt as the result.

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolReply, ToolRequest, ToolResponse};

/// Replies with the prompt it was given.
#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the request prompt back as the result"
    }

    async fn run(&self, request: ToolRequest) -> ToolResponse {
        let reply = ToolReply::text(request.prompt.clone()).with_prompt(request.prompt);
        ToolResponse::from_reply(reply, request.api_keys)
    }
}
