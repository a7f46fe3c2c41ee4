use async_trait::async_trait;
use serde_json::{json, Value};

use relay_core::errors::ToolError;

use super::{required_str, Tool, ToolContext};

pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";

/// Offered to an `LlmAgent` that has agents it may hand control to.
pub struct TransferToAgentTool {
    description: String,
}

impl TransferToAgentTool {
    /// `targets` are `(name, description)` pairs listed in the tool description.
    pub fn new<'a>(targets: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut description =
            String::from("Transfer the question to another agent. Available agents:");
        for (name, about) in targets {
            description.push_str(&format!("\n- {name}"));
            if !about.is_empty() {
                description.push_str(&format!(": {about}"));
            }
        }
        Self { description }
    }
}

#[async_trait]
impl Tool for TransferToAgentTool {
    fn name(&self) -> &str {
        TRANSFER_TO_AGENT
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_name": {"type": "string", "description": "the agent name to transfer to"}
            },
            "required": ["agent_name"]
        })
    }

    async fn run(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let agent_name = required_str(&args, "agent_name")?;
        ctx.transfer_to_agent(agent_name);
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_lists_targets() {
        let tool = TransferToAgentTool::new([("billing", "handles invoices"), ("support", "")]);
        assert!(tool.description().contains("- billing: handles invoices"));
        assert!(tool.description().contains("- support"));
        assert_eq!(tool.declaration().name, TRANSFER_TO_AGENT);
    }
}
