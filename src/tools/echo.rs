//! Echo 工具（调试与测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::tools::schema::schema_for_args;
use crate::tools::{Tool, ToolContext};

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：原样返回 text
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_for_args::<EchoArgs>()
    }

    async fn invoke(&self, _ctx: ToolContext, args: Map<String, Value>) -> Result<Value, String> {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
        Ok(serde_json::json!({ "text": text }))
    }
}
