//! Echo 工具（联调与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 回显 args.text；缺字段算调用方错误
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back verbatim. Args: {\"text\": \"message\"}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        args.get("text")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| "echo requires a string \"text\" argument".to_string())
    }
}
