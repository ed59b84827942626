//! 执行网关
//!
//! 对每次动作请求施加超时，超时或失败映射为 AgentError（ToolTimeout / ToolExecutionFailed），
//! 每次调用输出结构化审计日志（JSON）。对调度器而言这是唯一的「执行后端」入口。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::store::ActionRequest;
use crate::tools::ToolRegistry;

/// 工具执行器：注册表 + 全局超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行动作请求；超时返回 ToolTimeout，工具返回 Err 则转 ToolExecutionFailed
    pub async fn execute(&self, request: &ActionRequest) -> Result<String, AgentError> {
        let start = Instant::now();
        let result = timeout(
            self.timeout,
            self.registry.execute(&request.tool, request.args.clone()),
        )
        .await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.tool,
            "origin_seq": request.origin_seq,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.args),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(request.tool.clone())),
        }
    }

    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.registry.tool_descriptions()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps past the executor timeout"
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    fn request(tool: &str, args: serde_json::Value) -> ActionRequest {
        ActionRequest {
            origin_seq: 1,
            tool: tool.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_execution_failure() {
        let executor = ToolExecutor::new(ToolRegistry::new(), 5);
        let err = executor
            .execute(&request("missing", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolExecutionFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let executor = ToolExecutor::new(registry, 1);
        let err = executor
            .execute(&request("slow", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout(_)));
    }

    #[tokio::test]
    async fn echo_round_trips_through_executor() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let executor = ToolExecutor::new(registry, 5);
        let out = executor
            .execute(&request("echo", serde_json::json!({"text": "ping"})))
            .await
            .unwrap();
        assert_eq!(out, "ping");
    }
}
