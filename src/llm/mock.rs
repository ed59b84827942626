//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按预置脚本逐条吐出输出，脚本耗尽后回显最后一条 User 消息；
//! 测试用它驱动调度器走完回复 / 工具 / 自我思考 / 故障各条路径。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::store::{Message, PromptRole};

/// Mock 客户端：先按脚本出牌，脚本空了回显用户输入
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一串输出（Ok 为生成内容，Err 为后端失败）
    pub fn with_script(outputs: impl IntoIterator<Item = Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(outputs.into_iter().collect()),
        }
    }

    /// 追加一条脚本输出
    pub fn push(&self, output: Result<String, String>) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(output);
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(output) = scripted {
            return output;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_drains_in_order_then_echoes() {
        let llm = MockLlmClient::with_script([Ok("one".to_string()), Err("down".to_string())]);
        let history = [Message::user("hello")];
        assert_eq!(llm.complete(&history).await.unwrap(), "one");
        assert_eq!(llm.complete(&history).await.unwrap_err(), "down");
        assert_eq!(
            llm.complete(&history).await.unwrap(),
            "Echo from Mock: hello"
        );
    }
}
