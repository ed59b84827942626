//! 推理网关抽象
//!
//! 对本系统而言推理后端是无状态黑盒：给它完整的可见历史（含调度器注入的框架消息），
//! 拿回下一条候选内容。所有上下文显式传入，两次调用之间后端不保留任何状态。

use async_trait::async_trait;

use crate::store::Message;

/// 推理客户端 trait：给定提示消息序列，产出下一条内容
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;
}
