//! 错误类型与传播策略
//!
//! 连接级错误只回给出错的连接；会话级错误只影响该会话（网关失败会让会话进入 Faulted）；
//! 存储层失败是唯一允许上升为运维告警（error 日志）的类别。

use thiserror::Error;

/// 编排内核运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 入站记录不是合法 JSON 或字段缺失（仅回给出错连接，连接保持打开）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 会话当前不接受用户输入（非 AwaitingUser 或已 Faulted）
    #[error("Submission rejected: {0}")]
    SessionRejected(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 推理或执行后端报告失败
    #[error("Gateway failure: {0}")]
    Gateway(String),

    /// 网关调用超过有界等待时间
    #[error("Gateway timeout after {0}s")]
    GatewayTimeout(u64),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 持久层无法提交（该会话调度器停摆，等待管理员 reset）
    #[error("Store failure: {0}")]
    Store(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl AgentError {
    /// 线上协议 error 记录中的 kind 字段
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Protocol(_) => "protocol",
            AgentError::SessionRejected(_) => "session_rejected",
            AgentError::SessionNotFound(_) => "session_not_found",
            AgentError::Gateway(_)
            | AgentError::GatewayTimeout(_)
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_) => "gateway",
            AgentError::Store(_) => "store",
            AgentError::UnknownCommand(_) => "unknown_command",
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Store(e.to_string())
    }
}
