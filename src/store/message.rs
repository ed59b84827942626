//! 消息与动作请求类型
//!
//! StoredMessage 是持久化日志中的一条回合（会话内 seq 严格递增、不可变更）；
//! Message 是发给 LLM 的轻量 role/content 对，二者角色空间不同，映射由调度器负责。

use serde::{Deserialize, Serialize};

/// 持久化消息的角色（回合归属）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// 模型在无用户输入时的自我思考回合
    InnerMonologue,
    ToolResult,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::InnerMonologue => "inner_monologue",
            Role::ToolResult => "tool_result",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "inner_monologue" => Some(Role::InnerMonologue),
            "tool_result" => Some(Role::ToolResult),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话日志中的一条回合，写入后不可变更（更正以新消息表达，绝不改写旧消息）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    /// 会话内单调递增、稠密的序号（从 1 开始）
    pub seq: u64,
    pub role: Role,
    pub content: String,
    /// Unix 时间戳（秒）
    pub created_at: i64,
    /// tool_result 专用：其解析的动作指令所在消息的 seq
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_seq: Option<u64>,
}

/// 发给推理后端的提示消息（LLM API 的三种角色）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: PromptRole,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// 动作请求：助手/自我思考消息中解析出的工具调用指令，在产出 tool_result 前会话不再推进
#[derive(Clone, Debug)]
pub struct ActionRequest {
    /// 指令所在消息的 seq
    pub origin_seq: u64,
    pub tool: String,
    pub args: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [
            Role::User,
            Role::Assistant,
            Role::InnerMonologue,
            Role::ToolResult,
            Role::System,
        ] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("self"), None);
    }

    #[test]
    fn stored_message_wire_shape() {
        let msg = StoredMessage {
            session_id: "s1".into(),
            seq: 3,
            role: Role::InnerMonologue,
            content: "hmm".into(),
            created_at: 1700000000,
            action_seq: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "inner_monologue");
        assert!(json.get("action_seq").is_none());
    }
}
