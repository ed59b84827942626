//! 线上协议定义
//!
//! 本地套接字上双向交换换行分隔的 JSON 记录（内部 tag 为 type）。入站是聊天提交
//! （/ 前缀时作为指令路由）或心跳/关闭；出站是持久化消息、受理回执、指令应答与
//! 结构化错误。可恢复错误绝不静默断开连接。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::store::StoredMessage;

/// 客户端 -> 服务端
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRecord {
    /// 聊天提交；content 以 / 开头时按指令解析
    Chat { content: String },
    Ping { timestamp: u64 },
    /// 客户端主动结束连接（会话不受影响）
    Close,
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerRecord {
    /// 订阅流中的一条持久化消息
    Message {
        #[serde(flatten)]
        message: StoredMessage,
    },
    /// 用户回合受理回执（已落盘，seq 为分配的序号）
    Accepted { session_id: String, seq: u64 },
    CommandReply {
        command: String,
        detail: serde_json::Value,
    },
    Error { kind: String, message: String },
    Pong { timestamp: u64 },
}

impl ServerRecord {
    pub fn error(err: &AgentError) -> Self {
        ServerRecord::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn reply(command: &str, detail: serde_json::Value) -> Self {
        ServerRecord::CommandReply {
            command: command.to_string(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;

    #[test]
    fn chat_record_parses() {
        let rec: ClientRecord = serde_json::from_str(r#"{"type":"chat","content":"hi"}"#).unwrap();
        assert!(matches!(rec, ClientRecord::Chat { content } if content == "hi"));
    }

    #[test]
    fn message_record_flattens_stored_fields() {
        let rec = ServerRecord::Message {
            message: StoredMessage {
                session_id: "s1".into(),
                seq: 7,
                role: Role::Assistant,
                content: "hi".into(),
                created_at: 1700000000,
                action_seq: None,
            },
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["role"], "assistant");

        let back: ServerRecord = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ServerRecord::Message { message } if message.seq == 7));
    }

    #[test]
    fn error_record_carries_kind() {
        let rec = ServerRecord::error(&AgentError::UnknownCommand("frobnicate".into()));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "unknown_command");
    }
}
