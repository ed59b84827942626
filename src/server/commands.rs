//! 指令路由
//!
//! 保留前缀 / 把会话控制指令与普通聊天内容区分开（与会话流异步进行的带外操作）。
//! 未知指令返回结构化错误，绝不静默吞掉。

use crate::core::AgentError;

pub const HELP_TEXT: &str = "\
/attach [session_id]   create or resume a session\n\
/subscribe [after_seq] stream messages, replaying everything after after_seq\n\
/sessions              list sessions\n\
/delete <session_id>   delete a session and its history\n\
/reset                 clear a faulted session\n\
/help                  this text";

/// 解析后的客户端指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Attach { session_id: Option<String> },
    Subscribe { after_seq: u64 },
    Sessions,
    Delete { session_id: String },
    Reset,
    Help,
}

/// 非 / 前缀内容返回 None（普通聊天）；指令本身有问题时返回 Err
pub fn parse_directive(content: &str) -> Option<Result<Directive, AgentError>> {
    let rest = content.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let name = match parts.next() {
        Some(n) => n,
        None => return Some(Err(AgentError::UnknownCommand("/".to_string()))),
    };

    let directive = match name {
        "attach" => Ok(Directive::Attach {
            session_id: parts.next().map(String::from),
        }),
        "subscribe" => match parts.next() {
            None => Ok(Directive::Subscribe { after_seq: 0 }),
            Some(raw) => raw
                .parse()
                .map(|after_seq| Directive::Subscribe { after_seq })
                .map_err(|_| AgentError::Protocol(format!("invalid sequence number: {}", raw))),
        },
        "sessions" => Ok(Directive::Sessions),
        "delete" => match parts.next() {
            Some(id) => Ok(Directive::Delete {
                session_id: id.to_string(),
            }),
            None => Err(AgentError::Protocol("usage: /delete <session_id>".to_string())),
        },
        "reset" => Ok(Directive::Reset),
        "help" => Ok(Directive::Help),
        other => Err(AgentError::UnknownCommand(other.to_string())),
    };
    Some(directive)
}
