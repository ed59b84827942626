//! 持久化消息日志与消息类型

mod message;
mod sqlite;

pub use message::{ActionRequest, Message, PromptRole, Role, StoredMessage};
pub use sqlite::{MessageStore, SessionInfo};
