//! 核心编排层：错误、指令解析、回合调度、会话管理

pub mod directive;
pub mod error;
pub mod scheduler;
pub mod session;

pub use directive::{parse_generated, GeneratedOutput, ToolCall};
pub use error::AgentError;
pub use scheduler::{SchedulerConfig, SessionCommand, TurnScheduler, TurnState};
pub use session::{compose_system_prompt, SessionHandle, SessionManager, Subscription};
