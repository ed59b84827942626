//! Ezra - Rust 个人会话智能体编排内核
//!
//! 推理后端与执行后端之间的「转椅」：维护会话状态、裁决回合归属
//! （用户 / 助手 / 自我思考 / 工具）、持久化全部消息历史，并经由单一本地
//! 套接字以换行分隔 JSON 与客户端交互。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 回合调度状态机、会话管理、指令解析、错误
//! - **llm**: 推理网关（OpenAI 兼容 / Mock）
//! - **server**: 本地套接字监听、成帧、协议与指令路由
//! - **store**: SQLite 持久化消息日志
//! - **tools**: 执行网关（工具注册表与执行器）

pub mod config;
pub mod core;
pub mod llm;
pub mod server;
pub mod store;
pub mod tools;
