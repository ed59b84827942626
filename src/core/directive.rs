//! 生成内容解析：动作指令与自我思考延续标记
//!
//! 模型输出三选一：含有效 JSON Tool Call（```json 块或裸 JSON）则为动作指令；
//! 以延续标记结尾则为自我思考延续（标记在入库前剥离）；否则是普通回复。
//! 无法解析的 JSON 一律按普通回复处理（正文里合法地出现花括号不该让会话出错）。

use serde::{Deserialize, Serialize};

/// 模型输出中嵌入的工具调用（{"tool": "echo", "args": {...}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 一次生成的解析结果
#[derive(Debug, Clone)]
pub enum GeneratedOutput {
    /// 面向用户的普通回复
    Response(String),
    /// 模型选择继续自我思考（content 已剥离标记）
    Continuation(String),
    /// 动作指令；content 为完整生成文本（入库用）
    Action { content: String, call: ToolCall },
}

/// 解析一次生成的输出；continue_marker 为配置的延续标记
pub fn parse_generated(output: &str, continue_marker: &str) -> GeneratedOutput {
    let trimmed = output.trim();

    if !continue_marker.is_empty() {
        if let Some(stripped) = trimmed.strip_suffix(continue_marker) {
            return GeneratedOutput::Continuation(stripped.trim_end().to_string());
        }
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()))
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            Some(&trimmed[start..=end])
        } else {
            None
        }
    } else {
        None
    };

    if let Some(json_str) = json_str {
        if let Ok(call) = serde_json::from_str::<ToolCall>(json_str) {
            if !call.tool.is_empty() {
                return GeneratedOutput::Action {
                    content: trimmed.to_string(),
                    call,
                };
            }
        }
    }

    GeneratedOutput::Response(trimmed.to_string())
}
