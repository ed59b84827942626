//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EZRA__*` 覆盖（双下划线表示嵌套，如 `EZRA__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 默认人设（可用 [scheduler].persona 覆盖）
pub const DEFAULT_PERSONA: &str = "You are Ezra, a curious and candid personal companion. \
You think out loud when something is worth chewing on, you reach for your tools when words \
alone are not enough, and you would rather examine an idea that contradicts your own than \
ignore it. Keep your replies grounded and conversational.";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub scheduler: SchedulerSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [app] 段：数据目录与套接字/库文件位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 数据目录（socket 与 SQLite 库默认都放这里）
    pub data_dir: PathBuf,
    /// 显式覆盖套接字路径
    pub socket_path: Option<PathBuf>,
    /// 显式覆盖库文件路径
    pub db_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("data"),
            socket_path: None,
            db_path: None,
        }
    }
}

impl AppSection {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ezra.sock"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ezra.db"))
    }
}

/// [scheduler] 段：回合调度参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 连续自我思考回合上限
    pub max_monologue_turns: u32,
    /// 自我思考延续标记
    pub continue_marker: String,
    /// 进入提示词的历史窗口条数
    pub history_window: usize,
    /// 单次推理调用的有界等待（秒）
    pub gateway_timeout_secs: u64,
    /// 人设覆盖；未设置时用内置默认
    pub persona: Option<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_monologue_turns: 4,
            continue_marker: "[[continue]]".to_string(),
            history_window: 30,
            gateway_timeout_secs: 60,
            persona: None,
        }
    }
}

/// [llm] 段：推理后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点，含本地 Ollama）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "llama3.1".to_string(),
            base_url: None,
        }
    }
}

/// [tools] 段：执行网关参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: vec![
                "ls".into(),
                "grep".into(),
                "cat".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "date".into(),
                "uname".into(),
            ],
        }
    }
}

pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EZRA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.socket_path(), PathBuf::from("data/ezra.sock"));
        assert_eq!(cfg.app.db_path(), PathBuf::from("data/ezra.db"));
        assert_eq!(cfg.scheduler.max_monologue_turns, 4);
        assert!(!cfg.scheduler.continue_marker.is_empty());
    }
}
