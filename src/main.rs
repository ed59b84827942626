//! Ezra - Rust 个人会话智能体编排内核
//!
//! 入口：初始化日志、装配存储/网关/会话管理器，监听本地套接字直到收到停机信号。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ezra::config::{load_config, AppConfig, DEFAULT_PERSONA};
use ezra::core::{compose_system_prompt, SchedulerConfig, SessionManager};
use ezra::llm::{LlmClient, MockLlmClient, OpenAiClient};
use ezra::server::EzraServer;
use ezra::store::MessageStore;
use ezra::tools::{EchoTool, ShellTool, ToolExecutor, ToolRegistry};

/// 根据配置选择推理后端（OpenAI 兼容端点 / Mock）
fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::warn!("Using Mock LLM (no backend configured)");
            Arc::new(MockLlmClient::new())
        }
        _ => {
            tracing::info!(
                "Using OpenAI-compatible LLM ({}{})",
                cfg.llm.model,
                cfg.llm
                    .base_url
                    .as_deref()
                    .map(|u| format!(" @ {}", u))
                    .unwrap_or_default()
            );
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                None,
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    std::fs::create_dir_all(&cfg.app.data_dir).context("Failed to create data dir")?;

    let store =
        Arc::new(MessageStore::open(cfg.app.db_path()).context("Failed to open message store")?);
    let llm = create_llm_from_config(&cfg);

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ShellTool::new(cfg.tools.shell.allowed_commands.clone()));
    let tools = Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs));

    let persona = cfg
        .scheduler
        .persona
        .clone()
        .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
    let scheduler_cfg = SchedulerConfig {
        system_prompt: compose_system_prompt(&persona, &tools, &cfg.scheduler.continue_marker),
        continue_marker: cfg.scheduler.continue_marker.clone(),
        max_monologue_turns: cfg.scheduler.max_monologue_turns,
        history_window: cfg.scheduler.history_window,
        gateway_timeout: Duration::from_secs(cfg.scheduler.gateway_timeout_secs),
    };

    let manager = Arc::new(SessionManager::new(store, llm, tools, scheduler_cfg));
    let server = EzraServer::new(Arc::clone(&manager), cfg.app.socket_path());

    // SIGINT / SIGTERM 优雅停机
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Server run failed")?;
    manager.shutdown();

    Ok(())
}
