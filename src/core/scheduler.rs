//! 回合调度器：每会话一个状态机任务
//!
//! AwaitingUser -> GeneratingAssistant -> (AwaitingTool | GeneratingInnerMonologue | AwaitingUser)，
//! 网关失败或超时进入 Faulted，仅管理员 reset 可退出。每个产出内容的迁移恰好追加一条消息并
//! 按 seq 顺序广播给订阅者，之后才考虑下一次迁移；调度器单调推进，绝不回头改写历史。
//! 网关调用是唯一的挂起点，只挂起本会话的任务，其他会话不受影响。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::directive::{parse_generated, GeneratedOutput};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::store::{ActionRequest, Message, MessageStore, Role, StoredMessage};
use crate::tools::ToolExecutor;

/// 无用户回合时注入的叙事框架（经验结论：空提示会让模型产出退化输出，
/// 必须显式说明当前没有用户输入、期望它继续自己的思路）
const MONOLOGUE_FRAMING: &str = "No new user message has arrived. You are alone with your \
thoughts: continue your inner monologue out loud, picking up an open question or thread from \
the conversation so far. Do not greet anyone and do not wait for input.";

/// 调度器状态（状态名随历史一起持久化，重启后恢复）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    /// 空闲，等待用户回合（初始状态，也是会话的常驻停靠点）
    AwaitingUser,
    GeneratingAssistant,
    GeneratingInnerMonologue,
    AwaitingTool,
    /// 网关/存储故障后停摆，仅 reset 可恢复
    Faulted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::AwaitingUser => "awaiting_user",
            TurnState::GeneratingAssistant => "generating_assistant",
            TurnState::GeneratingInnerMonologue => "generating_inner_monologue",
            TurnState::AwaitingTool => "awaiting_tool",
            TurnState::Faulted => "faulted",
        }
    }

    pub fn parse(s: &str) -> Option<TurnState> {
        match s {
            "awaiting_user" => Some(TurnState::AwaitingUser),
            "generating_assistant" => Some(TurnState::GeneratingAssistant),
            "generating_inner_monologue" => Some(TurnState::GeneratingInnerMonologue),
            "awaiting_tool" => Some(TurnState::AwaitingTool),
            "faulted" => Some(TurnState::Faulted),
            _ => None,
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调度器配置（系统提示词由 SessionManager 预先拼好，含工具清单与指令语法）
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub system_prompt: String,
    /// 自我思考延续标记（出现在生成内容末尾时继续思考）
    pub continue_marker: String,
    /// 连续自我思考回合上限，超过强制回到 AwaitingUser
    pub max_monologue_turns: u32,
    /// 进入提示词的历史窗口条数（存储保留全量）
    pub history_window: usize,
    /// 单次推理调用的有界等待
    pub gateway_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful AI assistant.".to_string(),
            continue_marker: "[[continue]]".to_string(),
            max_monologue_turns: 4,
            history_window: 30,
            gateway_timeout: Duration::from_secs(60),
        }
    }
}

/// 发给会话调度器的指令（SessionManager 经 mpsc 投递）
#[derive(Debug)]
pub enum SessionCommand {
    /// 提交一条用户回合；落盘成功后以分配的 seq 应答
    Submit {
        content: String,
        reply: oneshot::Sender<Result<u64, AgentError>>,
    },
    /// 管理员 reset：清除 Faulted 回到 AwaitingUser（非 Faulted 时是无害的空操作）
    Reset {
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    /// 停止调度（保留历史）
    Shutdown,
}

/// 每会话回合调度器：会话消息日志的唯一写入者
pub struct TurnScheduler {
    session_id: String,
    store: Arc<MessageStore>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    cfg: SchedulerConfig,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<StoredMessage>,
    state_tx: watch::Sender<TurnState>,
    cancel: CancellationToken,
    state: TurnState,
    /// 连续 inner-monologue 消息计数（回到 AwaitingUser 时清零）
    monologue_run: u32,
    pending_action: Option<ActionRequest>,
}

impl TurnScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        store: Arc<MessageStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolExecutor>,
        cfg: SchedulerConfig,
        cmd_rx: mpsc::Receiver<SessionCommand>,
        events: broadcast::Sender<StoredMessage>,
        state_tx: watch::Sender<TurnState>,
        cancel: CancellationToken,
    ) -> Self {
        let persisted = store
            .session_state(&session_id)
            .ok()
            .flatten()
            .and_then(|s| TurnState::parse(&s))
            .unwrap_or(TurnState::AwaitingUser);
        let (state, pending_action) = Self::restore(&store, &session_id, persisted, &cfg);
        state_tx.send_replace(state);

        Self {
            session_id,
            store,
            llm,
            tools,
            cfg,
            cmd_rx,
            events,
            state_tx,
            cancel,
            state,
            monologue_run: 0,
            pending_action,
        }
    }

    /// 重启恢复：AwaitingTool 需要从最后一条生成消息重新解析出动作请求，
    /// 解析不出来就退回 AwaitingUser；其余状态原样恢复（Generating* 会直接重新生成）。
    fn restore(
        store: &MessageStore,
        session_id: &str,
        persisted: TurnState,
        cfg: &SchedulerConfig,
    ) -> (TurnState, Option<ActionRequest>) {
        if persisted != TurnState::AwaitingTool {
            return (persisted, None);
        }
        match store.last_generated(session_id) {
            Ok(Some(msg)) => match parse_generated(&msg.content, &cfg.continue_marker) {
                GeneratedOutput::Action { call, .. } => (
                    TurnState::AwaitingTool,
                    Some(ActionRequest {
                        origin_seq: msg.seq,
                        tool: call.tool,
                        args: call.args,
                    }),
                ),
                _ => {
                    tracing::warn!(
                        session = %session_id,
                        "restored awaiting_tool but no directive found; falling back to awaiting_user"
                    );
                    (TurnState::AwaitingUser, None)
                }
            },
            _ => (TurnState::AwaitingUser, None),
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(session = %self.session_id, state = %self.state, "scheduler started");
        loop {
            match self.state {
                TurnState::AwaitingUser => {
                    self.monologue_run = 0;
                    let stop = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        cmd = self.cmd_rx.recv() => match cmd {
                            None => true,
                            Some(cmd) => self.handle_idle_command(cmd),
                        },
                    };
                    if stop {
                        break;
                    }
                }
                TurnState::GeneratingAssistant => self.generate(Role::Assistant).await,
                TurnState::GeneratingInnerMonologue => self.generate(Role::InnerMonologue).await,
                TurnState::AwaitingTool => self.run_tool().await,
                TurnState::Faulted => {
                    let stop = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        cmd = self.cmd_rx.recv() => match cmd {
                            None => true,
                            Some(cmd) => self.handle_faulted_command(cmd),
                        },
                    };
                    if stop {
                        break;
                    }
                }
            }
        }
        tracing::debug!(session = %self.session_id, "scheduler stopped");
    }

    /// AwaitingUser 下的指令处理；返回 true 表示停止调度
    fn handle_idle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Submit { content, reply } => {
                match self.append(Role::User, &content, None) {
                    Ok(msg) => {
                        let _ = reply.send(Ok(msg.seq));
                        self.set_state(TurnState::GeneratingAssistant);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        self.fault(e);
                    }
                }
                false
            }
            SessionCommand::Reset { reply } => {
                let _ = reply.send(Ok(()));
                false
            }
            SessionCommand::Shutdown => true,
        }
    }

    fn handle_faulted_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Submit { reply, .. } => {
                let _ = reply.send(Err(AgentError::SessionRejected(
                    "session is faulted; administrative reset required".to_string(),
                )));
                false
            }
            SessionCommand::Reset { reply } => {
                match self.append(Role::System, "fault cleared by administrative reset", None) {
                    Ok(_) => {
                        self.pending_action = None;
                        self.monologue_run = 0;
                        self.set_state(TurnState::AwaitingUser);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        // 存储仍不可用，维持 Faulted，等下一次 reset
                        let _ = reply.send(Err(e));
                    }
                }
                false
            }
            SessionCommand::Shutdown => true,
        }
    }

    /// 一次推理迁移：拼提示词 -> 有界等待网关 -> 解析 -> 追加并广播 -> 选择下一状态。
    /// 超时或后端失败不提交任何部分输出，直接进入 Faulted。
    async fn generate(&mut self, role: Role) {
        let prompt = match self.build_prompt(role) {
            Ok(p) => p,
            Err(e) => return self.fault(e),
        };

        let output = match timeout(self.cfg.gateway_timeout, self.llm.complete(&prompt)).await {
            Err(_) => {
                return self.fault(AgentError::GatewayTimeout(
                    self.cfg.gateway_timeout.as_secs(),
                ))
            }
            Ok(Err(e)) => return self.fault(AgentError::Gateway(e)),
            Ok(Ok(text)) => text,
        };

        match parse_generated(&output, &self.cfg.continue_marker) {
            GeneratedOutput::Response(content) => {
                if self.append_or_fault(role, &content, None).is_some() {
                    self.set_state(TurnState::AwaitingUser);
                }
            }
            GeneratedOutput::Continuation(content) => {
                if self.append_or_fault(role, &content, None).is_some() {
                    self.enter_monologue();
                }
            }
            GeneratedOutput::Action { content, call } => {
                if let Some(msg) = self.append_or_fault(role, &content, None) {
                    self.pending_action = Some(ActionRequest {
                        origin_seq: msg.seq,
                        tool: call.tool,
                        args: call.args,
                    });
                    self.set_state(TurnState::AwaitingTool);
                }
            }
        }
    }

    /// 进入（或继续）自我思考；到达上限时写入一条 system 截断消息并强制回到 AwaitingUser
    fn enter_monologue(&mut self) {
        if self.monologue_run >= self.cfg.max_monologue_turns {
            let note = format!(
                "inner monologue cut off after {} consecutive turns",
                self.monologue_run
            );
            if self.append_or_fault(Role::System, &note, None).is_some() {
                self.set_state(TurnState::AwaitingUser);
            }
        } else {
            self.set_state(TurnState::GeneratingInnerMonologue);
        }
    }

    async fn run_tool(&mut self) {
        let request = match self.pending_action.take() {
            Some(r) => r,
            // 防御：没有待执行请求时直接把机会还给助手
            None => return self.set_state(TurnState::GeneratingAssistant),
        };
        match self.tools.execute(&request).await {
            Ok(result) => {
                if self
                    .append_or_fault(Role::ToolResult, &result, Some(request.origin_seq))
                    .is_some()
                {
                    // 助手先对工具结果做出反应，再把话语权交还用户
                    self.set_state(TurnState::GeneratingAssistant);
                }
            }
            Err(e) => self.fault(e),
        }
    }

    /// 可见历史 + 角色映射；自我思考模式额外注入叙事框架消息（只进提示词，不入库）
    fn build_prompt(&self, role: Role) -> Result<Vec<Message>, AgentError> {
        let history = self.store.tail(&self.session_id, self.cfg.history_window)?;
        let mut prompt = Vec::with_capacity(history.len() + 2);
        prompt.push(Message::system(self.cfg.system_prompt.clone()));
        for m in &history {
            prompt.push(match m.role {
                Role::User => Message::user(m.content.clone()),
                Role::Assistant | Role::InnerMonologue => Message::assistant(m.content.clone()),
                Role::ToolResult => Message::user(format!("Observation: {}", m.content)),
                Role::System => Message::system(m.content.clone()),
            });
        }
        if role == Role::InnerMonologue {
            prompt.push(Message::system(MONOLOGUE_FRAMING.to_string()));
        }
        Ok(prompt)
    }

    /// 追加并广播一条消息；inner-monologue 追加会推进连续计数
    fn append(
        &mut self,
        role: Role,
        content: &str,
        action_seq: Option<u64>,
    ) -> Result<StoredMessage, AgentError> {
        let msg = self.store.append(&self.session_id, role, content, action_seq)?;
        if role == Role::InnerMonologue {
            self.monologue_run += 1;
        }
        let _ = self.events.send(msg.clone());
        Ok(msg)
    }

    fn append_or_fault(
        &mut self,
        role: Role,
        content: &str,
        action_seq: Option<u64>,
    ) -> Option<StoredMessage> {
        match self.append(role, content, action_seq) {
            Ok(m) => Some(m),
            Err(e) => {
                self.fault(e);
                None
            }
        }
    }

    /// 进入 Faulted：记录故障、向订阅者广播一条 system 消息（尽力而为）
    fn fault(&mut self, err: AgentError) {
        match &err {
            AgentError::Store(_) => {
                // 存储失败危及持久性保证，是唯一升级为运维告警的类别
                tracing::error!(session = %self.session_id, error = %err, "session faulted");
            }
            _ => tracing::warn!(session = %self.session_id, error = %err, "session faulted"),
        }
        if let Err(e) = self.append(Role::System, &format!("fault: {}", err), None) {
            tracing::error!(session = %self.session_id, error = %e, "could not record fault message");
        }
        self.pending_action = None;
        self.set_state(TurnState::Faulted);
    }

    fn set_state(&mut self, next: TurnState) {
        self.state = next;
        self.state_tx.send_replace(next);
        if let Err(e) = self.store.set_session_state(&self.session_id, next.as_str()) {
            tracing::error!(session = %self.session_id, error = %e, "failed to persist scheduler state");
            if next != TurnState::Faulted {
                self.state = TurnState::Faulted;
                self.state_tx.send_replace(TurnState::Faulted);
            }
        }
    }
}
