//! 会话管理
//!
//! 每个会话 id 同一时刻恰好有一个调度器任务在跑（所有变更的串行化点）。
//! open 创建或接续（重启后从存储恢复历史与状态）；submit 按会话串行、只在
//! AwaitingUser 受理；subscribe 从游标回放存量再切换到实时广播，跨越断线不丢不重；
//! close 停调度保历史，delete 不可逆清除。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::scheduler::{SchedulerConfig, SessionCommand, TurnScheduler, TurnState};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::store::{MessageStore, SessionInfo, StoredMessage};
use crate::tools::ToolExecutor;

/// 活跃会话的句柄：指令通道、状态观察、事件广播
pub struct SessionHandle {
    pub id: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<TurnState>,
    events: broadcast::Sender<StoredMessage>,
    /// submit 的会话级串行化（状态检查与入队之间不允许并发交错）
    submit_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn state(&self) -> TurnState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<TurnState> {
        self.state_rx.clone()
    }
}

/// 会话管理器：会话句柄表 + 共享的存储与网关
pub struct SessionManager {
    store: Arc<MessageStore>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    cfg: SchedulerConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        store: Arc<MessageStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolExecutor>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            llm,
            tools,
            cfg,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// 创建或接续会话；不给 id 时分配新的。已有调度器直接复用，
    /// 否则从存储恢复（历史 + 状态名）并拉起新的调度器任务。
    pub async fn open(&self, session_id: Option<&str>) -> Result<Arc<SessionHandle>, AgentError> {
        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(handle) = self.sessions.read().await.get(&id) {
            return Ok(Arc::clone(handle));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&id) {
            return Ok(Arc::clone(handle));
        }

        self.store
            .create_session(&id, TurnState::AwaitingUser.as_str())?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(TurnState::AwaitingUser);
        let cancel = self.cancel.child_token();

        let scheduler = TurnScheduler::new(
            id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            self.cfg.clone(),
            cmd_rx,
            events.clone(),
            state_tx,
            cancel.clone(),
        );
        tokio::spawn(scheduler.run());

        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            cmd_tx,
            state_rx,
            events,
            submit_lock: Mutex::new(()),
            cancel,
        });
        sessions.insert(id, Arc::clone(&handle));
        tracing::info!(session = %handle.id, "session opened");
        Ok(handle)
    }

    async fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>, AgentError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    /// 提交一条用户回合。仅 AwaitingUser 受理；落盘成功后返回分配的 seq。
    /// 调度器在飞行中（生成/执行工具/故障）一律拒绝，不产生任何新消息。
    pub async fn submit(&self, session_id: &str, content: &str) -> Result<u64, AgentError> {
        let handle = self.get(session_id).await?;
        let _guard = handle.submit_lock.lock().await;

        let state = handle.state();
        if state != TurnState::AwaitingUser {
            return Err(AgentError::SessionRejected(format!(
                "scheduler is {}; user turns are only accepted while awaiting_user",
                state
            )));
        }

        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(SessionCommand::Submit {
                content: content.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| AgentError::SessionNotFound(session_id.to_string()))?;
        rx.await.map_err(|_| {
            AgentError::SessionRejected("scheduler stopped before acknowledging".to_string())
        })?
    }

    /// 订阅会话消息流，回放 seq > after_seq 的存量后接实时广播
    pub async fn subscribe(
        &self,
        session_id: &str,
        after_seq: u64,
    ) -> Result<Subscription, AgentError> {
        let handle = self.get(session_id).await?;
        Ok(Subscription {
            store: Arc::clone(&self.store),
            session_id: session_id.to_string(),
            next_seq: after_seq + 1,
            rx: handle.events.subscribe(),
            backlog: VecDeque::new(),
            live_closed: false,
        })
    }

    /// 清除 Faulted 状态（管理员指令）
    pub async fn reset(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self.get(session_id).await?;
        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(SessionCommand::Reset { reply: tx })
            .await
            .map_err(|_| AgentError::SessionNotFound(session_id.to_string()))?;
        rx.await.map_err(|_| {
            AgentError::SessionRejected("scheduler stopped before acknowledging".to_string())
        })?
    }

    pub fn list(&self) -> Result<Vec<SessionInfo>, AgentError> {
        self.store.list_sessions()
    }

    /// 停止调度，保留历史（之后 open 同一 id 可复活）
    pub async fn close(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        handle.cancel.cancel();
        tracing::info!(session = %session_id, "session closed");
        Ok(())
    }

    /// 不可逆删除：停调度并清除全部历史
    pub async fn delete(&self, session_id: &str) -> Result<(), AgentError> {
        if self.store.session_state(session_id)?.is_none() {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        if let Some(handle) = self.sessions.write().await.remove(session_id) {
            handle.cancel.cancel();
        }
        self.store.delete_session(session_id)?;
        tracing::info!(session = %session_id, "session deleted");
        Ok(())
    }

    /// 停掉全部调度器任务（进程收尾）
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// 系统提示词：人设 + 工具清单 + 指令语法说明
pub fn compose_system_prompt(
    persona: &str,
    tools: &ToolExecutor,
    continue_marker: &str,
) -> String {
    let mut prompt = String::from(persona);
    let descriptions = tools.tool_descriptions();
    if !descriptions.is_empty() {
        prompt.push_str("\n\nAvailable tools:\n");
        for (name, desc) in &descriptions {
            prompt.push_str(&format!("- {}: {}\n", name, desc));
        }
        prompt.push_str(
            "\nTo use a tool, reply with exactly one JSON object: \
             {\"tool\": \"<name>\", \"args\": {...}}. The result will come back as an observation.",
        );
    }
    if !continue_marker.is_empty() {
        prompt.push_str(&format!(
            "\n\nIf you want to keep thinking to yourself instead of addressing the user, \
             end your reply with {}.",
            continue_marker
        ));
    }
    prompt
}

/// 会话消息流：持久日志为事实来源，广播只当作「有新消息」的信号。
/// 游标按 seq 单调推进，回放/实时切换处既不会丢也不会重。
pub struct Subscription {
    store: Arc<MessageStore>,
    session_id: String,
    /// 下一条要交付的 seq
    next_seq: u64,
    rx: broadcast::Receiver<StoredMessage>,
    backlog: VecDeque<StoredMessage>,
    live_closed: bool,
}

impl Subscription {
    /// 下一条消息；会话被关闭且存量读尽后返回 None
    pub async fn next(&mut self) -> Option<StoredMessage> {
        loop {
            if let Some(m) = self.backlog.pop_front() {
                self.next_seq = m.seq + 1;
                return Some(m);
            }

            match self.store.read(&self.session_id, self.next_seq, None) {
                Ok(rows) if !rows.is_empty() => {
                    self.backlog.extend(rows);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session = %self.session_id, error = %e, "subscription read failed");
                    return None;
                }
            }

            if self.live_closed {
                return None;
            }
            match self.rx.recv().await {
                Ok(m) => {
                    if m.seq == self.next_seq {
                        self.backlog.push_back(m);
                    }
                    // m.seq < next_seq：回放时已交付过；
                    // m.seq > next_seq：中间有缺口，下一轮从存储补齐
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.live_closed = true;
                    continue;
                }
            }
        }
    }
}
