//! 单连接处理
//!
//! 读循环按行成帧（BufReader 缓冲到整行，天然容忍半包）；坏行回一条结构化
//! 协议错误后继续读，绝不因可恢复错误断开。所有出站记录走同一条 mpsc 汇入
//! 写任务，广播消息与指令应答不会在行中间交错。

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, SessionManager};
use crate::server::commands::{parse_directive, Directive, HELP_TEXT};
use crate::server::protocol::{ClientRecord, ServerRecord};

struct Connection {
    id: String,
    manager: Arc<SessionManager>,
    out_tx: mpsc::Sender<ServerRecord>,
    /// 当前关联的会话（/attach 前为空）
    session_id: Option<String>,
    /// 订阅转发任务（每连接至多一个）
    sub_task: Option<JoinHandle<()>>,
}

/// 服务一条物理连接直到对端断开 / Close / 服务端停机
pub(crate) async fn serve(
    stream: UnixStream,
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(64);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut conn = Connection {
        id: uuid::Uuid::new_v4().to_string(),
        manager,
        out_tx,
        session_id: None,
        sub_task: None,
    };
    tracing::info!(connection = %conn.id, "client connected");

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if conn.handle_line(&line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(connection = %conn.id, error = %e, "read failed");
                    break;
                }
            },
        }
    }

    if let Some(task) = conn.sub_task.take() {
        task.abort();
    }
    let conn_id = conn.id.clone();
    drop(conn); // out_tx 释放后写任务排空退出
    let _ = writer_task.await;
    tracing::info!(connection = %conn_id, "client disconnected");
}

async fn write_loop(mut writer: OwnedWriteHalf, mut out_rx: mpsc::Receiver<ServerRecord>) {
    while let Some(record) = out_rx.recv().await {
        let mut line = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound record");
                continue;
            }
        };
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

impl Connection {
    /// 处理一行；返回 true 表示连接应当结束
    async fn handle_line(&mut self, line: &str) -> bool {
        match serde_json::from_str::<ClientRecord>(line) {
            Err(e) => {
                self.send(ServerRecord::error(&AgentError::Protocol(e.to_string())))
                    .await;
                false
            }
            Ok(ClientRecord::Close) => true,
            Ok(ClientRecord::Ping { timestamp }) => {
                self.send(ServerRecord::Pong { timestamp }).await;
                false
            }
            Ok(ClientRecord::Chat { content }) => {
                self.handle_chat(&content).await;
                false
            }
        }
    }

    async fn send(&self, record: ServerRecord) {
        let _ = self.out_tx.send(record).await;
    }

    async fn handle_chat(&mut self, content: &str) {
        match parse_directive(content) {
            Some(Ok(directive)) => self.run_directive(directive).await,
            Some(Err(e)) => self.send(ServerRecord::error(&e)).await,
            None => self.submit_chat(content).await,
        }
    }

    async fn submit_chat(&self, content: &str) {
        let Some(session_id) = self.session_id.as_deref() else {
            self.send(ServerRecord::error(&AgentError::SessionRejected(
                "no session attached; send /attach first".to_string(),
            )))
            .await;
            return;
        };
        match self.manager.submit(session_id, content).await {
            Ok(seq) => {
                self.send(ServerRecord::Accepted {
                    session_id: session_id.to_string(),
                    seq,
                })
                .await
            }
            Err(e) => self.send(ServerRecord::error(&e)).await,
        }
    }

    async fn run_directive(&mut self, directive: Directive) {
        match directive {
            Directive::Attach { session_id } => {
                match self.manager.open(session_id.as_deref()).await {
                    Ok(handle) => {
                        // 换会话时旧订阅一并丢弃
                        if let Some(task) = self.sub_task.take() {
                            task.abort();
                        }
                        self.session_id = Some(handle.id.clone());
                        self.send(ServerRecord::reply(
                            "attach",
                            serde_json::json!({
                                "session_id": handle.id,
                                "state": handle.state().as_str(),
                            }),
                        ))
                        .await;
                    }
                    Err(e) => self.send(ServerRecord::error(&e)).await,
                }
            }
            Directive::Subscribe { after_seq } => {
                let Some(session_id) = self.session_id.clone() else {
                    self.send(ServerRecord::error(&AgentError::SessionRejected(
                        "no session attached; send /attach first".to_string(),
                    )))
                    .await;
                    return;
                };
                match self.manager.subscribe(&session_id, after_seq).await {
                    Ok(mut subscription) => {
                        if let Some(task) = self.sub_task.take() {
                            task.abort();
                        }
                        self.send(ServerRecord::reply(
                            "subscribe",
                            serde_json::json!({
                                "session_id": session_id,
                                "after_seq": after_seq,
                            }),
                        ))
                        .await;
                        let out_tx = self.out_tx.clone();
                        self.sub_task = Some(tokio::spawn(async move {
                            while let Some(message) = subscription.next().await {
                                if out_tx.send(ServerRecord::Message { message }).await.is_err() {
                                    break;
                                }
                            }
                        }));
                    }
                    Err(e) => self.send(ServerRecord::error(&e)).await,
                }
            }
            Directive::Sessions => match self.manager.list() {
                Ok(sessions) => {
                    self.send(ServerRecord::reply(
                        "sessions",
                        serde_json::json!({ "sessions": sessions }),
                    ))
                    .await
                }
                Err(e) => self.send(ServerRecord::error(&e)).await,
            },
            Directive::Delete { session_id } => match self.manager.delete(&session_id).await {
                Ok(()) => {
                    if self.session_id.as_deref() == Some(session_id.as_str()) {
                        if let Some(task) = self.sub_task.take() {
                            task.abort();
                        }
                        self.session_id = None;
                    }
                    self.send(ServerRecord::reply(
                        "delete",
                        serde_json::json!({ "session_id": session_id }),
                    ))
                    .await;
                }
                Err(e) => self.send(ServerRecord::error(&e)).await,
            },
            Directive::Reset => {
                let Some(session_id) = self.session_id.clone() else {
                    self.send(ServerRecord::error(&AgentError::SessionRejected(
                        "no session attached; send /attach first".to_string(),
                    )))
                    .await;
                    return;
                };
                match self.manager.reset(&session_id).await {
                    Ok(()) => {
                        self.send(ServerRecord::reply(
                            "reset",
                            serde_json::json!({ "session_id": session_id }),
                        ))
                        .await
                    }
                    Err(e) => self.send(ServerRecord::error(&e)).await,
                }
            }
            Directive::Help => {
                self.send(ServerRecord::reply(
                    "help",
                    serde_json::json!({ "text": HELP_TEXT }),
                ))
                .await
            }
        }
    }
}
