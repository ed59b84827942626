//! 套接字端到端集成测试
//!
//! 真实 unix socket 上走完整链路：attach / subscribe / 聊天 / 指令 / 错误恢复。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use ezra::core::{compose_system_prompt, SchedulerConfig, SessionManager};
use ezra::llm::MockLlmClient;
use ezra::server::{ClientRecord, EzraServer, ServerRecord};
use ezra::store::{MessageStore, Role, StoredMessage};
use ezra::tools::{EchoTool, ToolExecutor, ToolRegistry};

struct TestServer {
    _dir: tempfile::TempDir,
    socket: PathBuf,
}

async fn start_server(llm: MockLlmClient) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MessageStore::open(dir.path().join("test.db")).unwrap());
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let tools = Arc::new(ToolExecutor::new(registry, 5));
    let cfg = SchedulerConfig {
        system_prompt: compose_system_prompt("test persona", &tools, "[[continue]]"),
        ..Default::default()
    };
    let manager = Arc::new(SessionManager::new(store, Arc::new(llm), tools, cfg));

    let socket = dir.path().join("test.sock");
    let server = EzraServer::new(manager, socket.clone());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });

    for _ in 0..500 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket.exists(), "server did not come up");
    TestServer { _dir: dir, socket }
}

struct TestClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r).lines(),
            writer: w,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn chat(&mut self, content: &str) {
        let record = serde_json::to_string(&ClientRecord::Chat {
            content: content.to_string(),
        })
        .unwrap();
        self.send_raw(&record).await;
    }

    async fn recv(&mut self) -> ServerRecord {
        let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await
            .expect("timed out waiting for record")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn attach(&mut self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => self.chat(&format!("/attach {}", id)).await,
            None => self.chat("/attach").await,
        }
        match self.recv().await {
            ServerRecord::CommandReply { command, detail } if command == "attach" => {
                detail["session_id"].as_str().unwrap().to_string()
            }
            other => panic!("expected attach reply, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, after_seq: u64) {
        self.chat(&format!("/subscribe {}", after_seq)).await;
        match self.recv().await {
            ServerRecord::CommandReply { command, .. } if command == "subscribe" => {}
            other => panic!("expected subscribe reply, got {:?}", other),
        }
    }

    /// 收齐 n 条 Message（中途夹杂的 Accepted 记回执，其他记录算失败）
    async fn collect_messages(&mut self, n: usize) -> (Vec<StoredMessage>, Vec<u64>) {
        let mut messages = Vec::new();
        let mut accepted = Vec::new();
        while messages.len() < n {
            match self.recv().await {
                ServerRecord::Message { message } => messages.push(message),
                ServerRecord::Accepted { seq, .. } => accepted.push(seq),
                other => panic!("unexpected record: {:?}", other),
            }
        }
        (messages, accepted)
    }
}

#[tokio::test]
async fn end_to_end_plain_turn() {
    let server = start_server(MockLlmClient::with_script([Ok("hi there".to_string())])).await;
    let mut client = TestClient::connect(&server.socket).await;

    let session_id = client.attach(None).await;
    client.subscribe(0).await;
    client.chat("hello").await;

    let (messages, mut accepted) = client.collect_messages(2).await;
    // 受理回执与广播来自不同任务，可能晚于消息到达
    if accepted.is_empty() {
        match client.recv().await {
            ServerRecord::Accepted { seq, .. } => accepted.push(seq),
            other => panic!("expected accepted, got {:?}", other),
        }
    }
    assert_eq!(accepted, vec![1]);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[0].seq, 1);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "hi there");
    assert_eq!(messages[1].seq, 2);
    assert!(messages.iter().all(|m| m.session_id == session_id));
}

#[tokio::test]
async fn recoverable_errors_keep_the_connection_open() {
    let server = start_server(MockLlmClient::new()).await;
    let mut client = TestClient::connect(&server.socket).await;

    client.send_raw("this is not json").await;
    match client.recv().await {
        ServerRecord::Error { kind, .. } => assert_eq!(kind, "protocol"),
        other => panic!("expected protocol error, got {:?}", other),
    }

    client.chat("/frobnicate now").await;
    match client.recv().await {
        ServerRecord::Error { kind, .. } => assert_eq!(kind, "unknown_command"),
        other => panic!("expected unknown_command, got {:?}", other),
    }

    // 未 attach 的聊天被拒绝，但连接还活着
    client.chat("anyone there?").await;
    match client.recv().await {
        ServerRecord::Error { kind, .. } => assert_eq!(kind, "session_rejected"),
        other => panic!("expected session_rejected, got {:?}", other),
    }

    let ping = serde_json::to_string(&ClientRecord::Ping { timestamp: 7 }).unwrap();
    client.send_raw(&ping).await;
    match client.recv().await {
        ServerRecord::Pong { timestamp } => assert_eq!(timestamp, 7),
        other => panic!("expected pong, got {:?}", other),
    }
}

#[tokio::test]
async fn observer_connection_sees_the_same_stream() {
    let server = start_server(MockLlmClient::with_script([Ok("observed".to_string())])).await;

    let mut driver = TestClient::connect(&server.socket).await;
    let session_id = driver.attach(None).await;
    driver.subscribe(0).await;

    let mut observer = TestClient::connect(&server.socket).await;
    let attached = observer.attach(Some(&session_id)).await;
    assert_eq!(attached, session_id);
    observer.subscribe(0).await;

    driver.chat("watch this").await;

    let (driver_msgs, _) = driver.collect_messages(2).await;
    let (observer_msgs, accepted) = observer.collect_messages(2).await;
    assert!(accepted.is_empty(), "observer never submitted");
    for msgs in [&driver_msgs, &observer_msgs] {
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].content, "observed");
    }
}

#[tokio::test]
async fn reconnect_resumes_from_cursor_without_loss_or_duplication() {
    let server = start_server(MockLlmClient::new()).await;

    let mut first = TestClient::connect(&server.socket).await;
    let session_id = first.attach(None).await;
    first.subscribe(0).await;
    first.chat("one").await;
    let (msgs, _) = first.collect_messages(2).await;
    let acked = msgs.last().unwrap().seq;
    drop(first); // 断线，会话不受影响

    let mut second = TestClient::connect(&server.socket).await;
    second.attach(Some(&session_id)).await;
    second.chat("two").await;
    match second.recv().await {
        ServerRecord::Accepted { seq, .. } => assert_eq!(seq, acked + 1),
        other => panic!("expected accepted, got {:?}", other),
    }
    second.subscribe(acked).await;
    let (missed, _) = second.collect_messages(2).await;
    assert_eq!(missed[0].seq, acked + 1);
    assert_eq!(missed[0].content, "two");
    assert_eq!(missed[1].seq, acked + 2);
    assert_eq!(missed[1].role, Role::Assistant);
}

#[tokio::test]
async fn sessions_listing_and_delete() {
    let server = start_server(MockLlmClient::new()).await;
    let mut client = TestClient::connect(&server.socket).await;

    let session_id = client.attach(None).await;

    client.chat("/sessions").await;
    match client.recv().await {
        ServerRecord::CommandReply { command, detail } => {
            assert_eq!(command, "sessions");
            let ids: Vec<&str> = detail["sessions"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| s["id"].as_str().unwrap())
                .collect();
            assert!(ids.contains(&session_id.as_str()));
        }
        other => panic!("expected sessions reply, got {:?}", other),
    }

    client.chat(&format!("/delete {}", session_id)).await;
    match client.recv().await {
        ServerRecord::CommandReply { command, .. } => assert_eq!(command, "delete"),
        other => panic!("expected delete reply, got {:?}", other),
    }

    // 删除后连接不再关联会话
    client.chat("still here?").await;
    match client.recv().await {
        ServerRecord::Error { kind, .. } => assert_eq!(kind, "session_rejected"),
        other => panic!("expected session_rejected, got {:?}", other),
    }
}
