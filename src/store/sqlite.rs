//! SQLite 持久化消息日志
//!
//! 会话与消息落在同一个库：sessions 表保存每个会话的当前调度状态名，messages 表是
//! 只追加的回合日志。append 在单个事务内分配 `max(seq)+1` 并提交后才返回
//! （WAL + synchronous=FULL），确认即落盘。单连接加互斥锁，同会话并发 append 在
//! 存储层自身就被串行化，不依赖上层的单写者约定。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::store::{Role, StoredMessage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    state      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    seq        INTEGER NOT NULL,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    action_seq INTEGER,

    PRIMARY KEY (session_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
";

/// 会话列表项（/sessions 指令的返回内容）
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: i64,
    pub state: String,
    pub message_count: u64,
}

/// 持久化消息日志：所有会话共享一个库文件，跨会话 append 可交错，同会话内严格有序
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    /// 打开（或创建）库文件并初始化表结构
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Store(format!("create data dir: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 内存库（测试用）
    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // 锁中毒只可能来自持锁线程 panic，此时连接本身仍可用
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 创建会话行；已存在时保持原状态不变
    pub fn create_session(&self, session_id: &str, initial_state: &str) -> Result<(), AgentError> {
        self.lock().execute(
            "INSERT OR IGNORE INTO sessions (id, created_at, state) VALUES (?1, ?2, ?3)",
            params![session_id, now(), initial_state],
        )?;
        Ok(())
    }

    /// 当前持久化的调度状态名；会话不存在时为 None
    pub fn session_state(&self, session_id: &str) -> Result<Option<String>, AgentError> {
        let state = self
            .lock()
            .query_row(
                "SELECT state FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    /// 持久化调度状态名（随历史一起在重启后恢复）
    pub fn set_session_state(&self, session_id: &str, state: &str) -> Result<(), AgentError> {
        let changed = self.lock().execute(
            "UPDATE sessions SET state = ?1 WHERE id = ?2",
            params![state, session_id],
        )?;
        if changed == 0 {
            return Err(AgentError::Store(format!(
                "session {} does not exist",
                session_id
            )));
        }
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>, AgentError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.created_at, s.state,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s ORDER BY s.created_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionInfo {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    state: row.get(2)?,
                    message_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 追加一条消息：事务内分配 seq = max(seq)+1，提交成功才返回。
    /// 会话行不存在（已删除）时拒绝写入。
    pub fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        action_seq: Option<u64>,
    ) -> Result<StoredMessage, AgentError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(AgentError::Store(format!(
                "append to unknown or deleted session {}",
                session_id
            )));
        }

        let seq: u64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let created_at = now();
        tx.execute(
            "INSERT INTO messages (session_id, seq, role, content, created_at, action_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, seq, role.as_str(), content, created_at, action_seq],
        )?;
        tx.commit()?;

        Ok(StoredMessage {
            session_id: session_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            created_at,
            action_seq,
        })
    }

    /// 按 seq 升序读取 [from_seq, to_seq] 区间；to_seq 为 None 时读到末尾
    pub fn read(
        &self,
        session_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<StoredMessage>, AgentError> {
        let conn = self.lock();
        // SQLite 整数是 i64，上界用 i64::MAX 表示「读到末尾」
        let to = to_seq.unwrap_or(i64::MAX as u64);
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, role, content, created_at, action_seq
             FROM messages
             WHERE session_id = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![session_id, from_seq, to], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 最近 limit 条消息（seq 升序），用于拼提示词窗口
    pub fn tail(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>, AgentError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, role, content, created_at, action_seq
             FROM (SELECT * FROM messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit as u64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 最新一条指定角色的消息（AwaitingTool 状态重启恢复时重解析指令用）
    pub fn last_generated(&self, session_id: &str) -> Result<Option<StoredMessage>, AgentError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT session_id, seq, role, content, created_at, action_seq
                 FROM messages
                 WHERE session_id = ?1 AND role IN ('assistant', 'inner_monologue')
                 ORDER BY seq DESC LIMIT 1",
                params![session_id],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// 不可逆地删除会话及其全部消息
    pub fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(2)?;
    let role = Role::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role: {}", role_str).into(),
        )
    })?;
    Ok(StoredMessage {
        session_id: row.get(0)?,
        seq: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
        action_seq: row.get(5)?,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        let s = MessageStore::open_in_memory().unwrap();
        s.create_session("s1", "awaiting_user").unwrap();
        s
    }

    #[test]
    fn append_assigns_dense_increasing_seq() {
        let store = store();
        for i in 1..=5u64 {
            let msg = store.append("s1", Role::User, &format!("m{}", i), None).unwrap();
            assert_eq!(msg.seq, i);
        }
        let all = store.read("s1", 1, None).unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn round_trip_preserves_content_role_seq() {
        let store = store();
        let written = store
            .append("s1", Role::Assistant, "你好 hello\n\tbytes", Some(1))
            .unwrap();
        let read = store.read("s1", written.seq, Some(written.seq)).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].content, "你好 hello\n\tbytes");
        assert_eq!(read[0].role, Role::Assistant);
        assert_eq!(read[0].seq, written.seq);
        assert_eq!(read[0].action_seq, Some(1));
    }

    #[test]
    fn sessions_do_not_interfere() {
        let store = store();
        store.create_session("s2", "awaiting_user").unwrap();
        store.append("s1", Role::User, "a", None).unwrap();
        store.append("s2", Role::User, "b", None).unwrap();
        store.append("s1", Role::User, "c", None).unwrap();
        assert_eq!(store.read("s1", 1, None).unwrap().len(), 2);
        let s2 = store.read("s2", 1, None).unwrap();
        assert_eq!(s2.len(), 1);
        assert_eq!(s2[0].seq, 1);
    }

    #[test]
    fn append_to_deleted_session_fails() {
        let store = store();
        store.append("s1", Role::User, "a", None).unwrap();
        store.delete_session("s1").unwrap();
        let err = store.append("s1", Role::User, "b", None).unwrap_err();
        assert_eq!(err.kind(), "store");
        assert!(store.read("s1", 1, None).unwrap().is_empty());
    }

    #[test]
    fn state_survives_reopen_on_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        {
            let store = MessageStore::open(&path).unwrap();
            store.create_session("s1", "awaiting_user").unwrap();
            store.append("s1", Role::User, "hello", None).unwrap();
            store.set_session_state("s1", "generating_assistant").unwrap();
        }
        let store = MessageStore::open(&path).unwrap();
        assert_eq!(
            store.session_state("s1").unwrap().as_deref(),
            Some("generating_assistant")
        );
        let history = store.read("s1", 1, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }

    #[test]
    fn tail_returns_last_n_in_order() {
        let store = store();
        for i in 1..=10u64 {
            store.append("s1", Role::User, &format!("m{}", i), None).unwrap();
        }
        let tail = store.tail("s1", 3).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }
}
