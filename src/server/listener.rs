//! 本地套接字监听
//!
//! 单个 unix socket 上多路复用任意多条客户端连接，每条连接一个独立任务。
//! 启动时清掉上次异常退出留下的 socket 文件，停机时删除。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::core::SessionManager;
use crate::server::connection;

/// 服务端：接受连接并交给连接任务
pub struct EzraServer {
    manager: Arc<SessionManager>,
    socket_path: PathBuf,
    cancel: CancellationToken,
}

impl EzraServer {
    pub fn new(manager: Arc<SessionManager>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            socket_path: socket_path.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// 停机令牌（触发后停止接受新连接并结束既有连接任务）
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// 运行接受循环直到停机
    pub async fn run(&self) -> Result<(), String> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| format!("remove stale socket: {}", e))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("create socket dir: {}", e))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| format!("bind {}: {}", self.socket_path.display(), e))?;
        tracing::info!("Listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(connection::serve(
                            stream,
                            Arc::clone(&self.manager),
                            self.cancel.child_token(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("Listener stopped");
        Ok(())
    }
}
