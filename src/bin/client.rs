//! 本地套接字行模式客户端（联调用）
//!
//! stdin 每行作为一次聊天提交（/ 前缀为指令），套接字返回的记录逐条打印。
//! 用法：ezra-client [socket_path]

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use ezra::server::{ClientRecord, ServerRecord};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/ezra.sock".to_string());
    let stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("connect {}", path))?;
    let (reader, mut writer) = stream.into_split();

    let printer = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<ServerRecord>(&line) {
                Ok(ServerRecord::Message { message }) => {
                    println!("<{}> {}", message.role, message.content)
                }
                Ok(ServerRecord::Accepted { seq, .. }) => println!("[accepted #{}]", seq),
                Ok(ServerRecord::CommandReply { command, detail }) => {
                    println!("[{}] {}", command, detail)
                }
                Ok(ServerRecord::Error { kind, message }) => {
                    eprintln!("[error:{}] {}", kind, message)
                }
                Ok(ServerRecord::Pong { .. }) => println!("[pong]"),
                Err(_) => println!("{}", line),
            }
        }
    });

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = input.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::to_string(&ClientRecord::Chat { content: line })?;
        writer.write_all(record.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    // stdin EOF：通知服务端正常收尾
    let close = serde_json::to_string(&ClientRecord::Close)?;
    writer.write_all(close.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    printer.abort();
    Ok(())
}
