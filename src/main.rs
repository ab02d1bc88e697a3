//! Hive - 多智能体编排核心
//!
//! 入口：初始化日志、创建编排器，逐行读取 stdin 作为会话 "cli" 的消息；
//! 回复写 stdout，生命周期事件以 JSON 行写 stderr。

use anyhow::Context;
use hive::core::create_orchestrator;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const SESSION_ID: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let orchestrator = create_orchestrator(config_path)
        .await
        .context("Failed to create orchestrator")?;

    // 事件打印
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("{}", event.to_json()),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event printer lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if matches!(line, "/quit" | "/exit") {
                    break;
                }
                let response = orchestrator.process_message(SESSION_ID, line).await;
                println!("[{}] {}", response.code, response.text);
            }
        }
    }

    orchestrator.shutdown().await;
    printer.abort();
    Ok(())
}
