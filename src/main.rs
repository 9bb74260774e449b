//! toolrun CLI
//!
//! 入口：初始化日志、按配置装配运行时，跑一次多轮循环；审批请求在终端交互处理（y/n + 可选原因）。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use toolrun::agent::process_message_stream;
use toolrun::config::load_config;
use toolrun::react::StopReason;
use toolrun::{create_agent_components, observability, AgentComponents, TurnMessage, TurnMessageType};

/// Run an agent turn loop with human-approved command execution.
#[derive(Parser, Debug)]
#[command(name = "toolrun")]
#[command(version)]
struct Cli {
    /// Extra TOML config layered over config/default.toml.
    #[arg(long, env = "TOOLRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Session id; a random one is generated when absent.
    #[arg(long)]
    session: Option<String>,

    /// The request for the agent.
    #[arg(required = true, trailing_var_arg = true)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    let components = Arc::new(create_agent_components(&cfg));
    let session_id = cli
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let prompt = cli.prompt.join(" ");

    // Ctrl-C：取消所有会话，同时中断正在等待的终端输入
    let shutdown = CancellationToken::new();
    {
        let components = Arc::clone(&components);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
                components.supervisor.cancel_all();
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = {
        let components = Arc::clone(&components);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let mut ctx = components.new_context();
            process_message_stream(&components, &session_id, &mut ctx, &prompt, tx).await
        })
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut mid_stream = false;
    while let Some(msg) = rx.recv().await {
        mid_stream = render(&msg, mid_stream);
        if msg.kind() == TurnMessageType::CommandApprovalRequest {
            prompt_approval(&components, &session_id, &mut stdin, &shutdown).await?;
        }
    }

    let outcome = runner.await.context("Conversation task failed")?;
    if mid_stream {
        println!();
    }
    match outcome.stop_reason {
        StopReason::Responded | StopReason::NoToolCall => {}
        other => eprintln!("[stopped: {:?} after {} turn(s)]", other, outcome.turns),
    }
    Ok(())
}

/// 打印一条消息；返回是否停在流式输出的行中
fn render(msg: &TurnMessage, mid_stream: bool) -> bool {
    if msg.is_stream_chunk() {
        print!("{}", msg.content());
        let _ = std::io::stdout().flush();
        return true;
    }
    if mid_stream {
        println!();
    }
    match msg.kind() {
        TurnMessageType::Response => println!("{}", msg.content()),
        TurnMessageType::TerminalCommand => println!("$ {}", msg.content()),
        TurnMessageType::TerminalOutput => println!("{}", msg.content().trim_end()),
        TurnMessageType::CommandApprovalRequest => {
            let risk = msg
                .meta("risk_level")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            println!("[approval required, risk: {}] {}", risk, msg.content());
        }
        TurnMessageType::Error => {
            println!("[error] {}", msg.content());
            if let Some(s) = msg.meta("suggestion").and_then(|v| v.as_str()) {
                println!("[suggestion] {}", s);
            }
        }
        other => println!("[{}] {}", other.as_str(), msg.content()),
    }
    false
}

/// 读一行输入；shutdown 触发时返回 None
async fn read_line<R>(input: &mut Lines<R>, shutdown: &CancellationToken) -> anyhow::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(None),
        line = input.next_line() => Ok(Some(line?.unwrap_or_default())),
    }
}

async fn prompt_approval(
    components: &AgentComponents,
    session_id: &str,
    stdin: &mut Lines<BufReader<Stdin>>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    print!("Approve this command? [y/N]: ");
    std::io::stdout().flush()?;
    let Some(answer) = read_line(stdin, shutdown).await? else {
        println!();
        return Ok(());
    };
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());

    let result = if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        components
            .commands
            .resolve_approval(session_id, true, &user, None)
            .await
    } else {
        print!("Reason (optional): ");
        std::io::stdout().flush()?;
        let Some(reason) = read_line(stdin, shutdown).await? else {
            println!();
            return Ok(());
        };
        let reason = Some(reason.trim().to_string()).filter(|r| !r.is_empty());
        components
            .commands
            .resolve_approval(session_id, false, &user, reason)
            .await
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to resolve approval");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_line_returns_on_shutdown_without_input() {
        // 写端保持打开但不写入：读取会一直挂起，直到 shutdown
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let line = tokio::time::timeout(Duration::from_secs(2), read_line(&mut lines, &shutdown))
            .await
            .expect("read_line should return once shutdown fires")
            .unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn test_read_line_reads_answer() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"y\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = read_line(&mut lines, &CancellationToken::new()).await.unwrap();
        assert_eq!(line.as_deref(), Some("y"));
    }
}
