//! Hive - 命令行入口
//!
//! - `hive run <任务描述>`：创建执行并在前台跟踪进度，needs_input 时从标准输入读取回答
//! - `hive tools`：打印已注册工具的定义
//! - `hive recover`：恢复存储中未完成的执行（需持久化存储后端）

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use hive::config::load_config_or_default;
use hive::core::{build_from_config, build_tool_registry, ShutdownManager};
use hive::{ExecutionRecord, ExecutionStatus, Orchestrator, Task};

#[derive(Debug, Parser)]
#[command(name = "hive", about = "Hive task execution orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a task until it completes, fails or is cancelled
    Run(RunArgs),
    /// List registered tools with their parameter schemas
    Tools(CommonArgs),
    /// Resume unfinished executions from the configured store
    Recover(CommonArgs),
}

#[derive(Debug, Args, Clone)]
struct CommonArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    max_iterations: Option<usize>,
    #[arg(long, default_value = "cli")]
    owner: String,
    #[arg(value_name = "TASK", required = true)]
    description: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_task(args).await,
        Command::Tools(args) => list_tools(args),
        Command::Recover(args) => recover(args).await,
    }
}

fn init_logging(verbose: bool) {
    hive::observability::init_with_default(if verbose { "debug" } else { "info" });
}

async fn run_task(args: RunArgs) -> anyhow::Result<()> {
    init_logging(args.common.verbose);
    let cfg = load_config_or_default(args.common.config.clone());
    let orchestrator = build_from_config(&cfg)
        .await
        .context("Failed to build orchestrator")?;
    spawn_progress_logger(&orchestrator);

    let mut task = Task::new(args.owner, args.description.join(" "));
    if let Some(n) = args.max_iterations {
        task = task.with_max_iterations(n);
    }
    let id = orchestrator.start(task).await.context("Failed to start execution")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    shutdown.cancel_on_shutdown(orchestrator.clone(), id.clone());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let record = loop {
        let record = orchestrator.wait(&id).await?;
        if record.status != ExecutionStatus::NeedsInput || shutdown.is_shutdown() {
            break record;
        }

        println!(
            "\n[needs input] {}",
            record.pending_question.as_deref().unwrap_or("")
        );
        let answer = tokio::select! {
            line = stdin.next_line() => line.context("Failed to read stdin")?,
            _ = shutdown.wait_for_shutdown() => None,
        };
        match answer {
            Some(answer) => orchestrator.resume_with_input(&id, answer.trim()).await?,
            // EOF 或 Ctrl+C：取消并取回终态
            None => {
                orchestrator.cancel(&id).await?;
                break orchestrator.get_status(&id).await?;
            }
        }
    };

    print_record(&record)
}

fn list_tools(args: CommonArgs) -> anyhow::Result<()> {
    init_logging(args.verbose);
    let cfg = load_config_or_default(args.config);
    let registry = build_tool_registry(&cfg).context("Failed to build tool registry")?;
    println!("{}", registry.to_schema_json());
    Ok(())
}

async fn recover(args: CommonArgs) -> anyhow::Result<()> {
    init_logging(args.verbose);
    let cfg = load_config_or_default(args.config);
    let orchestrator = build_from_config(&cfg)
        .await
        .context("Failed to build orchestrator")?;
    spawn_progress_logger(&orchestrator);
    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    shutdown.drain_on_shutdown(orchestrator.clone());

    let recovered = orchestrator
        .recover_all()
        .await
        .context("Failed to recover executions")?;
    if recovered.is_empty() {
        println!("No unfinished executions.");
        return Ok(());
    }
    for id in recovered {
        let record = orchestrator.wait(&id).await?;
        print_record(&record)?;
    }
    Ok(())
}

fn spawn_progress_logger(orchestrator: &Orchestrator) {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::info!(
                    execution_id = %event.execution_id,
                    iteration = ?event.iteration,
                    status = %event.status,
                    phase = event.phase_title.as_deref().unwrap_or("-"),
                    tool = event.last_tool_name.as_deref().unwrap_or("-"),
                    outcome = event.last_outcome_kind.as_deref().unwrap_or("-"),
                    "progress"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_record(record: &ExecutionRecord) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(record).context("Failed to serialize record")?;
    println!("{}", json);
    Ok(())
}
