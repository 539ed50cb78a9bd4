//! iTip Pool CLI
//!
//! 回放日历变更日志、解析 iCalendar 文件、查看池配置

use anyhow::Result;
use clap::{Parser, Subcommand};
use itip_notify_pool::cli::{
    handle_config, handle_parse, handle_replay, ConfigArgs, ParseArgs, ReplayArgs,
};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "itip-pool")]
#[command(about = "iTip notification pool - 聚合日历变更通知并发送 iMIP 邮件")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 回放 JSONL 变更日志
    Replay(ReplayArgs),
    /// 解析 .ics 文件
    Parse(ParseArgs),
    /// 打印生效的配置
    Config(ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug itip-pool replay changes.jsonl
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("itip_notify_pool=info,itip_pool=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay(args) => {
            debug!(input = %args.input.display(), "Replay requested");
            handle_replay(args).await?;
        }
        Commands::Parse(args) => {
            handle_parse(args)?;
        }
        Commands::Config(args) => {
            handle_config(args)?;
        }
    }

    Ok(())
}
