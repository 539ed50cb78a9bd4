//! Config 命令 - 打印生效的池配置

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::{load_config, print_output};
use crate::config::PoolConfig;

/// Config 命令参数
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// 配置文件（默认 ~/.config/itip-notify/config.json）
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// 处理 config 命令
pub fn handle_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let path = args.config.unwrap_or_else(PoolConfig::default_path);
    eprintln!("config file: {}", path.display());
    println!("{}", print_output(&config)?);
    Ok(())
}
