//! CLI command handling

pub mod config_cmd;
pub mod parse;
pub mod replay;

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::PoolConfig;

pub use config_cmd::{handle_config, ConfigArgs};
pub use parse::{handle_parse, ParseArgs};
pub use replay::{handle_replay, ReplayArgs};

/// 加载配置：指定文件时读文件，否则走默认路径；两种方式都应用环境变量并校验
pub fn load_config(path: Option<&Path>) -> Result<PoolConfig> {
    match path {
        Some(path) => {
            let mut config = PoolConfig::from_file(path)?;
            config.apply_env(|name| std::env::var(name).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => PoolConfig::auto_load(),
    }
}

/// Format output as pretty JSON
pub fn print_output<T: Serialize>(data: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(data)?)
}
