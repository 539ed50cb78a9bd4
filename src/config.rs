//! 通知池配置
//!
//! 配置读取优先级：
//! 1. 配置文件 `~/.config/itip-notify/config.json`
//! 2. 环境变量覆盖（`ITIP_POOL_ENABLED`、`ITIP_DETAIL_INTERVAL_MS`、
//!    `ITIP_STATE_CHANGE_INTERVAL_MS`、`ITIP_PRIORITY_INTERVAL_MS`）

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::notification::change::PriorityClass;

/// 默认细节变更窗口（毫秒）
pub const DEFAULT_DETAIL_INTERVAL_MS: u64 = 120_000;

/// 默认参与状态变更窗口（毫秒）
pub const DEFAULT_STATE_CHANGE_INTERVAL_MS: u64 = 600_000;

/// 默认高优先级窗口（毫秒）
pub const DEFAULT_PRIORITY_INTERVAL_MS: u64 = 1_000;

/// 通知池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 是否启用池化（关闭时立即发送）
    pub enabled: bool,
    /// 普通字段变更的聚合窗口
    pub detail_interval_ms: u64,
    /// 参与状态变更的聚合窗口
    pub state_change_interval_ms: u64,
    /// 紧急变更（取消等）的聚合窗口，必须最短
    pub priority_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detail_interval_ms: DEFAULT_DETAIL_INTERVAL_MS,
            state_change_interval_ms: DEFAULT_STATE_CHANGE_INTERVAL_MS,
            priority_interval_ms: DEFAULT_PRIORITY_INTERVAL_MS,
        }
    }
}

impl PoolConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("itip-notify")
            .join("config.json")
    }

    /// 从配置文件和环境变量加载
    pub fn auto_load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件读取（缺失字段使用默认值）
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        let config: PoolConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded pool config");
        Ok(config)
    }

    /// 应用环境变量覆盖
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ITIP_POOL_ENABLED") {
            self.enabled = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    warn!(value = %other, "Ignoring invalid ITIP_POOL_ENABLED");
                    self.enabled
                }
            };
        }

        let parse_ms = |name: &str, v: String| -> Result<u64> {
            v.trim()
                .parse::<u64>()
                .map_err(|e| anyhow!("{} must be milliseconds: {}", name, e))
        };

        if let Some(v) = lookup("ITIP_DETAIL_INTERVAL_MS") {
            self.detail_interval_ms = parse_ms("ITIP_DETAIL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("ITIP_STATE_CHANGE_INTERVAL_MS") {
            self.state_change_interval_ms = parse_ms("ITIP_STATE_CHANGE_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("ITIP_PRIORITY_INTERVAL_MS") {
            self.priority_interval_ms = parse_ms("ITIP_PRIORITY_INTERVAL_MS", v)?;
        }
        Ok(())
    }

    /// 校验窗口：高优先级窗口必须严格最短，且都不能为 0
    pub fn validate(&self) -> Result<()> {
        if self.detail_interval_ms == 0
            || self.state_change_interval_ms == 0
            || self.priority_interval_ms == 0
        {
            return Err(anyhow!("notification intervals must be greater than zero"));
        }
        if self.priority_interval_ms >= self.detail_interval_ms
            || self.priority_interval_ms >= self.state_change_interval_ms
        {
            return Err(anyhow!(
                "priority interval ({}ms) must be shorter than detail ({}ms) and state-change ({}ms) intervals",
                self.priority_interval_ms,
                self.detail_interval_ms,
                self.state_change_interval_ms
            ));
        }
        Ok(())
    }

    /// 获取某个优先级对应的窗口时长
    pub fn window(&self, class: PriorityClass) -> Duration {
        let ms = match class {
            PriorityClass::Detail => self.detail_interval_ms,
            PriorityClass::StateChange => self.state_change_interval_ms,
            PriorityClass::Priority => self.priority_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// 设置三个窗口（测试和 CLI 使用）
    pub fn with_intervals(mut self, detail_ms: u64, state_change_ms: u64, priority_ms: u64) -> Self {
        self.detail_interval_ms = detail_ms;
        self.state_change_interval_ms = state_change_ms;
        self.priority_interval_ms = priority_ms;
        self
    }

    /// 设置是否启用池化
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.window(PriorityClass::Priority), Duration::from_secs(1));
    }

    #[test]
    fn test_priority_must_be_shortest() {
        let config = PoolConfig::default().with_intervals(1000, 5000, 1000);
        assert!(config.validate().is_err());

        let config = PoolConfig::default().with_intervals(5000, 500, 1000);
        assert!(config.validate().is_err());

        // 细节窗口和状态窗口之间不要求顺序
        let config = PoolConfig::default().with_intervals(5000, 2000, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = PoolConfig::default().with_intervals(0, 5000, 100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ITIP_POOL_ENABLED", "false"),
            ("ITIP_DETAIL_INTERVAL_MS", "30000"),
            ("ITIP_PRIORITY_INTERVAL_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = PoolConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.detail_interval_ms, 30000);
        assert_eq!(config.state_change_interval_ms, DEFAULT_STATE_CHANGE_INTERVAL_MS);
        assert_eq!(config.priority_interval_ms, 250);
    }

    #[test]
    fn test_env_invalid_number_is_error() {
        let mut config = PoolConfig::default();
        let result = config.apply_env(|name| {
            (name == "ITIP_DETAIL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"priority_interval_ms": 500}"#).unwrap();

        let config = PoolConfig::from_file(&path).unwrap();
        assert_eq!(config.priority_interval_ms, 500);
        assert_eq!(config.detail_interval_ms, DEFAULT_DETAIL_INTERVAL_MS);
        assert!(config.enabled);
    }
}
