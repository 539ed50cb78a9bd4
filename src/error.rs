//! 通知错误分类
//!
//! 对应四类失败：参与者解析、邮件生成、发送、定时调度。
//! 除调度错误外，其余都在单个收件人/单封邮件范围内恢复，不会中断整批 flush。

use thiserror::Error;

/// 通知管线错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    /// 收件人无法解析（用户已删除、匿名、目录查询失败）
    #[error("recipient {recipient} could not be resolved: {reason}")]
    Resolution { recipient: String, reason: String },

    /// 模板渲染失败或 iCalendar 输入格式错误
    #[error("failed to generate mail for {recipient}: {reason}")]
    Generation { recipient: String, reason: String },

    /// 邮件发送失败
    #[error("transport {sender} failed for {recipient}: {reason}")]
    Transport {
        sender: String,
        recipient: String,
        reason: String,
    },

    /// 定时器服务不可用
    #[error("timer service unavailable: {0}")]
    Scheduling(String),
}

impl NotifyError {
    /// 错误类别（用于日志字段）
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyError::Resolution { .. } => "resolution",
            NotifyError::Generation { .. } => "generation",
            NotifyError::Transport { .. } => "transport",
            NotifyError::Scheduling(_) => "scheduling",
        }
    }
}
