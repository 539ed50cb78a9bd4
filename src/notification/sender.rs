//! 邮件发送 trait 与通知发送器
//!
//! - `MailSender`：把一封已生成的邮件交给传输层（无幂等键，至少一次）
//! - `NotificationSender`：日历层调用的 "立即通知" 接口
//!   - `DirectNotificationSender`：立即生成并发送
//!   - `PoolingNotificationSender`：提交到通知池，窗口到期后统一发送

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::change::ChangeNotification;
use super::generator::{GeneratedMail, MailGeneratorFactory};
use super::pool::{NotificationPool, ShutdownReport, SubmitOutcome};
use super::scheduler::Scheduler;
use crate::config::PoolConfig;
use crate::error::NotifyError;

/// 邮件传输 trait
pub trait MailSender: Send + Sync {
    /// 发送器名称（用于日志和错误报告）
    fn name(&self) -> &str;

    /// 发送一封邮件
    fn send(&self, mail: &GeneratedMail) -> Result<()>;
}

/// 通知发送器 trait
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &str;

    /// 通知一条变更；返回第一个失败（其余失败只记录日志）
    fn notify(&self, notification: ChangeNotification) -> Result<(), NotifyError>;

    /// 关闭并发送所有待发通知
    fn close(&self) -> Option<ShutdownReport> {
        None
    }
}

/// 立即发送
pub struct DirectNotificationSender {
    generator: Arc<MailGeneratorFactory>,
    sender: Arc<dyn MailSender>,
}

impl DirectNotificationSender {
    pub fn new(generator: Arc<MailGeneratorFactory>, sender: Arc<dyn MailSender>) -> Self {
        Self { generator, sender }
    }
}

impl NotificationSender for DirectNotificationSender {
    fn name(&self) -> &str {
        "direct"
    }

    fn notify(&self, notification: ChangeNotification) -> Result<(), NotifyError> {
        let outcome = self.generator.generate(&notification, &[]);
        let mut failures = outcome.failures;

        for mail in &outcome.mails {
            if let Err(e) = self.sender.send(mail) {
                failures.push(NotifyError::Transport {
                    sender: self.sender.name().to_string(),
                    recipient: mail.to.clone(),
                    reason: e.to_string(),
                });
            } else {
                debug!(to = %mail.to, method = %mail.method, "Mail sent");
            }
        }

        for failure in &failures {
            warn!(id = %notification.id(), kind = failure.kind(), error = %failure, "Notification failed");
        }
        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

/// 池化发送包装器
pub struct PoolingNotificationSender {
    pool: Arc<NotificationPool>,
}

impl PoolingNotificationSender {
    pub fn new(pool: Arc<NotificationPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<NotificationPool> {
        &self.pool
    }
}

impl NotificationSender for PoolingNotificationSender {
    fn name(&self) -> &str {
        "pooling"
    }

    fn notify(&self, notification: ChangeNotification) -> Result<(), NotifyError> {
        match self.pool.submit(notification) {
            SubmitOutcome::Delivered(report) => match report.failures.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(()),
            },
            SubmitOutcome::Queued { .. } | SubmitOutcome::Merged { .. } => Ok(()),
        }
    }

    fn close(&self) -> Option<ShutdownReport> {
        Some(self.pool.shutdown())
    }
}

/// 按配置选择发送器：启用池化时返回池化包装器，否则立即发送
pub fn build_notification_sender(
    config: PoolConfig,
    scheduler: Arc<dyn Scheduler>,
    generator: Arc<MailGeneratorFactory>,
    mail_sender: Arc<dyn MailSender>,
) -> Arc<dyn NotificationSender> {
    if config.enabled {
        let pool = NotificationPool::new(config, scheduler, generator, mail_sender);
        Arc::new(PoolingNotificationSender::new(pool))
    } else {
        Arc::new(DirectNotificationSender::new(generator, mail_sender))
    }
}
