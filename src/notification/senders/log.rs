//! 日志发送器 - 只把邮件写入 tracing 日志（回放和调试用）

use anyhow::Result;
use tracing::info;

use crate::notification::generator::GeneratedMail;
use crate::notification::sender::MailSender;

pub struct LogMailSender;

impl LogMailSender {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogMailSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MailSender for LogMailSender {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, mail: &GeneratedMail) -> Result<()> {
        info!(
            sender = "log",
            to = %mail.to,
            method = %mail.method,
            priority = %mail.priority,
            object_id = %mail.object_id,
            merged = mail.references.len(),
            subject = %mail.subject,
            "Mail"
        );
        Ok(())
    }
}
