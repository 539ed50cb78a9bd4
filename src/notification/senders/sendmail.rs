//! sendmail 传输 - 组装 RFC 5322 多段邮件并通过 sendmail 兼容命令投递
//!
//! 邮件结构：
//! ```text
//! multipart/alternative
//! ├── text/plain               (模板渲染的正文)
//! └── text/calendar; method=X  (iTip 数据)
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mail_builder::headers::content_type::ContentType;
use mail_builder::headers::date::Date;
use mail_builder::headers::HeaderType;
use mail_builder::mime::{BodyPart, MimePart};
use mail_builder::MessageBuilder;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::notification::generator::GeneratedMail;
use crate::notification::sender::MailSender;

/// 默认投递命令
pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

/// sendmail 发送器配置
#[derive(Debug, Clone)]
pub struct SendmailConfig {
    /// 命令路径
    pub command: String,
    /// 额外参数（默认 `-t -i`：从头部读取收件人，不把单独的 `.` 当作结束）
    pub args: Vec<String>,
    /// 发件人地址
    pub from: String,
}

impl Default for SendmailConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_SENDMAIL.to_string(),
            args: vec!["-t".to_string(), "-i".to_string()],
            from: "calendar-noreply@localhost".to_string(),
        }
    }
}

/// 通过 sendmail 兼容命令发送
pub struct SendmailSender {
    config: SendmailConfig,
}

impl SendmailSender {
    pub fn new(config: SendmailConfig) -> Self {
        Self { config }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.config.from = from.into();
        self
    }
}

impl Default for SendmailSender {
    fn default() -> Self {
        Self::new(SendmailConfig::default())
    }
}

impl MailSender for SendmailSender {
    fn name(&self) -> &str {
        "sendmail"
    }

    fn send(&self, mail: &GeneratedMail) -> Result<()> {
        let message = compose_message(&self.config.from, mail, Utc::now())?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.config.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.config.command, output.status, stderr.trim());
        }

        info!(sender = "sendmail", to = %mail.to, method = %mail.method, "Mail handed to sendmail");
        Ok(())
    }
}

/// 组装完整邮件
///
/// 头部值中的换行会被替换成空格，日历数据里的多行 SUMMARY 不会变成额外的头部。
pub fn compose_message(from: &str, mail: &GeneratedMail, date: DateTime<Utc>) -> Result<String> {
    let message_id = format!(
        "<{}.{}.{}@itip-notify>",
        sanitize(&mail.object_id),
        mail.references.first().map(|id| id.0).unwrap_or(0),
        date.timestamp_millis()
    );
    let to_name = single_line(&mail.to_name);
    let subject = single_line(&mail.subject);

    let builder = MessageBuilder::new()
        .from(from)
        .header("Auto-Submitted", HeaderType::Text("auto-generated".into()))
        .message_id(message_id)
        .date(Date::new(date.timestamp()))
        .subject(subject.as_str());
    let builder = if to_name.is_empty() || to_name == mail.to {
        builder.to(mail.to.as_str())
    } else {
        builder.to((to_name.as_str(), mail.to.as_str()))
    };

    let bytes = builder
        .body(MimePart::new(
            ContentType::new("multipart/alternative"),
            BodyPart::Multipart(vec![
                MimePart::new(
                    ContentType::new("text/plain").attribute("charset", "utf-8"),
                    BodyPart::Text(mail.body.as_str().into()),
                ),
                MimePart::new(
                    ContentType::new("text/calendar")
                        .attribute("method", mail.method.as_str())
                        .attribute("charset", "utf-8"),
                    BodyPart::Text(mail.calendar.as_str().into()),
                ),
            ]),
        ))
        .write_to_vec()
        .context("Failed to write MIME message")?;

    let message = String::from_utf8(bytes).context("MIME message is not valid UTF-8")?;
    debug!(to = %mail.to, bytes = message.len(), "Composed message");
    Ok(message)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// 控制字符（含 CR/LF）替换为空格
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ItipMethod;
    use crate::notification::change::{NotificationId, PriorityClass};
    use chrono::TimeZone;

    fn mail(subject: &str, method: ItipMethod) -> GeneratedMail {
        GeneratedMail {
            to: "bob@example.com".to_string(),
            to_name: "Bob".to_string(),
            subject: subject.to_string(),
            body: "Hello Bob,\n\nsee you there.".to_string(),
            method,
            calendar: "BEGIN:VCALENDAR\r\nMETHOD:CANCEL\r\nEND:VCALENDAR\r\n".to_string(),
            object_id: "evt@host".to_string(),
            references: vec![NotificationId(3)],
            priority: PriorityClass::Priority,
        }
    }

    fn headers(message: &str) -> Vec<&str> {
        message
            .split("\r\n\r\n")
            .next()
            .unwrap_or_default()
            .split("\r\n")
            .collect()
    }

    #[test]
    fn test_compose_multipart_message() {
        let date = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let message = compose_message(
            "cal@example.com",
            &mail("Cancelled: Review", ItipMethod::Cancel),
            date,
        )
        .unwrap();

        let headers = headers(&message);
        assert!(headers.iter().any(|h| h.starts_with("To: ") && h.contains("<bob@example.com>")));
        assert!(headers.contains(&"Subject: Cancelled: Review"));
        assert!(headers
            .iter()
            .any(|h| h.to_ascii_lowercase().starts_with("message-id:") && h.contains("evt_host.3.")));
        assert!(message.contains("text/calendar"));
        assert!(message.contains("method=CANCEL") || message.contains("method=\"CANCEL\""));
        assert!(message.contains("multipart/alternative"));
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        let date = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let message = compose_message(
            "cal@example.com",
            &mail("Termin geändert: Übersicht", ItipMethod::Request),
            date,
        )
        .unwrap();

        let subject = headers(&message)
            .into_iter()
            .find(|h| h.starts_with("Subject:"))
            .unwrap();
        assert!(subject.is_ascii());
        assert!(subject.contains("=?"));
    }

    #[test]
    fn test_newline_in_subject_cannot_inject_headers() {
        let date = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let mut injected = mail("Cancelled: Lunch\nBcc: attacker@evil.example", ItipMethod::Cancel);
        injected.to_name = "Bob\r\nCc: other@evil.example".to_string();

        let message = compose_message("cal@example.com", &injected, date).unwrap();
        let headers = headers(&message);
        assert!(!headers.iter().any(|h| h.to_ascii_lowercase().starts_with("bcc:")));
        assert!(!headers.iter().any(|h| h.to_ascii_lowercase().starts_with("cc:")));
        assert_eq!(single_line("Lunch\nBcc: x"), "Lunch Bcc: x");
    }

    #[test]
    fn test_failing_command_is_transport_error() {
        let sender = SendmailSender::new(SendmailConfig {
            command: "/nonexistent/sendmail".to_string(),
            args: Vec::new(),
            from: "cal@example.com".to_string(),
        });
        assert!(sender.send(&mail("Hi", ItipMethod::Request)).is_err());
    }
}
