//! 本地发件箱 - 将生成的邮件追加到 JSONL 文件（带文件锁）

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::notification::generator::GeneratedMail;
use crate::notification::sender::MailSender;

/// 发件箱记录（JSONL 格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    /// 写入时间
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub mail: GeneratedMail,
}

/// JSONL 发件箱
pub struct SpoolMailSender {
    path: PathBuf,
}

impl SpoolMailSender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认路径 `~/.config/itip-notify/outbox.jsonl`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("itip-notify")
            .join("outbox.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条记录
    pub fn append(&self, record: &SpoolRecord) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open spool {}", self.path.display()))?;

        file.lock_exclusive()?;
        let line = serde_json::to_string(record)?;
        let written = writeln!(file, "{}", line);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// 读取全部记录（跳过无法解析的行）
    pub fn read_all(&self) -> Result<Vec<SpoolRecord>> {
        use fs2::FileExt;

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(&file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SpoolRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed spool line"),
            }
        }
        file.unlock()?;
        Ok(records)
    }
}

impl Default for SpoolMailSender {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl MailSender for SpoolMailSender {
    fn name(&self) -> &str {
        "spool"
    }

    fn send(&self, mail: &GeneratedMail) -> Result<()> {
        let record = SpoolRecord {
            ts: Utc::now(),
            mail: mail.clone(),
        };
        self.append(&record)?;
        debug!(
            sender = "spool",
            to = %mail.to,
            object_id = %mail.object_id,
            path = %self.path.display(),
            "Mail written to spool"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ItipMethod;
    use crate::notification::change::{NotificationId, PriorityClass};
    use tempfile::TempDir;

    fn mail(to: &str) -> GeneratedMail {
        GeneratedMail {
            to: to.to_string(),
            to_name: "Dev".to_string(),
            subject: "Appointment changed: Standup".to_string(),
            body: "Hello Dev".to_string(),
            method: ItipMethod::Request,
            calendar: "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_string(),
            object_id: "standup".to_string(),
            references: vec![NotificationId(7)],
            priority: PriorityClass::Detail,
        }
    }

    #[test]
    fn test_spool_appends_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolMailSender::new(dir.path().join("nested").join("outbox.jsonl"));

        spool.send(&mail("a@example.com")).unwrap();
        spool.send(&mail("b@example.com")).unwrap();

        let records = spool.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mail.to, "a@example.com");
        assert_eq!(records[1].mail.references, vec![NotificationId(7)]);
        assert_eq!(records[1].mail.method, ItipMethod::Request);
    }

    #[test]
    fn test_spool_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let spool = SpoolMailSender::new(&path);

        spool.send(&mail("a@example.com")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(spool.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_spool_reads_empty() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolMailSender::new(dir.path().join("none.jsonl"));
        assert!(spool.read_all().unwrap().is_empty());
    }
}
