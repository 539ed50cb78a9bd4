//! Replay 命令 - 把 JSONL 变更日志回放进通知池
//!
//! 每行一条记录：
//! ```json
//! {"at_ms": 0, "kind": {"type": "update"}, "event": {...}, "actor": "alice@example.com"}
//! {"at_ms": 500, "kind": {"type": "delete"}, "ics": "BEGIN:VCALENDAR...", "urgent": true}
//! ```
//!
//! 默认使用虚拟时钟，回放瞬间完成；`--realtime` 时按记录时间真实等待。

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{load_config, print_output};
use crate::calendar::ical::parse_calendar;
use crate::calendar::{CalendarChange, ChangeObserver, EventSnapshot};
use crate::notification::change::ChangeKind;
use crate::notification::generator::{GeneratedMail, MailGeneratorFactory};
use crate::notification::observer::CalendarChangeHandler;
use crate::notification::scheduler::{ManualScheduler, Scheduler, TokioScheduler};
use crate::notification::sender::{build_notification_sender, MailSender, NotificationSender};
use crate::notification::senders::{
    LogMailSender, SendmailConfig, SendmailSender, SpoolMailSender,
};
use crate::notification::template::BuiltinTemplates;
use crate::resolver::DirectoryResolver;

/// Replay 命令参数
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSONL 变更日志
    pub input: PathBuf,

    /// 配置文件（默认 ~/.config/itip-notify/config.json）
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 参与者目录 JSON
    #[arg(long, short)]
    pub directory: Option<PathBuf>,

    /// 把邮件写入 JSONL 发件箱
    #[arg(long, conflicts_with = "sendmail")]
    pub spool: Option<PathBuf>,

    /// 通过 sendmail 兼容命令投递
    #[arg(long)]
    pub sendmail: Option<String>,

    /// 发件人地址（sendmail 模式）
    #[arg(long)]
    pub from: Option<String>,

    /// 禁用池化，每条通知立即发送
    #[arg(long)]
    pub no_pool: bool,

    /// 按记录时间真实等待
    #[arg(long)]
    pub realtime: bool,

    /// 最后一条记录后立即关闭（不等窗口到期）
    #[arg(long)]
    pub shutdown_early: bool,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// 一条回放记录
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRecord {
    /// 相对回放开始的毫秒数
    #[serde(default)]
    pub at_ms: u64,
    #[serde(default)]
    pub object_id: Option<String>,
    pub kind: ChangeKind,
    #[serde(default)]
    pub event: Option<EventSnapshot>,
    /// iCalendar 文本（没有 event 时使用）
    #[serde(default)]
    pub ics: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub urgent: bool,
}

impl ReplayRecord {
    /// 转换为日历变更
    pub fn into_change(self, base: DateTime<Utc>) -> Result<CalendarChange> {
        let event = match (self.event, self.ics) {
            (Some(event), _) => event,
            (None, Some(ics)) => parse_calendar(&ics)?.event,
            (None, None) => bail!("record has neither event nor ics"),
        };
        let object_id = self.object_id.unwrap_or_else(|| event.uid.clone());

        Ok(CalendarChange {
            object_id,
            kind: self.kind,
            event,
            actor: self.actor,
            urgent: self.urgent,
            timestamp: base + chrono::Duration::milliseconds(self.at_ms as i64),
        })
    }
}

/// 读取回放日志；无法解析的行记录警告后跳过
pub fn load_records(path: &Path) -> Result<(Vec<ReplayRecord>, usize)> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read replay log {}", path.display()))?;

    let mut records = Vec::new();
    let mut skipped = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ReplayRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed replay record");
                skipped += 1;
            }
        }
    }
    records.sort_by_key(|r| r.at_ms);
    Ok((records, skipped))
}

/// 回放结果
#[derive(Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub records: usize,
    pub skipped_records: usize,
    pub changes_applied: usize,
    pub pooled: bool,
    pub mails_sent: usize,
    pub send_failures: usize,
    pub flushed_on_close: usize,
}

impl ReplaySummary {
    fn count(&mut self, applied: bool) {
        if applied {
            self.changes_applied += 1;
        } else {
            self.skipped_records += 1;
        }
    }
}

/// 统计发送结果的包装器
struct CountingMailSender {
    inner: Arc<dyn MailSender>,
    sent: AtomicUsize,
    failed: AtomicUsize,
}

impl MailSender for CountingMailSender {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn send(&self, mail: &GeneratedMail) -> Result<()> {
        let result = self.inner.send(mail);
        match &result {
            Ok(()) => self.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

fn build_mail_sender(args: &ReplayArgs) -> Arc<dyn MailSender> {
    if let Some(path) = &args.spool {
        return Arc::new(SpoolMailSender::new(path));
    }
    if let Some(command) = &args.sendmail {
        let mut config = SendmailConfig {
            command: command.clone(),
            ..SendmailConfig::default()
        };
        if let Some(from) = &args.from {
            config.from = from.clone();
        }
        return Arc::new(SendmailSender::new(config));
    }
    Arc::new(LogMailSender::new())
}

/// 执行回放
pub async fn run_replay(args: &ReplayArgs) -> Result<ReplaySummary> {
    let mut config = load_config(args.config.as_deref())?;
    if args.no_pool {
        config.enabled = false;
    }

    let resolver = match &args.directory {
        Some(path) => DirectoryResolver::from_file(path)?,
        None => DirectoryResolver::new(),
    };
    let generator = Arc::new(MailGeneratorFactory::new(
        Arc::new(resolver),
        Arc::new(BuiltinTemplates::new()),
    ));
    let counting = Arc::new(CountingMailSender {
        inner: build_mail_sender(args),
        sent: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
    });

    let (records, skipped) = load_records(&args.input)?;
    let mut summary = ReplaySummary {
        records: records.len(),
        skipped_records: skipped,
        pooled: config.enabled,
        ..ReplaySummary::default()
    };
    info!(records = records.len(), pooled = config.enabled, realtime = args.realtime, "Starting replay");

    let base = Utc::now();
    let sender = if args.realtime {
        let scheduler = Arc::new(TokioScheduler::from_current());
        let sender = build_notification_sender(config, scheduler.clone(), generator, counting.clone());
        let handler = Arc::new(CalendarChangeHandler::new(sender.clone()));

        let start = tokio::time::Instant::now();
        for record in records {
            tokio::time::sleep_until(start + Duration::from_millis(record.at_ms)).await;
            // 直发模式下 on_change 会同步调用传输（sendmail 阻塞在子进程上）
            let worker = Arc::clone(&handler);
            let applied = tokio::task::spawn_blocking(move || apply(&worker, record, base))
                .await
                .context("Replay worker panicked")?;
            summary.count(applied);
        }
        if !args.shutdown_early {
            while scheduler.pending_timers() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        sender
    } else {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = build_notification_sender(config, scheduler.clone(), generator, counting.clone());
        let handler = CalendarChangeHandler::new(sender.clone());

        let start = scheduler.now();
        for record in records {
            let elapsed = scheduler.now().saturating_duration_since(start);
            let target = Duration::from_millis(record.at_ms);
            if target > elapsed {
                scheduler.advance(target - elapsed);
            }
            summary.count(apply(&handler, record, base));
        }
        if !args.shutdown_early {
            while let Some(due) = scheduler.next_due_in() {
                scheduler.advance(due);
            }
        }
        sender
    };

    let closing = sender.clone();
    if let Some(report) = tokio::task::spawn_blocking(move || close(&closing))
        .await
        .context("Shutdown worker panicked")?
    {
        summary.flushed_on_close = report;
    }
    summary.mails_sent = counting.sent.load(Ordering::Relaxed);
    summary.send_failures = counting.failed.load(Ordering::Relaxed);
    Ok(summary)
}

/// 应用一条记录；记录无法转换时返回 false
fn apply(handler: &CalendarChangeHandler, record: ReplayRecord, base: DateTime<Utc>) -> bool {
    let at_ms = record.at_ms;
    match record.into_change(base) {
        Ok(change) => {
            handler.on_change(&change);
            true
        }
        Err(e) => {
            warn!(at_ms, error = %e, "Skipping unusable replay record");
            false
        }
    }
}

fn close(sender: &Arc<dyn NotificationSender>) -> Option<usize> {
    let report = sender.close()?;
    for failure in report.failures() {
        warn!(kind = failure.kind(), error = %failure, "Flush failed during shutdown");
    }
    Some(report.flushed.iter().filter(|r| r.flushed).count())
}

/// 处理 replay 命令
pub async fn handle_replay(args: ReplayArgs) -> Result<()> {
    let summary = run_replay(&args).await?;
    if args.json {
        println!("{}", print_output(&summary)?);
    } else {
        println!(
            "records: {} (skipped {}), changes: {}, mails sent: {}, failures: {}, pooled: {}",
            summary.records,
            summary.skipped_records,
            summary.changes_applied,
            summary.mails_sent,
            summary.send_failures,
            summary.pooled
        );
    }
    Ok(())
}
