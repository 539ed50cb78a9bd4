//! 邮件生成工厂
//!
//! 把合并后的变更通知转换成可以直接发送的邮件：
//! 1. 解析收件人（语言、时区、显示名）；解析不到的收件人直接跳过
//! 2. 根据收件人角色（组织者/参与者）和变更类型选择模板
//! 3. 渲染主题、正文以及 iTip 日历部分
//!
//! 本模块不做网络 I/O，参与者解析和模板渲染都委托给注入的协作者。

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::change::{ChangeKind, ChangeNotification, NotificationId, PriorityClass};
use super::template::{TemplateRenderer, TemplateVars, DEFAULT_LOCALE};
use crate::calendar::ical::write_itip;
use crate::calendar::{EventSnapshot, ItipMethod, ParticipationStatus};
use crate::error::NotifyError;

/// 已解析的参与者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: String,
    pub display_name: String,
    pub locale: String,
    /// 相对 UTC 的分钟偏移
    pub utc_offset_minutes: i32,
}

impl Participant {
    /// 外部参与者：只有地址，使用默认语言和 UTC
    pub fn external(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            display_name: address.clone(),
            address,
            locale: DEFAULT_LOCALE.to_string(),
            utc_offset_minutes: 0,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(offset) => offset,
            None => Utc.fix(),
        }
    }
}

/// 参与者解析服务
pub trait ParticipantResolver: Send + Sync {
    /// 解析收件人；`Ok(None)` 表示用户已删除、匿名或访客，不应收到邮件
    fn resolve(&self, address: &str) -> Result<Option<Participant>>;

    /// 显示名（解析失败时返回 None）
    fn display_name(&self, address: &str) -> Option<String> {
        self.resolve(address).ok().flatten().map(|p| p.display_name)
    }
}

/// 生成的邮件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMail {
    /// 收件人地址
    pub to: String,
    /// 收件人显示名
    pub to_name: String,
    pub subject: String,
    /// 纯文本正文
    pub body: String,
    /// iTip 方法
    pub method: ItipMethod,
    /// text/calendar 部分
    pub calendar: String,
    /// 日历对象 ID
    pub object_id: String,
    /// 来源通知
    pub references: Vec<NotificationId>,
    pub priority: PriorityClass,
}

/// 一次生成的结果
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub mails: Vec<GeneratedMail>,
    /// 被跳过的收件人（无法解析）
    pub skipped: Vec<String>,
    /// 生成失败（该邮件被丢弃）
    pub failures: Vec<NotifyError>,
}

impl GenerationOutcome {
    fn absorb(&mut self, other: GenerationOutcome) {
        self.mails.extend(other.mails);
        self.skipped.extend(other.skipped);
        self.failures.extend(other.failures);
    }
}

/// 邮件生成工厂
pub struct MailGeneratorFactory {
    resolver: Arc<dyn ParticipantResolver>,
    templates: Arc<dyn TemplateRenderer>,
}

impl MailGeneratorFactory {
    pub fn new(resolver: Arc<dyn ParticipantResolver>, templates: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            resolver,
            templates,
        }
    }

    /// 为同一批通知生成邮件；单个收件人失败不影响其它收件人
    pub fn generate_batch(&self, notifications: &[ChangeNotification]) -> GenerationOutcome {
        let mut outcome = GenerationOutcome::default();
        for notification in notifications {
            outcome.absorb(self.generate(notification, &[notification.id()]));
        }
        outcome
    }

    /// 为一条（可能已合并的）通知生成邮件
    ///
    /// `sources` 是被合并进这条通知的所有原始通知 ID。
    pub fn generate(
        &self,
        notification: &ChangeNotification,
        sources: &[NotificationId],
    ) -> GenerationOutcome {
        let mut outcome = GenerationOutcome::default();
        let recipient_address = notification.recipient();

        let recipient = match self.resolver.resolve(recipient_address) {
            Ok(Some(participant)) => participant,
            Ok(None) => {
                debug!(recipient = %recipient_address, "Recipient not deliverable, skipping");
                outcome.skipped.push(recipient_address.to_string());
                return outcome;
            }
            Err(e) => {
                let err = NotifyError::Resolution {
                    recipient: recipient_address.to_string(),
                    reason: e.to_string(),
                };
                warn!(recipient = %recipient_address, error = %err, "Recipient resolution failed, skipping");
                outcome.skipped.push(recipient_address.to_string());
                return outcome;
            }
        };

        match self.render(notification, &recipient, sources) {
            Ok(mail) => outcome.mails.push(mail),
            Err(e) => {
                let err = NotifyError::Generation {
                    recipient: recipient.address.clone(),
                    reason: e.to_string(),
                };
                warn!(recipient = %recipient.address, error = %err, "Mail generation failed, dropping mail");
                outcome.failures.push(err);
            }
        }
        outcome
    }

    fn render(
        &self,
        notification: &ChangeNotification,
        recipient: &Participant,
        sources: &[NotificationId],
    ) -> Result<GeneratedMail> {
        let event = notification.event();
        let is_organizer = event.is_organizer(&recipient.address);
        let role = if is_organizer { "organizer" } else { "attendee" };
        let template = format!("{}_{}", notification.kind().label(), role);

        let method = match notification.kind() {
            ChangeKind::Delete => ItipMethod::Cancel,
            ChangeKind::StateChange { .. } if is_organizer => ItipMethod::Reply,
            _ => ItipMethod::Request,
        };

        let vars = self.template_vars(notification, recipient)?;
        // 主题只能是一行，SUMMARY 中的换行会被展开成空格
        let subject = self
            .templates
            .render(&format!("{}.subject", template), &recipient.locale, &vars)?
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let body = self
            .templates
            .render(&format!("{}.body", template), &recipient.locale, &vars)?;

        let replying = match notification.kind() {
            ChangeKind::StateChange { attendee, .. } => Some(attendee.as_str()),
            _ => None,
        };
        let calendar = write_itip(method, event, replying, notification.timestamp());

        let mut references = sources.to_vec();
        if references.is_empty() {
            references.push(notification.id());
        }

        Ok(GeneratedMail {
            to: recipient.address.clone(),
            to_name: recipient.display_name.clone(),
            subject,
            body,
            method,
            calendar,
            object_id: notification.object_id().to_string(),
            references,
            priority: notification.priority(),
        })
    }

    fn template_vars(
        &self,
        notification: &ChangeNotification,
        recipient: &Participant,
    ) -> Result<TemplateVars> {
        let event = notification.event();
        let offset = recipient.offset();

        let organizer = self.name_of(&event.organizer.address, event.organizer.common_name.as_deref());
        let actor = notification
            .actor()
            .map(|a| self.name_of(a, common_name_in(event, a)))
            .unwrap_or_else(|| organizer.clone());

        let attendees = event
            .attendees
            .iter()
            .map(|a| self.name_of(&a.address, a.common_name.as_deref()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut vars = TemplateVars::new();
        vars.insert("summary".into(), event.summary.clone());
        vars.insert("recipient".into(), recipient.display_name.clone());
        vars.insert("organizer".into(), organizer);
        vars.insert("actor".into(), actor);
        vars.insert("attendees".into(), attendees);
        vars.insert("location".into(), event.location.clone().unwrap_or_else(|| "-".to_string()));
        vars.insert("start".into(), format_in(&event.start, offset));
        vars.insert(
            "end".into(),
            event
                .end
                .map(|end| format!(" - {}", format_in(&end, offset)))
                .unwrap_or_default(),
        );

        if let ChangeKind::StateChange { attendee, partstat } = notification.kind() {
            vars.insert("attendee".into(), self.name_of(attendee, common_name_in(event, attendee)));
            let label = self.templates.render(
                &format!("partstat.{}", partstat_key(*partstat)),
                &recipient.locale,
                &TemplateVars::new(),
            )?;
            vars.insert("partstat".into(), label);
        }
        Ok(vars)
    }

    /// 显示名优先级：目录 > iCalendar CN > 地址
    fn name_of(&self, address: &str, common_name: Option<&str>) -> String {
        self.resolver
            .display_name(address)
            .filter(|n| n != address)
            .or_else(|| common_name.map(str::to_string))
            .unwrap_or_else(|| address.to_string())
    }
}

fn common_name_in<'a>(event: &'a EventSnapshot, address: &str) -> Option<&'a str> {
    if event.is_organizer(address) {
        return event.organizer.common_name.as_deref();
    }
    event.attendee(address).and_then(|a| a.common_name.as_deref())
}

fn format_in(dt: &DateTime<Utc>, offset: FixedOffset) -> String {
    dt.with_timezone(&offset).format("%Y-%m-%d %H:%M (UTC%:z)").to_string()
}

/// 参与状态标签的模板名后缀
fn partstat_key(partstat: ParticipationStatus) -> &'static str {
    match partstat {
        ParticipationStatus::Accepted => "accepted",
        ParticipationStatus::Declined => "declined",
        ParticipationStatus::Tentative => "tentative",
        ParticipationStatus::Delegated => "delegated",
        ParticipationStatus::NeedsAction => "needs_action",
    }
}
