//! 通知层 - 把日历变更聚合为 iTip 邮件
//!
//! # 流程
//! 1. `CalendarChangeHandler` 把一次日历写操作扇出为每个参与方一条 `ChangeNotification`
//! 2. `NotificationSender` 决定立即发送还是提交到 `NotificationPool`
//! 3. 池按 (收件人, 日历对象) 合并通知，窗口到期后交给 `MailGeneratorFactory`
//! 4. 生成的邮件通过 `MailSender` 发出
//!
//! # 使用示例
//! ```ignore
//! use itip_notify_pool::notification::*;
//!
//! let sender = build_notification_sender(config, scheduler, generator, mail_sender);
//! let handler = CalendarChangeHandler::new(sender.clone());
//! handler.on_change(&change);
//! sender.close();
//! ```

pub mod change;
pub mod generator;
pub mod observer;
pub mod pool;
pub mod scheduler;
pub mod sender;
pub mod senders;
pub mod template;

pub use change::{
    AggregationKey, ChangeKind, ChangeNotification, ChangeNotificationBuilder, NotificationId,
    PriorityClass,
};
pub use generator::{
    GeneratedMail, GenerationOutcome, MailGeneratorFactory, Participant, ParticipantResolver,
};
pub use observer::CalendarChangeHandler;
pub use pool::{FlushReport, NotificationPool, ShutdownReport, SubmitOutcome};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler, UnavailableScheduler};
pub use sender::{
    build_notification_sender, DirectNotificationSender, MailSender, NotificationSender,
    PoolingNotificationSender,
};
pub use senders::{LogMailSender, SendmailSender, SpoolMailSender};
pub use template::{BuiltinTemplates, TemplateRenderer, TemplateVars};
