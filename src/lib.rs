//! iTip Notify Pool - 日历变更通知的聚合与发送

pub mod calendar;
pub mod cli;
pub mod config;
pub mod error;
pub mod notification;
pub mod resolver;

pub use calendar::{CalendarChange, ChangeObserver, EventSnapshot, ItipMethod};
pub use config::PoolConfig;
pub use error::NotifyError;
pub use notification::{
    build_notification_sender, AggregationKey, CalendarChangeHandler, ChangeKind,
    ChangeNotification, MailGeneratorFactory, MailSender, NotificationPool, NotificationSender,
    PriorityClass,
};
pub use resolver::{DirectoryEntry, DirectoryResolver};
