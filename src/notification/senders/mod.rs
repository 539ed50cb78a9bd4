//! 具体邮件发送器实现

pub mod log;
pub mod sendmail;
pub mod spool;

pub use log::LogMailSender;
pub use sendmail::{compose_message, SendmailConfig, SendmailSender};
pub use spool::{SpoolMailSender, SpoolRecord};
