//! 日历变更处理器 - 把一次已提交的日历写操作扇出为每个参与方一条通知
//!
//! 通知失败只记录日志，不会影响日历写入。

use std::sync::Arc;
use tracing::{debug, warn};

use super::change::{ChangeNotification, PriorityClass};
use super::sender::NotificationSender;
use crate::calendar::{normalize_address, CalendarChange, ChangeObserver};

/// 日历变更处理器
pub struct CalendarChangeHandler {
    sender: Arc<dyn NotificationSender>,
}

impl CalendarChangeHandler {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }

    pub fn sender(&self) -> &Arc<dyn NotificationSender> {
        &self.sender
    }

    /// 为每个参与方（组织者和参与者，去重，排除操作者本人）生成一条通知
    pub fn fan_out(&self, change: &CalendarChange) -> Vec<ChangeNotification> {
        let actor = change.actor.as_deref().map(normalize_address);

        change
            .event
            .participants()
            .into_iter()
            .filter(|address| actor.as_deref() != Some(*address))
            .filter_map(|address| {
                let mut builder = ChangeNotification::builder()
                    .recipient(address)
                    .object_id(change.object_id.clone())
                    .kind(change.kind.clone())
                    .event(change.event.clone())
                    .timestamp(change.timestamp);
                if let Some(actor) = &change.actor {
                    builder = builder.actor(actor);
                }
                if change.urgent {
                    builder = builder.priority(PriorityClass::Priority);
                }
                match builder.build() {
                    Ok(notification) => Some(notification),
                    Err(e) => {
                        warn!(object_id = %change.object_id, recipient = %address, error = e, "Cannot build notification");
                        None
                    }
                }
            })
            .collect()
    }
}

impl ChangeObserver for CalendarChangeHandler {
    fn on_change(&self, change: &CalendarChange) {
        let notifications = self.fan_out(change);
        debug!(
            object_id = %change.object_id,
            kind = change.kind.label(),
            recipients = notifications.len(),
            "Calendar change observed"
        );

        for notification in notifications {
            let recipient = notification.recipient().to_string();
            if let Err(e) = self.sender.notify(notification) {
                warn!(
                    object_id = %change.object_id,
                    recipient = %recipient,
                    kind = e.kind(),
                    error = %e,
                    "Notification failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{Attendee, EventSnapshot, ParticipationStatus};
    use crate::error::NotifyError;
    use crate::notification::change::ChangeKind;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// 记录所有通知的 mock 发送器
    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<ChangeNotification>>,
        fail: bool,
    }

    impl NotificationSender for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        fn notify(&self, notification: ChangeNotification) -> Result<(), NotifyError> {
            let recipient = notification.recipient().to_string();
            self.seen.lock().unwrap().push(notification);
            if self.fail {
                return Err(NotifyError::Transport {
                    sender: "recording".to_string(),
                    recipient,
                    reason: "down".to_string(),
                });
            }
            Ok(())
        }
    }

    fn change(kind: ChangeKind, actor: Option<&str>, urgent: bool) -> CalendarChange {
        let event = EventSnapshot::new(
            "planning",
            "Planning",
            Utc.with_ymd_and_hms(2026, 7, 1, 13, 0, 0).unwrap(),
            "alice@example.com",
        )
        .with_attendee(Attendee::new("alice@example.com"))
        .with_attendee(Attendee::new("Bob@Example.com"))
        .with_attendee(Attendee::new("carol@example.com").with_partstat(ParticipationStatus::Tentative));

        CalendarChange {
            object_id: "planning".to_string(),
            kind,
            event,
            actor: actor.map(|a| a.to_string()),
            urgent,
            timestamp: Utc.with_ymd_and_hms(2026, 6, 30, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_fan_out_skips_actor_and_duplicates() {
        let handler = CalendarChangeHandler::new(Arc::new(RecordingNotifier::default()));
        let notifications = handler.fan_out(&change(ChangeKind::Update, Some("mailto:Alice@example.com"), false));

        let recipients: Vec<&str> = notifications.iter().map(|n| n.recipient()).collect();
        assert_eq!(recipients, vec!["bob@example.com", "carol@example.com"]);
        assert!(notifications.iter().all(|n| n.priority() == PriorityClass::Detail));
        assert_eq!(notifications[0].actor(), Some("alice@example.com"));
    }

    #[test]
    fn test_urgent_change_uses_priority_window() {
        let handler = CalendarChangeHandler::new(Arc::new(RecordingNotifier::default()));
        let notifications = handler.fan_out(&change(ChangeKind::Update, None, true));

        assert_eq!(notifications.len(), 3);
        assert!(notifications.iter().all(|n| n.priority() == PriorityClass::Priority));
    }

    #[test]
    fn test_notification_errors_do_not_propagate() {
        let notifier = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let handler = CalendarChangeHandler::new(notifier.clone());

        handler.on_change(&change(ChangeKind::Delete, Some("alice@example.com"), false));
        assert_eq!(notifier.seen.lock().unwrap().len(), 2);
    }
}
