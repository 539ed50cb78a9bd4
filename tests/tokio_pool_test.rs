use anyhow::Result;
use chrono::{TimeZone, Utc};
use itip_notify_pool::calendar::{Attendee, EventSnapshot, ItipMethod};
use itip_notify_pool::notification::{
    BuiltinTemplates, ChangeKind, ChangeNotification, GeneratedMail, MailGeneratorFactory,
    MailSender, NotificationPool, Participant, ParticipantResolver, SubmitOutcome, TokioScheduler,
};
use itip_notify_pool::PoolConfig;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct OpenResolver;

impl ParticipantResolver for OpenResolver {
    fn resolve(&self, address: &str) -> Result<Option<Participant>> {
        Ok(Some(Participant::external(address)))
    }
}

/// 记录真实发送时刻的 mock 发送器
struct ClockSender {
    origin: Instant,
    sent: Mutex<Vec<(Duration, GeneratedMail)>>,
}

impl ClockSender {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<(Duration, GeneratedMail)> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailSender for ClockSender {
    fn name(&self) -> &str {
        "clock"
    }

    fn send(&self, mail: &GeneratedMail) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((self.origin.elapsed(), mail.clone()));
        Ok(())
    }
}

fn notification(kind: ChangeKind) -> ChangeNotification {
    let event = EventSnapshot::new(
        "planning",
        "Sprint planning",
        Utc.with_ymd_and_hms(2026, 11, 2, 9, 0, 0).unwrap(),
        "lead@example.com",
    )
    .with_attendee(Attendee::new("dev@example.com"));

    ChangeNotification::builder()
        .recipient("dev@example.com")
        .kind(kind)
        .event(event)
        .actor("lead@example.com")
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_promoted_batch_fires_on_tokio_timer_and_shutdown_silences_rest() {
    let scheduler = Arc::new(TokioScheduler::from_current());
    let sender = Arc::new(ClockSender::new());
    let generator = Arc::new(MailGeneratorFactory::new(
        Arc::new(OpenResolver),
        Arc::new(BuiltinTemplates::new()),
    ));
    let pool = NotificationPool::new(
        PoolConfig::default().with_intervals(60_000, 120_000, 100),
        scheduler.clone(),
        generator,
        sender.clone(),
    );

    pool.submit(notification(ChangeKind::Update));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = pool.submit(notification(ChangeKind::Delete));
    assert!(matches!(outcome, SubmitOutcome::Merged { promoted: true, .. }));
    // 提升时旧的明细定时器被取消
    assert_eq!(scheduler.pending_timers(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0 >= Duration::from_millis(100));
    assert_eq!(sent[0].1.method, ItipMethod::Cancel);
    assert_eq!(sent[0].1.references.len(), 2);
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(scheduler.pending_timers(), 0);

    // 新批次使用 60 秒窗口，只能由 shutdown 投递
    pool.submit(notification(ChangeKind::Update));
    assert_eq!(scheduler.pending_timers(), 1);

    let closing = Arc::clone(&pool);
    let report = tokio::task::spawn_blocking(move || closing.shutdown())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.mails_sent(), 1);
    assert_eq!(report.cancelled_timers, 1);
    assert_eq!(scheduler.pending_timers(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sender.sent().len(), 2);
    assert!(pool.is_shut_down());
}

#[tokio::test]
async fn test_timer_fires_on_current_thread_runtime() {
    let scheduler = Arc::new(TokioScheduler::new(tokio::runtime::Handle::current()));
    let sender = Arc::new(ClockSender::new());
    let generator = Arc::new(MailGeneratorFactory::new(
        Arc::new(OpenResolver),
        Arc::new(BuiltinTemplates::new()),
    ));
    let pool = NotificationPool::new(
        PoolConfig::default().with_intervals(50, 100, 10),
        scheduler.clone(),
        generator,
        sender.clone(),
    );

    pool.submit(notification(ChangeKind::Update));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sender.sent().len(), 1);
    assert_eq!(scheduler.pending_timers(), 0);
}
