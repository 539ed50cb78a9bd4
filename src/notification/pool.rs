//! 通知池 - 按 (收件人, 日历对象) 聚合变更通知，窗口到期后统一生成并发送
//!
//! # 窗口
//! - 细节窗口：普通字段修改
//! - 状态窗口：参与状态变化
//! - 优先窗口：取消等紧急变更，必须最短
//!
//! 同一个键已有待发批次时，新通知合并进去；截止时间不会因为同级或低级通知而重置，
//! 只有更高级的通知才会把截止时间提前到 `now + 新窗口`（只提前，不推后）。
//!
//! # 并发
//! - 待发表只在池内部锁中修改，生成和发送都在锁外进行
//! - 同一个键的 flush 通过键级锁串行执行
//! - flush 先从表中移除批次再生成邮件；移除之后到达的通知会开启新批次

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::change::{AggregationKey, ChangeNotification, NotificationId, PriorityClass};
use super::generator::MailGeneratorFactory;
use super::scheduler::{Scheduler, TimerHandle};
use super::sender::MailSender;
use crate::config::PoolConfig;
use crate::error::NotifyError;

/// 待发批次
#[derive(Debug)]
struct PendingBatch {
    /// 合并后的净效果通知
    notification: ChangeNotification,
    /// 所有被合并的原始通知
    sources: Vec<NotificationId>,
    /// 当前所在窗口
    window: PriorityClass,
    deadline: Instant,
    /// 批次代号，用于识别过期的定时器回调
    generation: u64,
    timer: Option<TimerHandle>,
}

#[derive(Debug, Default)]
struct PoolState {
    pending: HashMap<AggregationKey, PendingBatch>,
    next_generation: u64,
    shut_down: bool,
}

/// `submit` 的结果
#[derive(Debug)]
pub enum SubmitOutcome {
    /// 新批次已排队
    Queued { deadline: Instant },
    /// 合并进已有批次
    Merged { deadline: Instant, promoted: bool },
    /// 未能排队，已立即发送（定时器不可用或池已关闭）
    Delivered(FlushReport),
}

/// 单个键的 flush 结果
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub key: AggregationKey,
    /// 是否真的有批次被发送（false 表示该键已不在池中）
    pub flushed: bool,
    /// 被合并的原始通知
    pub sources: Vec<NotificationId>,
    pub mails_sent: usize,
    /// 被跳过的收件人
    pub skipped: Vec<String>,
    /// 生成或发送失败（不重试）
    pub failures: Vec<NotifyError>,
}

impl FlushReport {
    fn noop(key: &AggregationKey) -> Self {
        Self {
            key: key.clone(),
            flushed: false,
            sources: Vec::new(),
            mails_sent: 0,
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// 没有失败
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// `shutdown` 的结果
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub flushed: Vec<FlushReport>,
    pub cancelled_timers: usize,
}

impl ShutdownReport {
    /// 所有失败
    pub fn failures(&self) -> impl Iterator<Item = &NotifyError> {
        self.flushed.iter().flat_map(|r| r.failures.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn mails_sent(&self) -> usize {
        self.flushed.iter().map(|r| r.mails_sent).sum()
    }
}

/// 通知池
pub struct NotificationPool {
    config: PoolConfig,
    scheduler: Arc<dyn Scheduler>,
    generator: Arc<MailGeneratorFactory>,
    sender: Arc<dyn MailSender>,
    state: Mutex<PoolState>,
    flush_locks: Mutex<HashMap<AggregationKey, Arc<Mutex<()>>>>,
    self_ref: Weak<NotificationPool>,
}

impl NotificationPool {
    /// 创建通知池（定时器回调通过弱引用找回池）
    pub fn new(
        config: PoolConfig,
        scheduler: Arc<dyn Scheduler>,
        generator: Arc<MailGeneratorFactory>,
        sender: Arc<dyn MailSender>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            scheduler,
            generator,
            sender,
            state: Mutex::new(PoolState::default()),
            flush_locks: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 提交一条通知
    pub fn submit(&self, notification: ChangeNotification) -> SubmitOutcome {
        let key = notification.aggregation_key();
        let class = notification.priority();
        let now = self.scheduler.now();

        let mut state = self.state();
        if state.shut_down {
            drop(state);
            warn!(key = %key, "Pool is shut down, delivering immediately");
            let batch = PendingBatch {
                sources: vec![notification.id()],
                notification,
                window: class,
                deadline: now,
                generation: 0,
                timer: None,
            };
            return SubmitOutcome::Delivered(self.deliver_serialized(&key, batch));
        }

        let generation = state.next_generation;
        let schedule_error: NotifyError = match state.pending.get_mut(&key) {
            Some(batch) => {
                batch.notification = batch.notification.merged_with(&notification);
                batch.sources.push(notification.id());

                let mut promoted = false;
                if class.rank() > batch.window.rank() {
                    batch.window = class;
                    let candidate = now + self.config.window(class);
                    if candidate < batch.deadline {
                        batch.deadline = candidate;
                        promoted = true;
                    }
                }

                if !promoted {
                    debug!(key = %key, window = %batch.window, kind = notification.kind().label(), "Merged into pending batch");
                    return SubmitOutcome::Merged {
                        deadline: batch.deadline,
                        promoted: false,
                    };
                }

                if let Some(old) = batch.timer.take() {
                    self.scheduler.cancel(old);
                }
                let delay = batch.deadline.saturating_duration_since(now);
                let batch_generation = batch.generation;
                info!(key = %key, window = %class, delay_ms = delay.as_millis() as u64, "Promoted pending batch");
                match self.schedule_flush(&key, batch_generation, delay) {
                    Ok(handle) => {
                        batch.timer = Some(handle);
                        return SubmitOutcome::Merged {
                            deadline: batch.deadline,
                            promoted: true,
                        };
                    }
                    Err(e) => e,
                }
            }
            None => {
                state.next_generation += 1;
                let window = self.config.window(class);
                let deadline = now + window;
                match self.schedule_flush(&key, generation, window) {
                    Ok(handle) => {
                        debug!(key = %key, window = %class, delay_ms = window.as_millis() as u64, "Queued new batch");
                        state.pending.insert(
                            key,
                            PendingBatch {
                                sources: vec![notification.id()],
                                notification,
                                window: class,
                                deadline,
                                generation,
                                timer: Some(handle),
                            },
                        );
                        return SubmitOutcome::Queued { deadline };
                    }
                    Err(e) => {
                        state.pending.insert(
                            key.clone(),
                            PendingBatch {
                                sources: vec![notification.id()],
                                notification,
                                window: class,
                                deadline,
                                generation,
                                timer: None,
                            },
                        );
                        e
                    }
                }
            }
        };

        // 定时器不可用：立即同步 flush，避免通知丢失
        drop(state);
        warn!(key = %key, error = %schedule_error, "Cannot schedule flush, delivering immediately");
        SubmitOutcome::Delivered(self.flush(&key))
    }

    fn schedule_flush(
        &self,
        key: &AggregationKey,
        generation: u64,
        delay: std::time::Duration,
    ) -> Result<TimerHandle, NotifyError> {
        let pool = self.self_ref.clone();
        let key = key.clone();
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.on_deadline(&key, generation);
                }
            }),
        )
    }

    /// 定时器回调：只 flush 调度它的那个批次
    fn on_deadline(&self, key: &AggregationKey, generation: u64) {
        if self.is_shut_down() {
            return;
        }
        let report = self.flush_matching(key, Some(generation));
        if report.flushed && !report.is_clean() {
            for failure in &report.failures {
                warn!(key = %key, kind = failure.kind(), error = %failure, "Notification flush failed");
            }
        }
    }

    /// 立即 flush 指定键（幂等：键不存在时什么也不做）
    pub fn flush(&self, key: &AggregationKey) -> FlushReport {
        self.flush_matching(key, None)
    }

    fn flush_matching(&self, key: &AggregationKey, generation: Option<u64>) -> FlushReport {
        let key_lock = self.flush_lock(key);
        let report = {
            let _guard = key_lock.lock().unwrap_or_else(|e| e.into_inner());
            let batch = {
                let mut state = self.state();
                let matches = state
                    .pending
                    .get(key)
                    .map(|b| generation.map_or(true, |g| b.generation == g))
                    .unwrap_or(false);
                if matches {
                    state.pending.remove(key)
                } else {
                    None
                }
            };

            match batch {
                Some(mut batch) => {
                    if let Some(timer) = batch.timer.take() {
                        self.scheduler.cancel(timer);
                    }
                    self.deliver(key, batch)
                }
                None => FlushReport::noop(key),
            }
        };
        self.release_flush_lock(key, key_lock);
        report
    }

    fn flush_lock(&self, key: &AggregationKey) -> Arc<Mutex<()>> {
        let mut locks = self.flush_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_flush_lock(&self, key: &AggregationKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.flush_locks.lock().unwrap_or_else(|e| e.into_inner());
        // 只剩表内和当前持有者时回收
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    /// 在键级锁内发送一个已从表中取出的批次
    fn deliver_serialized(&self, key: &AggregationKey, batch: PendingBatch) -> FlushReport {
        let key_lock = self.flush_lock(key);
        let report = {
            let _guard = key_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.deliver(key, batch)
        };
        self.release_flush_lock(key, key_lock);
        report
    }

    /// 生成并发送（调用方保证不持有池锁）
    fn deliver(&self, key: &AggregationKey, batch: PendingBatch) -> FlushReport {
        let outcome = self.generator.generate(&batch.notification, &batch.sources);
        let mut report = FlushReport {
            key: key.clone(),
            flushed: true,
            sources: batch.sources,
            mails_sent: 0,
            skipped: outcome.skipped,
            failures: outcome.failures,
        };

        for mail in &outcome.mails {
            match self.sender.send(mail) {
                Ok(()) => report.mails_sent += 1,
                Err(e) => {
                    let err = NotifyError::Transport {
                        sender: self.sender.name().to_string(),
                        recipient: mail.to.clone(),
                        reason: e.to_string(),
                    };
                    warn!(key = %key, error = %err, "Mail send failed, not retrying");
                    report.failures.push(err);
                }
            }
        }

        info!(
            key = %key,
            window = %batch.window,
            kind = batch.notification.kind().label(),
            merged = report.sources.len(),
            sent = report.mails_sent,
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Flushed notification batch"
        );
        report
    }

    /// 外部移除（例如会话销毁）：丢弃批次且不发送
    pub fn remove(&self, key: &AggregationKey) -> Option<ChangeNotification> {
        let batch = self.state().pending.remove(key)?;
        if let Some(timer) = batch.timer {
            self.scheduler.cancel(timer);
        }
        debug!(key = %key, "Pending batch removed without sending");
        Some(batch.notification)
    }

    /// 关闭：取消所有定时器并同步 flush 剩余批次
    ///
    /// 返回后池中没有待发批次，也不会再有定时器回调产生发送。
    pub fn shutdown(&self) -> ShutdownReport {
        let drained: Vec<(AggregationKey, PendingBatch)> = {
            let mut state = self.state();
            state.shut_down = true;
            state.pending.drain().collect()
        };

        let mut report = ShutdownReport::default();
        let mut batches = Vec::with_capacity(drained.len());
        for (key, mut batch) in drained {
            if let Some(timer) = batch.timer.take() {
                self.scheduler.cancel(timer);
                report.cancelled_timers += 1;
            }
            batches.push((key, batch));
        }
        batches.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline));

        info!(pending = batches.len(), "Shutting down notification pool");
        for (key, batch) in batches {
            let flushed = self.deliver_serialized(&key, batch);
            for failure in &flushed.failures {
                warn!(key = %key, kind = failure.kind(), error = %failure, "Flush failed during shutdown");
            }
            report.flushed.push(flushed);
        }

        // 等待进行中的 flush 结束
        let in_flight: Vec<Arc<Mutex<()>>> = self
            .flush_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for lock in in_flight {
            drop(lock.lock().unwrap_or_else(|e| e.into_inner()));
        }

        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// 待发的键（排序后）
    pub fn pending_keys(&self) -> Vec<AggregationKey> {
        let mut keys: Vec<AggregationKey> = self.state().pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn deadline_of(&self, key: &AggregationKey) -> Option<Instant> {
        self.state().pending.get(key).map(|b| b.deadline)
    }

    pub fn window_of(&self, key: &AggregationKey) -> Option<PriorityClass> {
        self.state().pending.get(key).map(|b| b.window)
    }

    /// 待发批次当前的净效果通知
    pub fn pending_notification(&self, key: &AggregationKey) -> Option<ChangeNotification> {
        self.state().pending.get(key).map(|b| b.notification.clone())
    }
}

impl Drop for NotificationPool {
    fn drop(&mut self) {
        let pending = self.state.get_mut().map(|s| s.pending.len()).unwrap_or(0);
        if pending > 0 {
            warn!(pending, "Notification pool dropped with pending batches; call shutdown() first");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::EventSnapshot;
    use crate::notification::change::ChangeKind;
    use crate::notification::generator::{GeneratedMail, Participant, ParticipantResolver};
    use crate::notification::scheduler::{ManualScheduler, UnavailableScheduler};
    use crate::notification::template::BuiltinTemplates;
    use anyhow::{anyhow, Result};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct OpenResolver;

    impl ParticipantResolver for OpenResolver {
        fn resolve(&self, address: &str) -> Result<Option<Participant>> {
            Ok(Some(Participant::external(address)))
        }
    }

    /// 测试用的 mock 发送器
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<GeneratedMail>>,
        fail_for: Option<String>,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<GeneratedMail> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MailSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        fn send(&self, mail: &GeneratedMail) -> Result<()> {
            if self.fail_for.as_deref() == Some(mail.to.as_str()) {
                return Err(anyhow!("relay refused"));
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    fn setup(
        scheduler: Arc<dyn Scheduler>,
        sender: Arc<RecordingSender>,
    ) -> Arc<NotificationPool> {
        let generator = Arc::new(MailGeneratorFactory::new(
            Arc::new(OpenResolver),
            Arc::new(BuiltinTemplates::new()),
        ));
        NotificationPool::new(
            PoolConfig::default().with_intervals(1000, 5000, 100),
            scheduler,
            generator,
            sender,
        )
    }

    fn change(recipient: &str, kind: ChangeKind) -> ChangeNotification {
        ChangeNotification::builder()
            .recipient(recipient)
            .kind(kind)
            .event(EventSnapshot::new(
                "evt-1",
                "Review",
                Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
                "org@example.com",
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_submit_queues_and_timer_flushes() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());

        let outcome = pool.submit(change("bob@example.com", ChangeKind::Update));
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(pool.pending_count(), 1);

        scheduler.advance(Duration::from_millis(999));
        assert!(sender.sent().is_empty());

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_same_class_does_not_extend_deadline() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());
        let key = AggregationKey::new("bob@example.com", "evt-1");

        pool.submit(change("bob@example.com", ChangeKind::Update));
        let first_deadline = pool.deadline_of(&key).unwrap();

        scheduler.advance(Duration::from_millis(500));
        let outcome = pool.submit(change("bob@example.com", ChangeKind::Update));
        assert!(matches!(outcome, SubmitOutcome::Merged { promoted: false, .. }));
        assert_eq!(pool.deadline_of(&key), Some(first_deadline));
    }

    #[test]
    fn test_lower_class_after_priority_keeps_short_deadline() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());
        let key = AggregationKey::new("bob@example.com", "evt-1");

        pool.submit(change("bob@example.com", ChangeKind::Delete));
        pool.submit(change("bob@example.com", ChangeKind::Create));
        assert_eq!(pool.window_of(&key), Some(PriorityClass::Priority));

        scheduler.advance(Duration::from_millis(100));
        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        // 删除后重建合并为更新
        assert_eq!(sent[0].subject, "Appointment changed: Review");
    }

    #[test]
    fn test_flush_is_idempotent() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());
        let key = AggregationKey::new("bob@example.com", "evt-1");

        pool.submit(change("bob@example.com", ChangeKind::Update));
        let first = pool.flush(&key);
        let second = pool.flush(&key);

        assert!(first.flushed);
        assert!(!second.flushed);
        assert_eq!(sender.sent().len(), 1);
        // 手动 flush 已取消定时器
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_stale_timer_does_not_flush_new_batch() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());
        let key = AggregationKey::new("bob@example.com", "evt-1");

        pool.submit(change("bob@example.com", ChangeKind::Update));
        scheduler.advance(Duration::from_millis(400));
        pool.flush(&key);

        // 新批次，截止时间为 400 + 1000
        pool.submit(change("bob@example.com", ChangeKind::Update));
        pool.on_deadline(&key, 0);
        assert_eq!(pool.pending_count(), 1);

        scheduler.advance(Duration::from_millis(1000));
        assert_eq!(sender.sent().len(), 2);
    }

    #[test]
    fn test_transport_failure_reported_not_retried() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            fail_for: Some("bob@example.com".to_string()),
        });
        let pool = setup(scheduler.clone(), sender.clone());

        pool.submit(change("bob@example.com", ChangeKind::Update));
        pool.submit(change("carol@example.com", ChangeKind::Update));
        let report = pool.flush(&AggregationKey::new("bob@example.com", "evt-1"));

        assert!(report.flushed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind(), "transport");

        // 其它键不受影响
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].to, "carol@example.com");
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_scheduler_unavailable_falls_back_to_immediate() {
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(Arc::new(UnavailableScheduler), sender.clone());

        let outcome = pool.submit(change("bob@example.com", ChangeKind::Update));
        match outcome {
            SubmitOutcome::Delivered(report) => assert_eq!(report.mails_sent, 1),
            other => panic!("expected immediate delivery, got {:?}", other),
        }
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_remove_discards_without_sending() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());
        let key = AggregationKey::new("bob@example.com", "evt-1");

        pool.submit(change("bob@example.com", ChangeKind::Update));
        assert!(pool.remove(&key).is_some());
        assert!(pool.remove(&key).is_none());

        scheduler.advance(Duration::from_secs(10));
        assert!(sender.sent().is_empty());
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_delivers_immediately() {
        let scheduler = Arc::new(ManualScheduler::new());
        let sender = Arc::new(RecordingSender::default());
        let pool = setup(scheduler.clone(), sender.clone());

        pool.shutdown();
        let outcome = pool.submit(change("bob@example.com", ChangeKind::Create));
        assert!(matches!(outcome, SubmitOutcome::Delivered(_)));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(pool.pending_count(), 0);
    }
}
