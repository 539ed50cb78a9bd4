//! 定时器服务
//!
//! 通知池不自己开线程，只通过 `Scheduler` 注册到期回调：
//! - `TokioScheduler`：生产实现，每个定时任务是一个 tokio task，回调在阻塞线程池执行
//! - `ManualScheduler`：虚拟时钟，用于测试和离线回放
//! - `UnavailableScheduler`：定时器服务不可用，触发池的立即发送回退

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::NotifyError;

/// 到期回调
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// 定时器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// 定时器服务 trait
pub trait Scheduler: Send + Sync {
    /// 当前时间（截止时间都基于此计算）
    fn now(&self) -> Instant;

    /// 在 `delay` 之后执行 `task`
    fn schedule(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle, NotifyError>;

    /// 取消尚未触发的定时器；已触发或不存在的句柄忽略
    fn cancel(&self, handle: TimerHandle);
}

/// 基于 tokio 的定时器
pub struct TokioScheduler {
    runtime: Option<Handle>,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    /// 使用指定 runtime
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 使用当前线程所在的 runtime；不在 runtime 内时所有调度都会失败
    pub fn from_current() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 尚未触发的定时器数量
    pub fn pending_timers(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 取消全部定时器
    pub fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let count = tasks.len();
        for (_, join) in tasks.drain() {
            join.abort();
        }
        count
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle, NotifyError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| NotifyError::Scheduling("no tokio runtime available".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.tasks);

        // 持锁 spawn，保证任务触发时登记已完成
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                warn!(timer = id, error = %e, "Timer callback panicked");
            }
        });
        tasks.insert(id, join);
        debug!(timer = id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
        if let Some(join) = removed {
            join.abort();
            debug!(timer = handle.0, "Timer cancelled");
        }
    }
}

struct ManualState {
    now: Instant,
    next_id: u64,
    timers: BTreeMap<(Instant, u64), TimerTask>,
    due: HashMap<u64, Instant>,
}

/// 虚拟时钟定时器：只有调用 `advance` 时才会触发回调
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Instant::now(),
                next_id: 1,
                timers: BTreeMap::new(),
                due: HashMap::new(),
            }),
        }
    }

    /// 推进虚拟时间，按到期顺序执行所有到期回调，返回触发数量
    ///
    /// 回调在锁外执行，回调中可以继续调度或取消定时器。
    pub fn advance(&self, by: Duration) -> usize {
        let target = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.now + by
        };

        let mut fired = 0;
        loop {
            let task = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let next = state.timers.keys().next().copied();
                match next {
                    Some((at, id)) if at <= target => {
                        state.now = state.now.max(at);
                        state.due.remove(&id);
                        state.timers.remove(&(at, id))
                    }
                    _ => {
                        state.now = target;
                        None
                    }
                }
            };
            match task {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }
        fired
    }

    /// 尚未触发的定时器数量
    pub fn pending_timers(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).timers.len()
    }

    /// 距离最近一个定时器到期的时间
    pub fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .timers
            .keys()
            .next()
            .map(|(at, _)| at.saturating_duration_since(state.now))
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle, NotifyError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        let at = state.now + delay;
        state.timers.insert((at, id), task);
        state.due.insert(id, at);
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = state.due.remove(&handle.0) {
            state.timers.remove(&(at, handle.0));
        }
    }
}

/// 不可用的定时器服务
#[derive(Debug, Default)]
pub struct UnavailableScheduler;

impl Scheduler for UnavailableScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, _delay: Duration, _task: TimerTask) -> Result<TimerHandle, NotifyError> {
        Err(NotifyError::Scheduling("timer service is not available".to_string()))
    }

    fn cancel(&self, _handle: TimerHandle) {}
}
