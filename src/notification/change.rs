//! 变更通知值对象、优先级分类和聚合键
//!
//! `ChangeNotification` 创建后不可变；池内合并时生成新的值，而不是修改旧值。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::calendar::{normalize_address, EventSnapshot, ParticipationStatus};

static NEXT_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(1);

/// 通知 ID（进程内单调递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub u64);

impl NotificationId {
    fn next() -> Self {
        Self(NEXT_NOTIFICATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// 变更类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    /// 新建事件
    Create,
    /// 普通字段修改
    Update,
    /// 删除（取消）
    Delete,
    /// 参与状态变化
    StateChange {
        attendee: String,
        partstat: ParticipationStatus,
    },
}

impl ChangeKind {
    /// 合并两个连续变更为净效果
    ///
    /// - 任何变更之后的删除 → 删除
    /// - 删除之后重新创建 → 更新
    /// - 新建之后的修改/状态变化 → 新建
    /// - 修改与状态变化互相合并 → 修改
    /// - 同类变更 → 取最新
    pub fn merge(prev: &ChangeKind, next: &ChangeKind) -> ChangeKind {
        use ChangeKind::*;
        match (prev, next) {
            (_, Delete) => Delete,
            (Delete, Create) => Update,
            (Delete, _) => Delete,
            (Create, _) => Create,
            (Update, Create) | (StateChange { .. }, Create) => Create,
            (Update, Update) | (Update, StateChange { .. }) | (StateChange { .. }, Update) => {
                Update
            }
            (StateChange { .. }, StateChange { .. }) => next.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::StateChange { .. } => "state_change",
        }
    }
}

/// 优先级分类，决定使用哪个聚合窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// 普通字段变更
    Detail,
    /// 参与状态变更
    StateChange,
    /// 紧急变更（取消等）
    Priority,
}

impl PriorityClass {
    /// 根据变更类型推断
    pub fn for_kind(kind: &ChangeKind) -> Self {
        match kind {
            ChangeKind::Delete => Self::Priority,
            ChangeKind::StateChange { .. } => Self::StateChange,
            ChangeKind::Create | ChangeKind::Update => Self::Detail,
        }
    }

    /// 排序值，越大越紧急
    pub fn rank(&self) -> u8 {
        match self {
            Self::Detail => 0,
            Self::StateChange => 1,
            Self::Priority => 2,
        }
    }

    /// 两者中更紧急的一个
    pub fn max(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::StateChange => "state_change",
            Self::Priority => "priority",
        }
    }
}

impl std::fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 聚合键：(收件人, 日历对象)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey {
    pub recipient: String,
    pub object_id: String,
}

impl AggregationKey {
    pub fn new(recipient: impl AsRef<str>, object_id: impl Into<String>) -> Self {
        Self {
            recipient: normalize_address(recipient.as_ref()),
            object_id: object_id.into(),
        }
    }
}

impl std::fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.recipient, self.object_id)
    }
}

/// 发给单个收件人的一次日历变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    id: NotificationId,
    recipient: String,
    object_id: String,
    kind: ChangeKind,
    priority: PriorityClass,
    timestamp: DateTime<Utc>,
    event: EventSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
}

impl ChangeNotification {
    pub fn builder() -> ChangeNotificationBuilder {
        ChangeNotificationBuilder::default()
    }

    pub fn id(&self) -> NotificationId {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn kind(&self) -> &ChangeKind {
        &self.kind
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event(&self) -> &EventSnapshot {
        &self.event
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn aggregation_key(&self) -> AggregationKey {
        AggregationKey {
            recipient: self.recipient.clone(),
            object_id: self.object_id.clone(),
        }
    }

    /// 将后到的通知合并进当前通知，返回表示净效果的新通知
    ///
    /// 保留最新的事件快照、时间戳和发起者；优先级取两者中更紧急的。
    pub fn merged_with(&self, next: &ChangeNotification) -> ChangeNotification {
        ChangeNotification {
            id: next.id,
            recipient: self.recipient.clone(),
            object_id: self.object_id.clone(),
            kind: ChangeKind::merge(&self.kind, &next.kind),
            priority: self.priority.max(next.priority),
            timestamp: next.timestamp.max(self.timestamp),
            event: next.event.clone(),
            actor: next.actor.clone().or_else(|| self.actor.clone()),
        }
    }
}

/// 通知构建器
#[derive(Debug, Default)]
pub struct ChangeNotificationBuilder {
    recipient: Option<String>,
    object_id: Option<String>,
    kind: Option<ChangeKind>,
    priority: Option<PriorityClass>,
    timestamp: Option<DateTime<Utc>>,
    event: Option<EventSnapshot>,
    actor: Option<String>,
}

impl ChangeNotificationBuilder {
    pub fn recipient(mut self, recipient: impl AsRef<str>) -> Self {
        self.recipient = Some(normalize_address(recipient.as_ref()));
        self
    }

    pub fn object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// 显式指定优先级（覆盖按变更类型推断的结果）
    pub fn priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn event(mut self, event: EventSnapshot) -> Self {
        self.event = Some(event);
        self
    }

    pub fn actor(mut self, actor: impl AsRef<str>) -> Self {
        self.actor = Some(normalize_address(actor.as_ref()));
        self
    }

    pub fn build(self) -> Result<ChangeNotification, &'static str> {
        let recipient = self.recipient.ok_or("recipient is required")?;
        let event = self.event.ok_or("event is required")?;
        let kind = self.kind.ok_or("kind is required")?;
        let object_id = self.object_id.unwrap_or_else(|| event.uid.clone());
        let priority = self
            .priority
            .unwrap_or_else(|| PriorityClass::for_kind(&kind));

        Ok(ChangeNotification {
            id: NotificationId::next(),
            recipient,
            object_id,
            kind,
            priority,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event,
            actor: self.actor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> EventSnapshot {
        EventSnapshot::new(
            "evt-1",
            "Standup",
            Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
            "org@example.com",
        )
    }

    fn state(partstat: ParticipationStatus) -> ChangeKind {
        ChangeKind::StateChange {
            attendee: "bob@example.com".to_string(),
            partstat,
        }
    }

    #[test]
    fn test_merge_delete_dominates() {
        assert_eq!(ChangeKind::merge(&ChangeKind::Create, &ChangeKind::Delete), ChangeKind::Delete);
        assert_eq!(ChangeKind::merge(&ChangeKind::Update, &ChangeKind::Delete), ChangeKind::Delete);
        assert_eq!(
            ChangeKind::merge(&ChangeKind::Delete, &ChangeKind::Update),
            ChangeKind::Delete
        );
    }

    #[test]
    fn test_merge_create_absorbs_edits() {
        assert_eq!(ChangeKind::merge(&ChangeKind::Create, &ChangeKind::Update), ChangeKind::Create);
        assert_eq!(
            ChangeKind::merge(&ChangeKind::Create, &state(ParticipationStatus::Accepted)),
            ChangeKind::Create
        );
    }

    #[test]
    fn test_merge_recreate_after_delete_is_update() {
        assert_eq!(ChangeKind::merge(&ChangeKind::Delete, &ChangeKind::Create), ChangeKind::Update);
    }

    #[test]
    fn test_merge_state_changes_keep_latest() {
        let merged = ChangeKind::merge(
            &state(ParticipationStatus::Tentative),
            &state(ParticipationStatus::Declined),
        );
        assert_eq!(merged, state(ParticipationStatus::Declined));
        assert_eq!(
            ChangeKind::merge(&ChangeKind::Update, &state(ParticipationStatus::Accepted)),
            ChangeKind::Update
        );
    }

    #[test]
    fn test_priority_for_kind() {
        assert_eq!(PriorityClass::for_kind(&ChangeKind::Delete), PriorityClass::Priority);
        assert_eq!(PriorityClass::for_kind(&ChangeKind::Update), PriorityClass::Detail);
        assert_eq!(
            PriorityClass::for_kind(&state(ParticipationStatus::Accepted)),
            PriorityClass::StateChange
        );
        assert_eq!(PriorityClass::Detail.max(PriorityClass::Priority), PriorityClass::Priority);
        assert_eq!(PriorityClass::Priority.max(PriorityClass::Detail), PriorityClass::Priority);
    }

    #[test]
    fn test_builder_defaults() {
        let n = ChangeNotification::builder()
            .recipient("MAILTO:Bob@Example.com")
            .kind(ChangeKind::Update)
            .event(event())
            .build()
            .unwrap();
        assert_eq!(n.recipient(), "bob@example.com");
        assert_eq!(n.object_id(), "evt-1");
        assert_eq!(n.priority(), PriorityClass::Detail);
        assert_eq!(n.aggregation_key(), AggregationKey::new("bob@example.com", "evt-1"));
    }

    #[test]
    fn test_builder_requires_recipient() {
        let err = ChangeNotification::builder()
            .kind(ChangeKind::Update)
            .event(event())
            .build()
            .unwrap_err();
        assert_eq!(err, "recipient is required");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ChangeNotification::builder()
            .recipient("a@x")
            .kind(ChangeKind::Create)
            .event(event())
            .build()
            .unwrap();
        let b = ChangeNotification::builder()
            .recipient("a@x")
            .kind(ChangeKind::Create)
            .event(event())
            .build()
            .unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_merged_with_keeps_latest_snapshot() {
        let first = ChangeNotification::builder()
            .recipient("bob@example.com")
            .kind(ChangeKind::Create)
            .event(event())
            .build()
            .unwrap();
        let mut renamed = event();
        renamed.summary = "Standup (moved)".to_string();
        let second = ChangeNotification::builder()
            .recipient("bob@example.com")
            .kind(ChangeKind::Update)
            .event(renamed)
            .build()
            .unwrap();

        let merged = first.merged_with(&second);
        assert_eq!(merged.kind(), &ChangeKind::Create);
        assert_eq!(merged.event().summary, "Standup (moved)");
        assert_eq!(merged.id(), second.id());
    }
}
