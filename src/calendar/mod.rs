//! 日历数据模型与变更回调
//!
//! 这里只保留通知引擎需要的最小事件视图：组织者、参与者及其状态、时间和标题。

pub mod ical;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::change::ChangeKind;

/// 参与状态（iCalendar PARTSTAT）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    NeedsAction,
    Accepted,
    Declined,
    Tentative,
    Delegated,
}

impl Default for ParticipationStatus {
    fn default() -> Self {
        Self::NeedsAction
    }
}

impl ParticipationStatus {
    /// iCalendar 参数值
    pub fn as_ical(&self) -> &'static str {
        match self {
            Self::NeedsAction => "NEEDS-ACTION",
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::Tentative => "TENTATIVE",
            Self::Delegated => "DELEGATED",
        }
    }
}

/// 参与者角色（iCalendar ROLE）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendeeRole {
    Chair,
    ReqParticipant,
    OptParticipant,
    NonParticipant,
}

impl Default for AttendeeRole {
    fn default() -> Self {
        Self::ReqParticipant
    }
}

impl AttendeeRole {
    pub fn as_ical(&self) -> &'static str {
        match self {
            Self::Chair => "CHAIR",
            Self::ReqParticipant => "REQ-PARTICIPANT",
            Self::OptParticipant => "OPT-PARTICIPANT",
            Self::NonParticipant => "NON-PARTICIPANT",
        }
    }
}

/// 组织者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    /// 邮件地址（已去掉 mailto: 前缀并转小写）
    pub address: String,
    /// CN 参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
}

/// 参与者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default)]
    pub partstat: ParticipationStatus,
    #[serde(default)]
    pub role: AttendeeRole,
}

impl Attendee {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            common_name: None,
            partstat: ParticipationStatus::NeedsAction,
            role: AttendeeRole::ReqParticipant,
        }
    }

    pub fn with_partstat(mut self, partstat: ParticipationStatus) -> Self {
        self.partstat = partstat;
        self
    }

    pub fn with_common_name(mut self, name: impl Into<String>) -> Self {
        self.common_name = Some(name.into());
        self
    }
}

/// 事件快照 - 变更提交后的事件状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub uid: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence: u32,
    pub organizer: Organizer,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
}

impl EventSnapshot {
    /// 创建最小事件
    pub fn new(
        uid: impl Into<String>,
        summary: impl Into<String>,
        start: DateTime<Utc>,
        organizer: impl AsRef<str>,
    ) -> Self {
        Self {
            uid: uid.into(),
            summary: summary.into(),
            description: None,
            location: None,
            start,
            end: None,
            sequence: 0,
            organizer: Organizer {
                address: normalize_address(organizer.as_ref()),
                common_name: None,
            },
            attendees: Vec::new(),
        }
    }

    pub fn with_attendee(mut self, attendee: Attendee) -> Self {
        self.attendees.push(attendee);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// 所有参与方地址：组织者在前，参与者按出现顺序去重
    pub fn participants(&self) -> Vec<&str> {
        let mut out: Vec<&str> = vec![self.organizer.address.as_str()];
        for attendee in &self.attendees {
            if !out.contains(&attendee.address.as_str()) {
                out.push(attendee.address.as_str());
            }
        }
        out
    }

    /// 查找参与者
    pub fn attendee(&self, address: &str) -> Option<&Attendee> {
        let address = normalize_address(address);
        self.attendees.iter().find(|a| a.address == address)
    }

    /// 是否为组织者
    pub fn is_organizer(&self, address: &str) -> bool {
        self.organizer.address == normalize_address(address)
    }
}

/// iTip 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItipMethod {
    Request,
    Cancel,
    Reply,
}

impl ItipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Cancel => "CANCEL",
            Self::Reply => "REPLY",
        }
    }

    pub fn from_ical(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "REQUEST" | "PUBLISH" => Some(Self::Request),
            "CANCEL" => Some(Self::Cancel),
            "REPLY" => Some(Self::Reply),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItipMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已提交的日历变更（日历服务回调的输入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarChange {
    /// 日历对象 ID
    pub object_id: String,
    /// 变更类型
    pub kind: ChangeKind,
    /// 变更后的事件状态（删除时为删除前的最后状态）
    pub event: EventSnapshot,
    /// 发起变更的用户地址（不通知自己）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// 标记为紧急（强制进入高优先级窗口）
    #[serde(default)]
    pub urgent: bool,
    /// 提交时间
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// 日历变更观察者 - 在启动时注册一次
pub trait ChangeObserver: Send + Sync {
    /// 变更已提交。实现不得让通知失败影响日历写入。
    fn on_change(&self, change: &CalendarChange);
}

/// 规范化邮件地址：去掉 mailto: 前缀，去空白，转小写
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let stripped = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("mailto:") => &trimmed[7..],
        _ => trimmed,
    };
    stripped.to_ascii_lowercase()
}
