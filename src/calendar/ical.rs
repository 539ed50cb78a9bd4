//! iCalendar 解析与 iTip 输出
//!
//! 语法层（折行、转义、参数、VTIMEZONE）交给 `calcard`，这里只负责
//! 与 [`EventSnapshot`] 之间的映射。带 RECURRENCE-ID 的例外实例会被跳过。
//!
//! 时间处理：带 TZID 的时间先按日历内的 VTIMEZONE（或 IANA 名称）换算，
//! 统一存成 UTC；浮动时间按 UTC 解释。

use anyhow::{anyhow, bail, Result};
use calcard::common::PartialDateTime;
use calcard::icalendar::{
    ICalendar, ICalendarComponent, ICalendarComponentType, ICalendarEntry, ICalendarMethod,
    ICalendarParameter, ICalendarParameterName, ICalendarParameterValue,
    ICalendarParticipationRole, ICalendarParticipationStatus, ICalendarProperty, ICalendarStatus,
    ICalendarValue, Uri,
};
use calcard::{Entry, Parser};
use chrono::{DateTime, TimeZone, Utc};

use super::{
    normalize_address, Attendee, AttendeeRole, EventSnapshot, ItipMethod, Organizer,
    ParticipationStatus,
};

/// PRODID 标识
pub const PRODID: &str = "-//itip-notify-pool//EN";

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCalendar {
    /// VCALENDAR 上的 METHOD（可能缺失）
    pub method: Option<ItipMethod>,
    /// 主事件
    pub event: EventSnapshot,
}

/// 解析 iCalendar 文本，返回第一个主 VEVENT
pub fn parse_calendar(input: &str) -> Result<ParsedCalendar> {
    let ical = match Parser::new(input).entry() {
        Entry::ICalendar(ical) => ical,
        _ => bail!("input is not an iCalendar object"),
    };

    let method = ical
        .components
        .iter()
        .filter(|c| c.component_type == ICalendarComponentType::VCalendar)
        .flat_map(|c| c.entries.iter())
        .find(|e| e.name == ICalendarProperty::Method)
        .and_then(|e| match e.values.first() {
            Some(ICalendarValue::Method(method)) => itip_method_of(method),
            Some(ICalendarValue::Text(text)) => ItipMethod::from_ical(text),
            _ => None,
        });

    let component = ical
        .components
        .iter()
        .find(|c| {
            c.component_type == ICalendarComponentType::VEvent
                && !c.entries.iter().any(|e| e.name == ICalendarProperty::RecurrenceId)
        })
        .ok_or_else(|| anyhow!("no VEVENT found"))?;

    let event = build_event(&ical, component)?;
    Ok(ParsedCalendar { method, event })
}

fn build_event(ical: &ICalendar, component: &ICalendarComponent) -> Result<EventSnapshot> {
    let find = |name: ICalendarProperty| component.entries.iter().find(|e| e.name == name);

    let uid = find(ICalendarProperty::Uid)
        .and_then(text_of)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("VEVENT without UID"))?;

    let tz_resolver = ical.build_tz_resolver();
    let date_time = |entry: &ICalendarEntry| -> Result<DateTime<Utc>> {
        let timestamp = match entry.values.first() {
            Some(ICalendarValue::PartialDateTime(date)) => date
                .to_date_time_with_tz(tz_resolver.resolve_or_default(entry.tz_id()))
                .map(|dt| dt.timestamp())
                .or_else(|| date.to_timestamp()),
            _ => None,
        };
        timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .ok_or_else(|| anyhow!("invalid {:?} value", entry.name))
    };

    let start = find(ICalendarProperty::Dtstart)
        .ok_or_else(|| anyhow!("VEVENT {} without DTSTART", uid))
        .and_then(|e| date_time(e))?;
    let end = find(ICalendarProperty::Dtend).map(|e| date_time(e)).transpose()?;

    let organizer_entry = find(ICalendarProperty::Organizer)
        .ok_or_else(|| anyhow!("VEVENT {} without ORGANIZER", uid))?;
    let organizer = Organizer {
        address: address_of(organizer_entry)
            .ok_or_else(|| anyhow!("VEVENT {} has an empty ORGANIZER", uid))?,
        common_name: common_name_of(organizer_entry),
    };

    let sequence = match find(ICalendarProperty::Sequence).and_then(|e| e.values.first()) {
        Some(ICalendarValue::Integer(seq)) => {
            u32::try_from(*seq).map_err(|_| anyhow!("invalid SEQUENCE {}", seq))?
        }
        Some(_) => bail!("invalid SEQUENCE in VEVENT {}", uid),
        None => 0,
    };

    let attendees = component
        .entries
        .iter()
        .filter(|e| e.name == ICalendarProperty::Attendee)
        .filter_map(|entry| {
            let address = address_of(entry)?;
            let mut attendee = Attendee {
                address,
                common_name: common_name_of(entry),
                partstat: ParticipationStatus::default(),
                role: AttendeeRole::default(),
            };
            for param in &entry.params {
                match (&param.name, &param.value) {
                    (ICalendarParameterName::Partstat, ICalendarParameterValue::Partstat(value)) => {
                        attendee.partstat = partstat_of(value);
                    }
                    (ICalendarParameterName::Role, ICalendarParameterValue::Role(value)) => {
                        attendee.role = role_of(value);
                    }
                    _ => {}
                }
            }
            Some(attendee)
        })
        .collect();

    Ok(EventSnapshot {
        uid,
        summary: find(ICalendarProperty::Summary).and_then(text_of).unwrap_or_default(),
        description: find(ICalendarProperty::Description).and_then(text_of),
        location: find(ICalendarProperty::Location).and_then(text_of),
        start,
        end,
        sequence,
        organizer,
        attendees,
    })
}

/// 文本属性值；被拆成多个值时按逗号拼回
fn text_of(entry: &ICalendarEntry) -> Option<String> {
    let parts: Vec<&str> = entry.values.iter().filter_map(|v| v.as_text()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn address_of(entry: &ICalendarEntry) -> Option<String> {
    let raw = match entry.values.first()? {
        ICalendarValue::Uri(Uri::Location(value)) => value.as_str(),
        ICalendarValue::Text(value) => value.as_str(),
        _ => return None,
    };
    let address = normalize_address(raw);
    (!address.is_empty()).then_some(address)
}

fn common_name_of(entry: &ICalendarEntry) -> Option<String> {
    entry.params.iter().find_map(|param| match (&param.name, &param.value) {
        (ICalendarParameterName::Cn, ICalendarParameterValue::Text(name)) => Some(name.clone()),
        _ => None,
    })
}

fn itip_method_of(method: &ICalendarMethod) -> Option<ItipMethod> {
    match method {
        ICalendarMethod::Request | ICalendarMethod::Publish => Some(ItipMethod::Request),
        ICalendarMethod::Cancel => Some(ItipMethod::Cancel),
        ICalendarMethod::Reply => Some(ItipMethod::Reply),
        _ => None,
    }
}

fn ical_method(method: ItipMethod) -> ICalendarMethod {
    match method {
        ItipMethod::Request => ICalendarMethod::Request,
        ItipMethod::Cancel => ICalendarMethod::Cancel,
        ItipMethod::Reply => ICalendarMethod::Reply,
    }
}

fn partstat_of(value: &ICalendarParticipationStatus) -> ParticipationStatus {
    match value {
        ICalendarParticipationStatus::Accepted => ParticipationStatus::Accepted,
        ICalendarParticipationStatus::Declined => ParticipationStatus::Declined,
        ICalendarParticipationStatus::Tentative => ParticipationStatus::Tentative,
        ICalendarParticipationStatus::Delegated => ParticipationStatus::Delegated,
        _ => ParticipationStatus::NeedsAction,
    }
}

fn ical_partstat(value: ParticipationStatus) -> ICalendarParticipationStatus {
    match value {
        ParticipationStatus::NeedsAction => ICalendarParticipationStatus::NeedsAction,
        ParticipationStatus::Accepted => ICalendarParticipationStatus::Accepted,
        ParticipationStatus::Declined => ICalendarParticipationStatus::Declined,
        ParticipationStatus::Tentative => ICalendarParticipationStatus::Tentative,
        ParticipationStatus::Delegated => ICalendarParticipationStatus::Delegated,
    }
}

fn role_of(value: &ICalendarParticipationRole) -> AttendeeRole {
    match value {
        ICalendarParticipationRole::Chair => AttendeeRole::Chair,
        ICalendarParticipationRole::OptParticipant => AttendeeRole::OptParticipant,
        ICalendarParticipationRole::NonParticipant => AttendeeRole::NonParticipant,
        _ => AttendeeRole::ReqParticipant,
    }
}

fn ical_role(value: AttendeeRole) -> ICalendarParticipationRole {
    match value {
        AttendeeRole::Chair => ICalendarParticipationRole::Chair,
        AttendeeRole::ReqParticipant => ICalendarParticipationRole::ReqParticipant,
        AttendeeRole::OptParticipant => ICalendarParticipationRole::OptParticipant,
        AttendeeRole::NonParticipant => ICalendarParticipationRole::NonParticipant,
    }
}

fn utc_date_time(dt: &DateTime<Utc>) -> ICalendarValue {
    ICalendarValue::PartialDateTime(Box::new(PartialDateTime::from_utc_timestamp(dt.timestamp())))
}

fn cal_address(address: &str) -> ICalendarValue {
    ICalendarValue::Uri(Uri::Location(format!("mailto:{}", address)))
}

fn cn_param(name: &str) -> ICalendarParameter {
    ICalendarParameter {
        name: ICalendarParameterName::Cn,
        value: ICalendarParameterValue::Text(name.to_string()),
    }
}

fn text_entry(name: ICalendarProperty, value: &str) -> ICalendarEntry {
    ICalendarEntry {
        name,
        params: vec![],
        values: vec![ICalendarValue::Text(value.to_string())],
    }
}

/// 生成 iTip 日历正文
///
/// REPLY 只携带回复者自己的 ATTENDEE 行；CANCEL 附带 `STATUS:CANCELLED`。
/// 所有时间以 UTC 输出，因此不需要附带 VTIMEZONE。
pub fn write_itip(
    method: ItipMethod,
    event: &EventSnapshot,
    replying_attendee: Option<&str>,
    dtstamp: DateTime<Utc>,
) -> String {
    let mut envelope = ICalendarComponent {
        component_type: ICalendarComponentType::VCalendar,
        entries: vec![
            text_entry(ICalendarProperty::Version, "2.0"),
            text_entry(ICalendarProperty::Prodid, PRODID),
            ICalendarEntry {
                name: ICalendarProperty::Method,
                params: vec![],
                values: vec![ICalendarValue::Method(ical_method(method))],
            },
        ],
        component_ids: vec![],
    };
    envelope.component_ids.push(1);

    let mut vevent = ICalendarComponent {
        component_type: ICalendarComponentType::VEvent,
        entries: Vec::with_capacity(event.attendees.len() + 10),
        component_ids: vec![],
    };
    vevent.add_uid(&event.uid);
    vevent.add_dtstamp(PartialDateTime::from_utc_timestamp(dtstamp.timestamp()));
    vevent.add_sequence(i64::from(event.sequence));
    vevent.add_property(ICalendarProperty::Dtstart, utc_date_time(&event.start));
    if let Some(end) = &event.end {
        vevent.add_property(ICalendarProperty::Dtend, utc_date_time(end));
    }
    vevent.entries.push(text_entry(ICalendarProperty::Summary, &event.summary));
    if let Some(location) = &event.location {
        vevent.entries.push(text_entry(ICalendarProperty::Location, location));
    }
    if let Some(description) = &event.description {
        vevent.entries.push(text_entry(ICalendarProperty::Description, description));
    }

    vevent.entries.push(ICalendarEntry {
        name: ICalendarProperty::Organizer,
        params: event.organizer.common_name.as_deref().map(cn_param).into_iter().collect(),
        values: vec![cal_address(&event.organizer.address)],
    });

    let replying = replying_attendee.map(normalize_address);
    for attendee in &event.attendees {
        if method == ItipMethod::Reply && replying.as_deref() != Some(attendee.address.as_str()) {
            continue;
        }
        let mut params: Vec<ICalendarParameter> =
            attendee.common_name.as_deref().map(cn_param).into_iter().collect();
        params.push(ICalendarParameter {
            name: ICalendarParameterName::Role,
            value: ICalendarParameterValue::Role(ical_role(attendee.role)),
        });
        params.push(ICalendarParameter::partstat(ical_partstat(attendee.partstat)));
        vevent.entries.push(ICalendarEntry {
            name: ICalendarProperty::Attendee,
            params,
            values: vec![cal_address(&attendee.address)],
        });
    }

    if method == ItipMethod::Cancel {
        vevent.add_property(
            ICalendarProperty::Status,
            ICalendarValue::Status(ICalendarStatus::Cancelled),
        );
    }

    ICalendar {
        components: vec![envelope, vevent],
    }
    .to_string()
}
