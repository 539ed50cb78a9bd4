//! 邮件模板渲染
//!
//! 模板按 `(locale, name)` 查找，查不到时依次回退到语言前缀（`de-CH` → `de`）和 `en`。
//! 变量语法为 `${name}`；模板引用了未提供的变量视为渲染失败。
//! `partstat.*` 条目是参与状态的本地化标签，没有变量。

use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// 模板变量
pub type TemplateVars = BTreeMap<String, String>;

/// 默认语言
pub const DEFAULT_LOCALE: &str = "en";

/// 模板渲染服务
pub trait TemplateRenderer: Send + Sync {
    /// 渲染指定模板
    fn render(&self, name: &str, locale: &str, vars: &TemplateVars) -> Result<String>;
}

/// 内置模板集合
pub struct BuiltinTemplates {
    templates: HashMap<(String, String), String>,
    placeholder: Regex,
}

const EN: &[(&str, &str)] = &[
    ("create_attendee.subject", "Invitation: ${summary}"),
    (
        "create_attendee.body",
        "Hello ${recipient},\n\n${actor} has invited you to \"${summary}\".\n\nWhen: ${start}${end}\nWhere: ${location}\nOrganizer: ${organizer}\nParticipants: ${attendees}\n",
    ),
    ("create_organizer.subject", "New appointment: ${summary}"),
    (
        "create_organizer.body",
        "Hello ${recipient},\n\n${actor} has created the appointment \"${summary}\" on your behalf.\n\nWhen: ${start}${end}\nWhere: ${location}\nParticipants: ${attendees}\n",
    ),
    ("update_attendee.subject", "Appointment changed: ${summary}"),
    (
        "update_attendee.body",
        "Hello ${recipient},\n\n${actor} has changed the appointment \"${summary}\".\n\nWhen: ${start}${end}\nWhere: ${location}\nOrganizer: ${organizer}\nParticipants: ${attendees}\n",
    ),
    ("update_organizer.subject", "Appointment changed: ${summary}"),
    (
        "update_organizer.body",
        "Hello ${recipient},\n\n${actor} has changed your appointment \"${summary}\".\n\nWhen: ${start}${end}\nWhere: ${location}\nParticipants: ${attendees}\n",
    ),
    ("delete_attendee.subject", "Cancelled: ${summary}"),
    (
        "delete_attendee.body",
        "Hello ${recipient},\n\n${actor} has cancelled the appointment \"${summary}\" scheduled for ${start}.\n",
    ),
    ("delete_organizer.subject", "Cancelled: ${summary}"),
    (
        "delete_organizer.body",
        "Hello ${recipient},\n\n${actor} has deleted your appointment \"${summary}\" scheduled for ${start}.\n",
    ),
    ("state_change_attendee.subject", "${attendee} ${partstat}: ${summary}"),
    (
        "state_change_attendee.body",
        "Hello ${recipient},\n\n${attendee} has ${partstat} the appointment \"${summary}\" on ${start}.\n",
    ),
    ("state_change_organizer.subject", "Reply from ${attendee}: ${summary}"),
    (
        "state_change_organizer.body",
        "Hello ${recipient},\n\n${attendee} has ${partstat} your invitation to \"${summary}\" on ${start}.\n",
    ),
    ("partstat.accepted", "accepted"),
    ("partstat.declined", "declined"),
    ("partstat.tentative", "tentatively accepted"),
    ("partstat.delegated", "delegated"),
    ("partstat.needs_action", "not yet answered"),
];

const DE: &[(&str, &str)] = &[
    ("create_attendee.subject", "Einladung: ${summary}"),
    (
        "create_attendee.body",
        "Hallo ${recipient},\n\n${actor} hat Sie zu \"${summary}\" eingeladen.\n\nWann: ${start}${end}\nWo: ${location}\nOrganisator: ${organizer}\nTeilnehmer: ${attendees}\n",
    ),
    ("create_organizer.subject", "Neuer Termin: ${summary}"),
    (
        "create_organizer.body",
        "Hallo ${recipient},\n\n${actor} hat den Termin \"${summary}\" in Ihrem Namen angelegt.\n\nWann: ${start}${end}\nWo: ${location}\nTeilnehmer: ${attendees}\n",
    ),
    ("update_attendee.subject", "Termin geändert: ${summary}"),
    (
        "update_attendee.body",
        "Hallo ${recipient},\n\n${actor} hat den Termin \"${summary}\" geändert.\n\nWann: ${start}${end}\nWo: ${location}\nOrganisator: ${organizer}\nTeilnehmer: ${attendees}\n",
    ),
    ("update_organizer.subject", "Termin geändert: ${summary}"),
    (
        "update_organizer.body",
        "Hallo ${recipient},\n\n${actor} hat Ihren Termin \"${summary}\" geändert.\n\nWann: ${start}${end}\nWo: ${location}\nTeilnehmer: ${attendees}\n",
    ),
    ("delete_attendee.subject", "Abgesagt: ${summary}"),
    (
        "delete_attendee.body",
        "Hallo ${recipient},\n\n${actor} hat den Termin \"${summary}\" am ${start} abgesagt.\n",
    ),
    ("delete_organizer.subject", "Abgesagt: ${summary}"),
    (
        "delete_organizer.body",
        "Hallo ${recipient},\n\n${actor} hat Ihren Termin \"${summary}\" am ${start} gelöscht.\n",
    ),
    ("state_change_attendee.subject", "${attendee} ${partstat}: ${summary}"),
    (
        "state_change_attendee.body",
        "Hallo ${recipient},\n\n${attendee} hat den Termin \"${summary}\" am ${start} ${partstat}.\n",
    ),
    ("state_change_organizer.subject", "Antwort von ${attendee}: ${summary}"),
    (
        "state_change_organizer.body",
        "Hallo ${recipient},\n\n${attendee} hat Ihre Einladung zu \"${summary}\" am ${start} ${partstat}.\n",
    ),
    ("partstat.accepted", "zugesagt"),
    ("partstat.declined", "abgesagt"),
    ("partstat.tentative", "vorläufig zugesagt"),
    ("partstat.delegated", "delegiert"),
    ("partstat.needs_action", "noch nicht beantwortet"),
];

const ZH: &[(&str, &str)] = &[
    ("create_attendee.subject", "会议邀请：${summary}"),
    (
        "create_attendee.body",
        "${recipient}，您好：\n\n${actor} 邀请您参加“${summary}”。\n\n时间：${start}${end}\n地点：${location}\n组织者：${organizer}\n参与者：${attendees}\n",
    ),
    ("create_organizer.subject", "新日程：${summary}"),
    (
        "create_organizer.body",
        "${recipient}，您好：\n\n${actor} 以您的名义创建了日程“${summary}”。\n\n时间：${start}${end}\n地点：${location}\n参与者：${attendees}\n",
    ),
    ("update_attendee.subject", "日程已变更：${summary}"),
    (
        "update_attendee.body",
        "${recipient}，您好：\n\n${actor} 修改了日程“${summary}”。\n\n时间：${start}${end}\n地点：${location}\n组织者：${organizer}\n参与者：${attendees}\n",
    ),
    ("update_organizer.subject", "日程已变更：${summary}"),
    (
        "update_organizer.body",
        "${recipient}，您好：\n\n${actor} 修改了您的日程“${summary}”。\n\n时间：${start}${end}\n地点：${location}\n参与者：${attendees}\n",
    ),
    ("delete_attendee.subject", "已取消：${summary}"),
    (
        "delete_attendee.body",
        "${recipient}，您好：\n\n${actor} 取消了 ${start} 的日程“${summary}”。\n",
    ),
    ("delete_organizer.subject", "已取消：${summary}"),
    (
        "delete_organizer.body",
        "${recipient}，您好：\n\n${actor} 删除了您 ${start} 的日程“${summary}”。\n",
    ),
    ("state_change_attendee.subject", "${attendee} ${partstat}：${summary}"),
    (
        "state_change_attendee.body",
        "${recipient}，您好：\n\n${attendee} 对 ${start} 的日程“${summary}”的回复：${partstat}。\n",
    ),
    ("state_change_organizer.subject", "${attendee} 的回复：${summary}"),
    (
        "state_change_organizer.body",
        "${recipient}，您好：\n\n${attendee} 对您的邀请“${summary}”（${start}）的回复：${partstat}。\n",
    ),
    ("partstat.accepted", "接受"),
    ("partstat.declined", "拒绝"),
    ("partstat.tentative", "暂定"),
    ("partstat.delegated", "已委托他人"),
    ("partstat.needs_action", "尚未答复"),
];

impl BuiltinTemplates {
    /// 加载内置的 en/de/zh 模板
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for (locale, set) in [("en", EN), ("de", DE), ("zh", ZH)] {
            for (name, text) in set {
                templates.insert((locale.to_string(), name.to_string()), text.to_string());
            }
        }
        Self {
            templates,
            placeholder: Self::placeholder_regex(),
        }
    }

    /// 空模板集合（只使用 `with_template` 添加的模板）
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
            placeholder: Self::placeholder_regex(),
        }
    }

    fn placeholder_regex() -> Regex {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
    }

    /// 添加或覆盖模板
    pub fn with_template(
        mut self,
        locale: impl Into<String>,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.templates
            .insert((locale.into(), name.into()), text.into());
        self
    }

    /// 按 locale 回退规则查找模板
    fn lookup(&self, name: &str, locale: &str) -> Option<&String> {
        let normalized = locale.replace('_', "-").to_lowercase();
        let language = normalized.split('-').next().unwrap_or(DEFAULT_LOCALE);

        [normalized.as_str(), language, DEFAULT_LOCALE]
            .iter()
            .find_map(|l| self.templates.get(&(l.to_string(), name.to_string())))
    }
}

impl Default for BuiltinTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, name: &str, locale: &str, vars: &TemplateVars) -> Result<String> {
        let template = self
            .lookup(name, locale)
            .ok_or_else(|| anyhow!("template '{}' not found for locale '{}'", name, locale))?;

        let mut missing: Vec<String> = Vec::new();
        let rendered = self
            .placeholder
            .replace_all(template, |caps: &regex::Captures| {
                let key = &caps[1];
                match vars.get(key) {
                    Some(v) => v.clone(),
                    None => {
                        missing.push(key.to_string());
                        String::new()
                    }
                }
            })
            .into_owned();

        if !missing.is_empty() {
            return Err(anyhow!(
                "template '{}' references missing variables: {}",
                name,
                missing.join(", ")
            ));
        }
        Ok(rendered)
    }
}
