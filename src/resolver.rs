//! 目录解析 - 从 JSON 目录把收件人地址解析为参与者信息
//!
//! 目录文件格式：
//! ```json
//! {
//!   "allow_external": true,
//!   "users": [
//!     { "address": "bob@example.com", "display_name": "Bob", "locale": "de", "utc_offset_minutes": 60 }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::calendar::normalize_address;
use crate::notification::generator::{Participant, ParticipantResolver};
use crate::notification::template::DEFAULT_LOCALE;

/// 目录中的用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// 已删除用户不再收到邮件
    #[serde(default)]
    pub deleted: bool,
    /// 访客账号不收邮件
    #[serde(default)]
    pub guest: bool,
}

impl DirectoryEntry {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            display_name: None,
            locale: None,
            utc_offset_minutes: 0,
            deleted: false,
            guest: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn guest(mut self) -> Self {
        self.guest = true;
        self
    }

    fn to_participant(&self) -> Participant {
        Participant {
            address: self.address.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| self.address.clone()),
            locale: self
                .locale
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }
}

fn default_allow_external() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default = "default_allow_external")]
    allow_external: bool,
    #[serde(default)]
    users: Vec<DirectoryEntry>,
}

/// 基于内存目录的参与者解析
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    entries: HashMap<String, DirectoryEntry>,
    /// 目录外的地址是否作为外部参与者处理
    allow_external: bool,
}

impl DirectoryResolver {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            allow_external: true,
        }
    }

    /// 从 JSON 文件加载
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid directory file {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: DirectoryFile = serde_json::from_str(content)?;
        let mut resolver = Self::new().with_external(file.allow_external);
        for entry in file.users {
            resolver.insert(entry);
        }
        debug!(users = resolver.len(), "Directory loaded");
        Ok(resolver)
    }

    pub fn with_external(mut self, allow: bool) -> Self {
        self.allow_external = allow;
        self
    }

    pub fn with_entry(mut self, entry: DirectoryEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn insert(&mut self, mut entry: DirectoryEntry) {
        entry.address = normalize_address(&entry.address);
        self.entries.insert(entry.address.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DirectoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantResolver for DirectoryResolver {
    fn resolve(&self, address: &str) -> Result<Option<Participant>> {
        let address = normalize_address(address);
        match self.entries.get(&address) {
            Some(entry) if entry.deleted || entry.guest => Ok(None),
            Some(entry) => Ok(Some(entry.to_participant())),
            None if self.allow_external => Ok(Some(Participant::external(address))),
            None => Ok(None),
        }
    }

    fn display_name(&self, address: &str) -> Option<String> {
        let address = normalize_address(address);
        self.entries
            .get(&address)
            .and_then(|entry| entry.display_name.clone())
    }
}
