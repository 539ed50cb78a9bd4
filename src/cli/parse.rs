//! Parse 命令 - 解析 iCalendar 文件并打印事件

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

use super::print_output;
use crate::calendar::ical::{parse_calendar, ParsedCalendar};

/// Parse 命令参数
#[derive(Args, Debug)]
pub struct ParseArgs {
    /// .ics 文件
    pub file: PathBuf,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// 处理 parse 命令
pub fn handle_parse(args: ParseArgs) -> Result<()> {
    let content = fs::read_to_string(&args.file)
        .with_context(|| format!("Cannot read {}", args.file.display()))?;
    let parsed = parse_calendar(&content)
        .with_context(|| format!("Invalid calendar data in {}", args.file.display()))?;

    if args.json {
        let value = json!({
            "method": parsed.method.map(|m| m.as_str()),
            "event": parsed.event,
        });
        println!("{}", print_output(&value)?);
    } else {
        print!("{}", describe(&parsed));
    }
    Ok(())
}

/// 文本摘要
pub fn describe(parsed: &ParsedCalendar) -> String {
    let event = &parsed.event;
    let mut out = String::new();
    if let Some(method) = parsed.method {
        out.push_str(&format!("method:    {}\n", method));
    }
    out.push_str(&format!("uid:       {}\n", event.uid));
    out.push_str(&format!("summary:   {}\n", event.summary));
    out.push_str(&format!("start:     {}\n", event.start.to_rfc3339()));
    if let Some(end) = event.end {
        out.push_str(&format!("end:       {}\n", end.to_rfc3339()));
    }
    if let Some(location) = &event.location {
        out.push_str(&format!("location:  {}\n", location));
    }
    out.push_str(&format!("sequence:  {}\n", event.sequence));
    out.push_str(&format!("organizer: {}\n", event.organizer.address));
    for attendee in &event.attendees {
        out.push_str(&format!(
            "attendee:  {} [{} {}]\n",
            attendee.address,
            attendee.partstat.as_ical(),
            attendee.role.as_ical()
        ));
    }
    out
}
