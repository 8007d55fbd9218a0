//! Parser for long-form directory listings produced by device shells.
//!
//! Three line shapes are recognized, tried from the most specific to the least:
//! toybox/busybox `ls -l` with a link-count column, the older toolbox layout without it
//! (and without a size for directories), and the hex triplets printed by `adb ls`.
//! Lines that match none of them are dropped.

use std::error::Error;

use lazy_regex::{Lazy, Regex, lazy_regex, regex::Captures};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::{debug, trace};

pub use mode::mode_to_permissions;

use crate::{
    error::ExplorerError,
    models::{FileEntry, local_now},
    navigation,
};

mod mode;

static EXTENDED_LINE: Lazy<Regex> = lazy_regex!(
    r"^(?P<perm>[-dlcbsp?][-rwxsStT]{9})[.+@]?\s+\d+\s+(?P<owner>\S+)\s+(?P<group>\S+)\s+(?:(?P<dev>\d+,\s*\d+)|(?P<size>\d+))\s+(?P<date>\d{4}-\d{2}-\d{2} \d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?: [+-]\d{4})?|[A-Z][a-z]{2} +\d{1,2} +(?:\d{2}:\d{2}|\d{4})) (?P<name>.+)$"
);

static TRADITIONAL_LINE: Lazy<Regex> = lazy_regex!(
    r"^(?P<perm>[-dlcbsp?][-rwxsStT]{9})[.+@]?\s+(?P<owner>\S+)\s+(?P<group>\S+)\s+(?:(?:(?P<dev>\d+,\s*\d+)|(?P<size>\d+))\s+)?(?P<date>\d{4}-\d{2}-\d{2} \d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?: [+-]\d{4})?|[A-Z][a-z]{2} +\d{1,2} +(?:\d{2}:\d{2}|\d{4})) (?P<name>.+)$"
);

static HEX_LINE: Lazy<Regex> = lazy_regex!(
    r"^(?P<mode>[0-9a-fA-F]{8}) (?P<size>[0-9a-fA-F]{8}) (?P<mtime>[0-9a-fA-F]{8}) (?P<name>.+)$"
);

static TOTAL_LINE: Lazy<Regex> = lazy_regex!(r"^total\s+\d+$");

/// Entry as reported by `adb ls` or the sync protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub mode: u32,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: i64,
    pub name: String,
}

/// Parses a whole listing of `directory`. Unrecognized lines are logged and skipped.
pub fn parse_listing(text: &str, directory: &str) -> Vec<FileEntry> {
    parse_listing_at(text, directory, local_now())
}

pub(crate) fn parse_listing_at(
    text: &str,
    directory: &str,
    now: PrimitiveDateTime,
) -> Vec<FileEntry> {
    let lines = text.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.trim().is_empty());
    let mut entries = Vec::new();
    let mut first = true;
    for line in lines {
        if first && TOTAL_LINE.is_match(line.trim()) {
            first = false;
            continue;
        }
        first = false;
        match parse_line(line, directory, now) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => debug!(error = &e as &dyn Error, "Dropping listing line"),
        }
    }
    trace!(directory, count = entries.len(), "Parsed listing");
    entries
}

/// Parses one line. `Ok(None)` for the `.` and `..` entries.
pub fn parse_entry(line: &str, directory: &str) -> Result<Option<FileEntry>, ExplorerError> {
    parse_line(line.trim_end_matches('\r'), directory, local_now())
}

fn parse_line(
    line: &str,
    directory: &str,
    now: PrimitiveDateTime,
) -> Result<Option<FileEntry>, ExplorerError> {
    if let Some(caps) = EXTENDED_LINE.captures(line).or_else(|| TRADITIONAL_LINE.captures(line)) {
        return Ok(long_form_entry(&caps, directory, now));
    }
    if let Some(caps) = HEX_LINE.captures(line) {
        let raw = RawEntry {
            mode: u32::from_str_radix(&caps["mode"], 16).unwrap_or_default(),
            size: u64::from_str_radix(&caps["size"], 16).unwrap_or_default(),
            mtime: i64::from_str_radix(&caps["mtime"], 16).unwrap_or_default(),
            name: caps["name"].to_string(),
        };
        return Ok(entry_from_raw(raw, directory));
    }
    Err(ExplorerError::ParseRejected(line.to_string()))
}

fn long_form_entry(caps: &Captures, directory: &str, now: PrimitiveDateTime) -> Option<FileEntry> {
    let permissions = caps["perm"].to_string();
    let raw_name = &caps["name"];
    let (name, link_target) = if permissions.starts_with('l') {
        match raw_name.split_once(" -> ") {
            Some((name, target)) => (name, Some(target.to_string())),
            None => (raw_name, None),
        }
    } else {
        (raw_name, None)
    };
    let name = base_name(name)?;

    Some(FileEntry {
        path: navigation::join(directory, &name),
        name,
        permissions,
        owner: Some(caps["owner"].to_string()),
        group: Some(caps["group"].to_string()),
        device_numbers: caps.name("dev").map(|m| m.as_str().split_whitespace().collect()),
        size: caps.name("size").and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
        modified: parse_date(&caps["date"], now),
        link_target,
        link_target_kind: None,
    })
}

/// Builds an entry from numeric fields. `None` for `.` and `..`.
pub fn entry_from_raw(raw: RawEntry, directory: &str) -> Option<FileEntry> {
    let name = base_name(&raw.name)?;
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let modified = OffsetDateTime::from_unix_timestamp(raw.mtime)
        .ok()
        .map(|t| t.to_offset(offset))
        .map(|t| PrimitiveDateTime::new(t.date(), t.time()));
    Some(FileEntry {
        path: navigation::join(directory, &name),
        name,
        permissions: mode_to_permissions(raw.mode),
        owner: None,
        group: None,
        device_numbers: None,
        size: raw.size,
        modified,
        link_target: None,
        link_target_kind: None,
    })
}

/// Final path component, or `None` for `.` and `..`
fn base_name(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Some("/".to_string());
    }
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
    match base {
        "." | ".." => None,
        _ => Some(base.to_string()),
    }
}

fn parse_date(text: &str, now: PrimitiveDateTime) -> Option<PrimitiveDateTime> {
    if text.as_bytes().first().is_some_and(u8::is_ascii_digit) {
        let mut parts = text.split([' ', '-', ':']);
        let year: i32 = parts.next()?.parse().ok()?;
        let month: u8 = parts.next()?.parse().ok()?;
        let day: u8 = parts.next()?.parse().ok()?;
        let hour: u8 = parts.next()?.parse().ok()?;
        let minute: u8 = parts.next()?.parse().ok()?;
        let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
        return Some(PrimitiveDateTime::new(date, Time::from_hms(hour, minute, 0).ok()?));
    }

    let mut parts = text.split_whitespace();
    let month = month_from_abbrev(parts.next()?)?;
    let day: u8 = parts.next()?.parse().ok()?;
    let last = parts.next()?;
    match last.split_once(':') {
        Some((hour, minute)) => {
            let time = Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, 0).ok()?;
            let this_year = Date::from_calendar_date(now.year(), month, day)
                .ok()
                .map(|d| PrimitiveDateTime::new(d, time));
            match this_year {
                Some(candidate) if candidate <= now => Some(candidate),
                _ => Date::from_calendar_date(now.year() - 1, month, day)
                    .ok()
                    .map(|d| PrimitiveDateTime::new(d, time)),
            }
        }
        None => {
            let date = Date::from_calendar_date(last.parse().ok()?, month, day).ok()?;
            Some(PrimitiveDateTime::new(date, Time::MIDNIGHT))
        }
    }
}

fn month_from_abbrev(text: &str) -> Option<Month> {
    Some(match text {
        "Jan" => Month::January,
        "Feb" => Month::February,
        "Mar" => Month::March,
        "Apr" => Month::April,
        "May" => Month::May,
        "Jun" => Month::June,
        "Jul" => Month::July,
        "Aug" => Month::August,
        "Sep" => Month::September,
        "Oct" => Month::October,
        "Nov" => Month::November,
        "Dec" => Month::December,
        _ => return None,
    })
}
