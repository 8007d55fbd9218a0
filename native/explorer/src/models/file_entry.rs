use std::fmt;

use time::{PrimitiveDateTime, Weekday, macros::format_description};

use crate::navigation;

/// Node type, taken from the first permission character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
    Link,
    Character,
    Block,
    Socket,
    Fifo,
    Unknown,
}

impl FileKind {
    pub fn from_type_char(c: char) -> Self {
        match c {
            '-' => Self::File,
            'd' => Self::Directory,
            'l' => Self::Link,
            'c' => Self::Character,
            'b' => Self::Block,
            's' => Self::Socket,
            'p' => Self::Fifo,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Link => "link",
            Self::Character => "character device",
            Self::Block => "block device",
            Self::Socket => "socket",
            Self::Fifo => "fifo",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One filesystem node on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// 10-character `drwxr-xr-x` style string
    pub permissions: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// `major, minor` for block and character devices
    pub device_numbers: Option<String>,
    pub size: u64,
    pub modified: Option<PrimitiveDateTime>,
    /// Absolute, normalized path
    pub path: String,
    pub link_target: Option<String>,
    /// Resolved lazily, `None` until something asked
    pub link_target_kind: Option<FileKind>,
}

impl FileEntry {
    /// Bare directory entry for a path typed by the user
    pub fn directory_at(path: &str) -> Self {
        let path = navigation::normalize(path);
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            name,
            permissions: "d---------".to_string(),
            owner: None,
            group: None,
            device_numbers: None,
            size: 0,
            modified: None,
            path,
            link_target: None,
            link_target_kind: None,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.permissions.chars().next().map_or(FileKind::Unknown, FileKind::from_type_char)
    }

    pub fn is_directory(&self) -> bool {
        match self.kind() {
            FileKind::Directory => true,
            FileKind::Link => self.link_target_kind == Some(FileKind::Directory),
            _ => false,
        }
    }

    pub fn is_link(&self) -> bool {
        self.kind() == FileKind::Link
    }

    /// Directory containing this entry
    pub fn location(&self) -> String {
        match self.path.rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        }
    }

    pub fn human_size(&self) -> String {
        format_size(self.size)
    }

    /// Modification date bucketed relative to `now`
    pub fn human_date(&self, now: PrimitiveDateTime) -> String {
        self.modified.map(|modified| format_date(modified, now)).unwrap_or_default()
    }

    pub fn human_date_now(&self) -> String {
        self.human_date(local_now())
    }
}

/// Listing result for one directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub directory: String,
    pub entries: Vec<FileEntry>,
    /// stderr or tolerated exit text from the listing command
    pub diagnostics: Option<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn local_now() -> PrimitiveDateTime {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    PrimitiveDateTime::new(now.date(), now.time())
}

/// B/KB/MB/GB/TB ladder with two decimals, trailing zeros trimmed
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let text = format!("{:.2}", (value * 100.0).round() / 100.0);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text} {}", UNITS[unit])
}

fn format_date(modified: PrimitiveDateTime, now: PrimitiveDateTime) -> String {
    let clock = modified.format(format_description!("[hour]:[minute]")).unwrap_or_default();
    let days = (now.date() - modified.date()).whole_days();
    match days {
        0 => clock,
        1 => format!("Yesterday at {clock}"),
        2..=6 => format!("{} at {clock}", weekday_name(modified.weekday())),
        _ if modified.year() == now.year() => modified
            .format(format_description!("[day padding:none] [month repr:short]"))
            .unwrap_or_default(),
        _ => modified
            .format(format_description!("[day padding:none] [month repr:short] [year]"))
            .unwrap_or_default(),
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "Monday",
        Weekday::Tuesday => "Tuesday",
        Weekday::Wednesday => "Wednesday",
        Weekday::Thursday => "Thursday",
        Weekday::Friday => "Friday",
        Weekday::Saturday => "Saturday",
        Weekday::Sunday => "Sunday",
    }
}
