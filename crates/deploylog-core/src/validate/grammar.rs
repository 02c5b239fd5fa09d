//! Line grammar of the deployment logs.
//!
//! All markers are matched case-insensitively. Logs are decoded as lossy
//! UTF-8 so that stray bytes never abort a scan.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Object types that may appear in the secondary log, longest first so
/// that `PACKAGE BODY` wins over `PACKAGE`.
pub const KNOWN_OBJECT_TYPES: &[&str] = &[
    "MATERIALIZED VIEW",
    "PACKAGE BODY",
    "TYPE BODY",
    "JAVA SOURCE",
    "JAVA CLASS",
    "PROCEDURE",
    "FUNCTION",
    "PACKAGE",
    "TRIGGER",
    "SYNONYM",
    "SEQUENCE",
    "LIBRARY",
    "TABLE",
    "INDEX",
    "VIEW",
    "TYPE",
];

/// Statuses that count as healthy.
const OK_STATUSES: [&str; 2] = ["VALID", "OK"];

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<path>.*?)\s+-\s*execution\s+(?P<kind>start|end|skipped)\b")
        .expect("marker regex is valid")
});

static ERROR_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ORA-\d{4,5}|PLS-\d{4,5}|SP2-\d{4}|TNS-\d{4,5})\b|\bcompilation errors\b")
        .expect("error code regex is valid")
});

static INVALID_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)number\s+of\s+invalids\s+at\s+(?P<when>start|end)\s*:?\s*(?P<count>\d+)")
        .expect("invalid count regex is valid")
});

/// Read a log as lossy UTF-8.
pub fn read_lossy(path: &Path) -> std::io::Result<String> {
    std::fs::read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Kind of execution marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `execution start`
    Start,
    /// `execution end`
    End,
    /// `execution skipped`
    Skipped,
}

impl MarkerKind {
    /// Whether the marker terminates a unit.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Skipped)
    }
}

/// An execution marker found on a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Unit name (final path component before ` - execution`).
    pub unit: String,
    /// Marker kind.
    pub kind: MarkerKind,
}

/// Parse an execution marker from `line`.
#[must_use]
pub fn parse_marker(line: &str) -> Option<Marker> {
    let caps = MARKER_RE.captures(line)?;
    let unit = caps
        .name("path")?
        .as_str()
        .trim()
        .rsplit(['/', '\\'])
        .next()?
        .trim();
    if unit.is_empty() {
        return None;
    }
    let kind = match caps.name("kind")?.as_str().to_ascii_lowercase().as_str() {
        "start" => MarkerKind::Start,
        "end" => MarkerKind::End,
        _ => MarkerKind::Skipped,
    };
    Some(Marker {
        unit: unit.to_string(),
        kind,
    })
}

/// Every error code on `line`, upper-cased, in order.
pub fn error_codes(line: &str) -> impl Iterator<Item = String> + '_ {
    ERROR_CODE_RE
        .find_iter(line)
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Whether `word` is (case-insensitively) an error-code family prefix.
#[must_use]
pub fn is_error_code_prefix(word: &str) -> bool {
    ["ORA", "PLS", "SP2", "TNS"]
        .iter()
        .any(|p| p.eq_ignore_ascii_case(word))
}

/// `Number of invalids at start|end: N` summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCount {
    /// Count before deployment.
    Start(u64),
    /// Count after deployment.
    End(u64),
}

/// Parse a summary count line.
#[must_use]
pub fn parse_invalid_count(line: &str) -> Option<InvalidCount> {
    let caps = INVALID_COUNT_RE.captures(line)?;
    let count = caps.name("count")?.as_str().parse().ok()?;
    if caps.name("when")?.as_str().eq_ignore_ascii_case("start") {
        Some(InvalidCount::Start(count))
    } else {
        Some(InvalidCount::End(count))
    }
}

/// An object status row from the secondary log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    /// Object name.
    pub name: String,
    /// Object type, upper-cased.
    pub object_type: String,
    /// Status, upper-cased.
    pub status: String,
}

impl ObjectRow {
    /// Whether the object is in a healthy state.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        OK_STATUSES.contains(&self.status.as_str())
    }
}

/// Outcome of parsing a secondary-log line as an object row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowParse {
    /// A well-formed row.
    Row(ObjectRow),
    /// Names a known object type but does not have the row shape.
    Malformed,
    /// Not an object row.
    NotARow,
}

fn known_type(text: &str) -> Option<&'static str> {
    KNOWN_OBJECT_TYPES
        .iter()
        .copied()
        .find(|t| t.eq_ignore_ascii_case(text))
}

/// Parse `NAME TYPE STATUS` or `NAME | TYPE | STATUS`.
#[must_use]
pub fn parse_object_row(line: &str) -> RowParse {
    let line = line.trim();
    if line.is_empty() {
        return RowParse::NotARow;
    }

    if line.contains('|') {
        return parse_pipe_row(line);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return RowParse::NotARow;
    }

    for object_type in KNOWN_OBJECT_TYPES {
        let width = object_type.split(' ').count();
        if tokens.len() < 1 + width {
            continue;
        }
        if !known_type(&tokens[1..=width].join(" ")).is_some_and(|t| t == *object_type) {
            continue;
        }
        let status = &tokens[1 + width..];
        if status.is_empty() {
            return RowParse::Malformed;
        }
        return RowParse::Row(ObjectRow {
            name: tokens[0].to_string(),
            object_type: (*object_type).to_string(),
            status: status.join(" ").to_ascii_uppercase(),
        });
    }

    RowParse::NotARow
}

fn parse_pipe_row(line: &str) -> RowParse {
    let fields: Vec<&str> = line
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .collect();
    let names_type = fields.iter().any(|f| known_type(f).is_some());

    match fields.as_slice() {
        [name, object_type, status] => match known_type(object_type) {
            Some(t) if !name.is_empty() && !status.is_empty() => RowParse::Row(ObjectRow {
                name: (*name).to_string(),
                object_type: t.to_string(),
                status: status.to_ascii_uppercase(),
            }),
            Some(_) => RowParse::Malformed,
            None if names_type => RowParse::Malformed,
            None => RowParse::NotARow,
        },
        _ if names_type => RowParse::Malformed,
        _ => RowParse::NotARow,
    }
}
