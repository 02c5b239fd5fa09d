//! Ticket to unit audit trail.
//!
//! The [`AuditExtractor`] scans the primary log for ticket references
//! (`PROJ-123`) and associates each one with the unit whose
//! `execution start` marker is on the same line or on the next non-blank
//! line. It is informational and never fails a run.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::validate::grammar::{self, MarkerKind};

static TICKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?P<key>[A-Z][A-Z0-9]+)-(?P<num>\d+)\b").expect("ticket regex is valid")
});

/// One ticket and the units deployed under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketUnits {
    /// Ticket identifier.
    pub ticket: String,
    /// Units in first-appearance order, de-duplicated.
    pub units: Vec<String>,
}

/// Ticket → units, both in first-appearance order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditMapping {
    entries: Vec<TicketUnits>,
}

impl AuditMapping {
    /// Whether no tickets were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tickets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate tickets in order.
    pub fn iter(&self) -> impl Iterator<Item = &TicketUnits> {
        self.entries.iter()
    }

    /// Units recorded for `ticket`.
    #[must_use]
    pub fn units(&self, ticket: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.ticket == ticket)
            .map(|e| e.units.as_slice())
    }

    fn entry(&mut self, ticket: &str) -> &mut TicketUnits {
        let index = match self.entries.iter().position(|e| e.ticket == ticket) {
            Some(index) => index,
            None => {
                self.entries.push(TicketUnits {
                    ticket: ticket.to_string(),
                    units: Vec::new(),
                });
                self.entries.len() - 1
            },
        };
        &mut self.entries[index]
    }

    fn add(&mut self, ticket: &str, unit: Option<&str>) {
        let entry = self.entry(ticket);
        if let Some(unit) = unit {
            if !entry.units.iter().any(|u| u == unit) {
                entry.units.push(unit.to_string());
            }
        }
    }
}

/// Extracts an [`AuditMapping`] from a primary log.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditExtractor;

impl AuditExtractor {
    /// Create an extractor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Extract the mapping from the log at `path`.
    ///
    /// An unreadable log yields an empty mapping.
    #[must_use]
    pub fn extract(&self, path: &Path) -> AuditMapping {
        match grammar::read_lossy(path) {
            Ok(content) => {
                let mapping = self.extract_from_str(&content);
                info!(
                    path = %path.display(),
                    tickets = mapping.len(),
                    units = mapping.iter().map(|e| e.units.len()).sum::<usize>(),
                    "audit mapping extracted"
                );
                mapping
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read log for audit mapping");
                AuditMapping::default()
            },
        }
    }

    /// Extract the mapping from log text.
    #[must_use]
    pub fn extract_from_str(&self, content: &str) -> AuditMapping {
        let lines: Vec<&str> = content.lines().collect();
        let mut mapping = AuditMapping::default();

        for (index, line) in lines.iter().enumerate() {
            let tickets = tickets_in(line);
            if tickets.is_empty() {
                continue;
            }

            let unit = started_unit(line).or_else(|| {
                lines[index + 1..]
                    .iter()
                    .find(|l| !l.trim().is_empty())
                    .and_then(|next| started_unit(next))
            });
            for ticket in &tickets {
                mapping.add(ticket, unit.as_deref());
            }
        }

        mapping
    }
}

fn started_unit(line: &str) -> Option<String> {
    grammar::parse_marker(line)
        .filter(|m| m.kind == MarkerKind::Start)
        .map(|m| m.unit)
}

fn tickets_in(line: &str) -> Vec<String> {
    TICKET_RE
        .captures_iter(line)
        .filter(|caps| !grammar::is_error_code_prefix(&caps["key"]))
        .map(|caps| caps[0].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_on_marker_line() {
        let log = "\
/deploy/BANKING-408942/EG1_EGYPT_ISO_BRNPRM.INC - execution start
/deploy/BANKING-408942/EG1_EGYPT_ISO_BRNPRM.INC - execution end
/deploy/BANKING-408942/UNIT_B.DBP - execution start
";
        let mapping = AuditExtractor::new().extract_from_str(log);

        assert_eq!(mapping.len(), 1);
        assert_eq!(
            mapping.units("BANKING-408942").unwrap(),
            ["EG1_EGYPT_ISO_BRNPRM.INC", "UNIT_B.DBP"]
        );
    }

    #[test]
    fn test_ticket_followed_by_marker_line() {
        let log = "\
-- Deploying BANKING-123444

/deploy/UNIT_X.SQL - execution start
/deploy/UNIT_X.SQL - execution end
-- Deploying BANKING-123444 again
/deploy/UNIT_X.SQL - execution start
";
        let mapping = AuditExtractor::new().extract_from_str(log);
        assert_eq!(mapping.units("BANKING-123444").unwrap(), ["UNIT_X.SQL"]);
    }

    #[test]
    fn test_ticket_without_unit_is_kept_with_empty_list() {
        let mapping = AuditExtractor::new().extract_from_str("Release notes: OPS-7\nnothing\n");
        assert_eq!(mapping.units("OPS-7").unwrap(), [] as [String; 0]);
    }

    #[test]
    fn test_error_codes_are_not_tickets() {
        let log = "ORA-00942: table does not exist\nPLS-00201 SP2-0310 TNS-12541\n";
        assert!(AuditExtractor::new().extract_from_str(log).is_empty());
    }

    #[test]
    fn test_first_appearance_order() {
        let log = "\
/deploy/ZZ-2/A.sql - execution start
/deploy/AA-1/B.sql - execution start
/deploy/ZZ-2/C.sql - execution start
";
        let mapping = AuditExtractor::new().extract_from_str(log);
        let tickets: Vec<_> = mapping.iter().map(|e| e.ticket.as_str()).collect();
        assert_eq!(tickets, vec!["ZZ-2", "AA-1"]);
        assert_eq!(mapping.units("ZZ-2").unwrap(), ["A.sql", "C.sql"]);
    }

    #[test]
    fn test_unreadable_log_gives_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = AuditExtractor::new().extract(&dir.path().join("missing.log"));
        assert!(mapping.is_empty());
    }
}
