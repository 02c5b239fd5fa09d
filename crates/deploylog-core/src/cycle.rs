//! Weekly deployment cycle naming.
//!
//! A deployment cycle is a calendar week anchored on a reference weekday
//! (Friday unless configured otherwise). The reference day and the two days
//! after it belong to the cycle of that reference day; the remaining days
//! belong to the cycle of the next reference day.
//!
//! Cycle identifiers have the form `{Mon}_week{NN}_{YYYY}`, for example
//! `Mar_week10_2024`. Month and year are taken from the anchor date, and
//! the week number counts reference days since the first one of that year.
//!
//! Cycles are never stored: the identifier is recomputed from the
//! processing date every time.

use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate, Weekday};

/// Reference weekday used when none is configured.
pub const DEFAULT_REFERENCE_WEEKDAY: Weekday = Weekday::Fri;

/// Days after the reference day that still roll back to it.
const ROLLBACK_DAYS: u32 = 2;

/// The reference day that anchors `date`'s cycle.
#[must_use]
pub fn anchor_date(date: NaiveDate, reference: Weekday) -> NaiveDate {
    let since_reference = (date.weekday().num_days_from_monday() + 7
        - reference.num_days_from_monday())
        % 7;

    if since_reference <= ROLLBACK_DAYS {
        date.checked_sub_days(Days::new(u64::from(since_reference)))
    } else {
        date.checked_add_days(Days::new(u64::from(7 - since_reference)))
    }
    .unwrap_or(date)
}

/// First `reference` weekday in `year`.
fn first_reference_day(year: i32, reference: Weekday) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, 1, reference, 1)
}

/// Week number of `date`'s cycle within the anchor's year (1-based).
#[must_use]
pub fn week_number(date: NaiveDate, reference: Weekday) -> u32 {
    let anchor = anchor_date(date, reference);
    first_reference_day(anchor.year(), reference)
        .map_or(1, |first| 1 + (anchor.ordinal0() - first.ordinal0()) / 7)
}

/// Cycle identifier for `date`.
#[must_use]
pub fn cycle_name(date: NaiveDate, reference: Weekday) -> String {
    let anchor = anchor_date(date, reference);
    format!(
        "{}_week{:02}_{}",
        anchor.format("%b"),
        week_number(date, reference),
        anchor.year()
    )
}

/// A cycle identifier joined with the archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCycle {
    name: String,
    anchor: NaiveDate,
    base: PathBuf,
}

impl DeploymentCycle {
    /// Cycle for `date` anchored on [`DEFAULT_REFERENCE_WEEKDAY`].
    #[must_use]
    pub fn for_date(base: impl Into<PathBuf>, date: NaiveDate) -> Self {
        Self::anchored(base, date, DEFAULT_REFERENCE_WEEKDAY)
    }

    /// Cycle for `date` anchored on `reference`.
    #[must_use]
    pub fn anchored(base: impl Into<PathBuf>, date: NaiveDate, reference: Weekday) -> Self {
        Self {
            name: cycle_name(date, reference),
            anchor: anchor_date(date, reference),
            base: base.into(),
        }
    }

    /// The cycle identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The reference day of this cycle.
    #[must_use]
    pub const fn anchor(&self) -> NaiveDate {
        self.anchor
    }

    /// Archive root.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `{base}/{name}`.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.base.join(&self.name)
    }
}

impl std::fmt::Display for DeploymentCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekend_rolls_back_to_friday() {
        // 2024-03-08 is a Friday.
        let friday = cycle_name(date(2024, 3, 8), Weekday::Fri);
        assert_eq!(friday, "Mar_week10_2024");
        assert_eq!(cycle_name(date(2024, 3, 9), Weekday::Fri), friday);
        assert_eq!(cycle_name(date(2024, 3, 10), Weekday::Fri), friday);
        assert_ne!(cycle_name(date(2024, 3, 11), Weekday::Fri), friday);
    }

    #[test]
    fn test_weekdays_roll_forward() {
        // Monday to Thursday belong to the following Friday.
        for day in 11..=14 {
            assert_eq!(cycle_name(date(2024, 3, day), Weekday::Fri), "Mar_week11_2024");
        }
        assert_eq!(cycle_name(date(2024, 3, 15), Weekday::Fri), "Mar_week11_2024");
    }

    #[test]
    fn test_first_week_of_year() {
        // 2024-01-05 is the first Friday of 2024.
        assert_eq!(cycle_name(date(2024, 1, 1), Weekday::Fri), "Jan_week01_2024");
        assert_eq!(cycle_name(date(2024, 1, 7), Weekday::Fri), "Jan_week01_2024");
        assert_eq!(cycle_name(date(2024, 1, 8), Weekday::Fri), "Jan_week02_2024");
    }

    #[test]
    fn test_month_and_year_follow_the_anchor() {
        // Sunday 2023-12-31 rolls back to Friday 2023-12-29.
        assert_eq!(cycle_name(date(2023, 12, 31), Weekday::Fri), "Dec_week52_2023");
        // Monday 2024-04-29 rolls forward to Friday 2024-05-03.
        assert_eq!(cycle_name(date(2024, 4, 29), Weekday::Fri), "May_week18_2024");
    }

    #[test]
    fn test_other_reference_weekday() {
        // 2024-03-07 is a Thursday.
        let thursday = cycle_name(date(2024, 3, 7), Weekday::Thu);
        assert_eq!(cycle_name(date(2024, 3, 9), Weekday::Thu), thursday);
        assert_ne!(cycle_name(date(2024, 3, 10), Weekday::Thu), thursday);
    }

    #[test]
    fn test_deployment_cycle_path() {
        let cycle = DeploymentCycle::for_date("/srv/audit", date(2024, 3, 9));
        assert_eq!(cycle.name(), "Mar_week10_2024");
        assert_eq!(cycle.anchor(), date(2024, 3, 8));
        assert_eq!(cycle.path(), PathBuf::from("/srv/audit/Mar_week10_2024"));
        assert_eq!(cycle.to_string(), "Mar_week10_2024");
    }
}
