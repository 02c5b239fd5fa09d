//! Property tests for weekly cycle naming.
//!
//! A deployment weekend (Friday through Sunday) must always file into one
//! cycle, and cycles must advance monotonically with the calendar.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use deploylog_core::cycle::{DEFAULT_REFERENCE_WEEKDAY, anchor_date, cycle_name};
use proptest::prelude::*;

/// Any date between 2000-01-01 and roughly 2060.
fn any_date() -> impl Strategy<Value = NaiveDate> {
    (0u64..22_000).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap()
    })
}

fn next_weekday(date: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut d = date;
    while d.weekday() != weekday {
        d = d.succ_opt().unwrap();
    }
    d
}

proptest! {
    #[test]
    fn prop_weekend_shares_one_cycle(date in any_date()) {
        let friday = next_weekday(date, Weekday::Fri);
        let saturday = friday.succ_opt().unwrap();
        let sunday = saturday.succ_opt().unwrap();
        let monday = sunday.succ_opt().unwrap();

        let name = cycle_name(friday, DEFAULT_REFERENCE_WEEKDAY);
        prop_assert_eq!(&cycle_name(saturday, DEFAULT_REFERENCE_WEEKDAY), &name);
        prop_assert_eq!(&cycle_name(sunday, DEFAULT_REFERENCE_WEEKDAY), &name);
        prop_assert_ne!(&cycle_name(monday, DEFAULT_REFERENCE_WEEKDAY), &name);
    }

    #[test]
    fn prop_anchor_is_reference_weekday(date in any_date()) {
        let anchor = anchor_date(date, DEFAULT_REFERENCE_WEEKDAY);
        prop_assert_eq!(anchor.weekday(), Weekday::Fri);
        let distance = (anchor - date).num_days();
        prop_assert!((-2..=4).contains(&distance), "distance {distance}");
    }

    #[test]
    fn prop_anchors_are_monotonic(date in any_date(), step in 1u64..30) {
        let later = date.checked_add_days(Days::new(step)).unwrap();
        prop_assert!(
            anchor_date(date, DEFAULT_REFERENCE_WEEKDAY)
                <= anchor_date(later, DEFAULT_REFERENCE_WEEKDAY)
        );
    }

    #[test]
    fn prop_name_shape(date in any_date()) {
        let name = cycle_name(date, DEFAULT_REFERENCE_WEEKDAY);
        let parts: Vec<&str> = name.split('_').collect();
        prop_assert_eq!(parts.len(), 3);
        prop_assert_eq!(parts[0].len(), 3);
        prop_assert!(parts[1].starts_with("week") && parts[1].len() == 6);
        prop_assert_eq!(parts[2].len(), 4);
    }
}

#[test]
fn test_documented_examples() {
    let cases = [
        ((2024, 3, 8), "Mar_week10_2024"),
        ((2024, 3, 10), "Mar_week10_2024"),
        ((2023, 12, 31), "Dec_week52_2023"),
        ((2024, 4, 29), "May_week18_2024"),
    ];
    for ((y, m, d), expected) in cases {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(cycle_name(date, DEFAULT_REFERENCE_WEEKDAY), expected, "{date}");
    }
}
