//! Property-based testing for backupper
//!
//! Uses proptest to check rotation, naming and scheduling invariants
//! across randomly generated inputs.

use ::backupper::manifest::{archive_file_name, archive_timestamp, is_archive_name, sanitize_entry_name};
use ::backupper::remote::validate_remote_name;
use ::backupper::rotation::select_for_deletion;
use ::backupper::schedule::{Schedule, ScheduleInterval};
use ::backupper::*;
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Archive records with distinct modification times
fn records_strategy() -> impl Strategy<Value = Vec<ArchiveRecord>> {
    prop::collection::btree_set(0i64..1_000_000, 0..40).prop_map(|offsets| {
        offsets
            .into_iter()
            .map(|offset| {
                let modified: DateTime<Utc> = Utc.timestamp_opt(1_700_000_000 + offset * 60, 0).unwrap();
                ArchiveRecord::new(format!("backup_conf_{}.zip", offset), modified)
            })
            .collect()
    })
}

fn strategy_strategy() -> impl Strategy<Value = RotationStrategy> {
    prop_oneof![
        Just(RotationStrategy::KeepNewest),
        Just(RotationStrategy::KeepOldest),
        Just(RotationStrategy::KeepBothEnds),
    ]
}

fn interval_strategy() -> impl Strategy<Value = ScheduleInterval> {
    prop_oneof![
        Just(ScheduleInterval::Hourly),
        Just(ScheduleInterval::Daily),
        Just(ScheduleInterval::Weekly),
    ]
}

fn weekday_strategy() -> impl Strategy<Value = Weekday> {
    (0u8..7).prop_map(|day| match day {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Rotation deletes exactly the excess and never more
    #[test]
    fn rotation_deletes_exact_excess(
        records in records_strategy(),
        keep in 0usize..20,
        strategy in strategy_strategy(),
    ) {
        let deleted = select_for_deletion(&records, keep, strategy);
        let keep = keep.max(1);
        prop_assert_eq!(deleted.len(), records.len().saturating_sub(keep));

        let names: BTreeSet<&str> = deleted.iter().map(|r| r.name.as_str()).collect();
        prop_assert_eq!(names.len(), deleted.len());
        for record in &deleted {
            prop_assert!(records.contains(record));
        }
    }

    /// Retained archives sit at the ends the strategy names
    #[test]
    fn rotation_keeps_the_right_end(
        records in records_strategy(),
        keep in 1usize..20,
        strategy in strategy_strategy(),
    ) {
        let deleted = select_for_deletion(&records, keep, strategy);
        let deleted_names: BTreeSet<&str> = deleted.iter().map(|r| r.name.as_str()).collect();

        let mut ordered = records.clone();
        ordered.sort_by_key(|r| r.modified);
        let kept_flags: Vec<bool> = ordered
            .iter()
            .map(|r| !deleted_names.contains(r.name.as_str()))
            .collect();

        match strategy {
            RotationStrategy::KeepNewest => {
                // once a kept archive appears, everything newer is kept
                if let Some(first) = kept_flags.iter().position(|kept| *kept) {
                    prop_assert!(kept_flags[first..].iter().all(|kept| *kept));
                }
            }
            RotationStrategy::KeepOldest => {
                if let Some(first_deleted) = kept_flags.iter().position(|kept| !*kept) {
                    prop_assert!(kept_flags[first_deleted..].iter().all(|kept| !*kept));
                }
            }
            RotationStrategy::KeepBothEnds => {
                // deleted archives form one contiguous run
                let deleted_positions: Vec<usize> = kept_flags
                    .iter()
                    .enumerate()
                    .filter(|(_, kept)| !**kept)
                    .map(|(i, _)| i)
                    .collect();
                if let (Some(first), Some(last)) = (deleted_positions.first(), deleted_positions.last()) {
                    prop_assert_eq!(last - first + 1, deleted_positions.len());
                    if ordered.len() > 1 {
                        prop_assert!(kept_flags[ordered.len() - 1]);
                    }
                }
            }
        }
    }

    /// Generated archive names are recognised and carry their timestamp
    #[test]
    fn archive_names_are_recognised(
        items in prop::collection::vec("[a-z_.]{1,16}", 1..8),
        secs in 0i64..2_000_000_000,
    ) {
        let created = Local.timestamp_opt(secs, 0).single().unwrap();
        let name = archive_file_name(&items, &created);
        prop_assert!(is_archive_name(&name));
        prop_assert!(validate_remote_name(&name).is_ok());
        prop_assert_eq!(
            archive_timestamp(&name),
            Some(created.naive_local().with_nanosecond(0).unwrap())
        );
    }

    /// Entry names never start with a separator and contain only ASCII
    #[test]
    fn sanitized_entry_names_are_portable(name in "\\PC{0,40}") {
        let sanitized = sanitize_entry_name(&name);
        prop_assert!(!sanitized.starts_with('/'));
        prop_assert!(!sanitized.contains('\\'));
        prop_assert!(sanitized.is_ascii());
    }

    /// Names with separators or parent references never reach a transport
    #[test]
    fn remote_names_with_separators_are_rejected(
        prefix in "[a-z]{0,8}",
        separator in prop_oneof![Just("/"), Just("\\")],
        suffix in "[a-z]{0,8}",
    ) {
        let name = format!("{}{}{}", prefix, separator, suffix);
        prop_assert!(validate_remote_name(&name).is_err());
    }

    /// The next run is in the future, on the configured minute, within one period
    #[test]
    fn next_run_is_within_one_period(
        interval in interval_strategy(),
        weekday in weekday_strategy(),
        hour in 0u32..24,
        minute in 0u32..60,
        day_offset in 0i64..3650,
        now_minutes in 0i64..(24 * 60),
    ) {
        let schedule = Schedule {
            interval,
            time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
            weekday,
        };
        let now = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
            + Duration::days(day_offset)
            + Duration::minutes(now_minutes);

        let next = schedule.next_after(now);
        let period = match interval {
            ScheduleInterval::Hourly => Duration::hours(1),
            ScheduleInterval::Daily => Duration::days(1),
            ScheduleInterval::Weekly => Duration::days(7),
        };

        prop_assert!(next > now);
        prop_assert!(next - now <= period);
        prop_assert_eq!(next.minute(), minute);
        if interval != ScheduleInterval::Hourly {
            prop_assert_eq!(next.hour(), hour);
        }
        if interval == ScheduleInterval::Weekly {
            prop_assert_eq!(next.weekday(), weekday);
        }
    }
}
