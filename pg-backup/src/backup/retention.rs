//! Which backups to delete, copy or restore.
//!
//! All selectors are pure over a catalog listing; the catalog is re-read by callers
//! every time, so repeated calls with an unchanged catalog agree.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use super::catalog::BackupRecord;
use super::Branch;
use crate::utils::{BackupError, Result};

/// Branches searched, in order, when restoring to a point in time.
pub const DATE_RESTORE_BRANCHES: [Branch; 2] = [Branch::Daily, Branch::Weekly];

/// What a retention run does with a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPlan {
    /// `available <= keep`: nothing to delete
    Skip { available: usize, keep: usize },
    /// Delete the oldest `delete` backups, keep the newest `keep`
    Retain { keep: usize, delete: usize },
    /// `keep == 0`: delete every backup
    Everything { delete: usize },
}

impl DeletionPlan {
    pub fn should_delete(&self) -> bool {
        !matches!(self, DeletionPlan::Skip { .. })
    }
}

pub fn select_for_deletion(records: &[BackupRecord], keep: usize) -> DeletionPlan {
    let available = records.len();
    if available <= keep {
        DeletionPlan::Skip { available, keep }
    } else if keep == 0 {
        DeletionPlan::Everything { delete: available }
    } else {
        DeletionPlan::Retain {
            keep,
            delete: available - keep,
        }
    }
}

/// The newest `keep` records, newest first.
pub fn retained(records: &[BackupRecord], keep: usize) -> Vec<&BackupRecord> {
    let mut sorted: Vec<&BackupRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    sorted.truncate(keep);
    sorted
}

/// Latest backup taken on calendar day `day` in time zone `tz`.
///
/// Ties on the exact timestamp go to the record listed first in the catalog.
pub fn select_for_weekday<'a, Tz: TimeZone>(
    records: &'a [BackupRecord],
    day: NaiveDate,
    tz: &Tz,
) -> Option<&'a BackupRecord> {
    let mut matches: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.last_modified.with_timezone(tz).date_naive() == day)
        .collect();
    matches.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    matches.first().copied()
}

/// Latest backup taken at or before `target`.
pub fn select_for_date(records: &[BackupRecord], target: DateTime<Utc>) -> Option<&BackupRecord> {
    let mut sorted: Vec<&BackupRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
    sorted
        .into_iter()
        .rev()
        .find(|r| r.last_modified <= target)
}

/// Calendar day for a weekday offset relative to the week containing `today`.
///
/// Weeks start on Sunday: `0` is this week's Sunday, `6` its Saturday, `-1` the
/// Saturday before it. Offsets leaving the calendar are an invalid request.
pub fn resolve_weekday(today: NaiveDate, day: i64) -> Result<NaiveDate> {
    let since_sunday = Duration::days(i64::from(today.weekday().num_days_from_sunday()));
    Duration::try_days(day)
        .and_then(|offset| today.checked_sub_signed(since_sunday)?.checked_add_signed(offset))
        .ok_or_else(|| BackupError::InvalidRequest(format!("weekday offset {day} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn record(name: &str, ts: DateTime<Utc>) -> BackupRecord {
        BackupRecord::new(name, ts)
    }

    fn names(records: &[&BackupRecord]) -> Vec<String> {
        records.iter().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn test_deletion_keeps_newest() {
        let day0 = at(2024, 3, 10, 2);
        let records = vec![
            record("b1", day0 - Duration::days(3)),
            record("b2", day0 - Duration::days(1)),
            record("b3", day0),
        ];

        let plan = select_for_deletion(&records, 2);
        assert_eq!(plan, DeletionPlan::Retain { keep: 2, delete: 1 });
        assert!(plan.should_delete());

        let mut kept = names(&retained(&records, 2));
        kept.sort();
        assert_eq!(kept, vec!["b2", "b3"]);
    }

    #[test]
    fn test_deletion_never_when_enough_kept() {
        let records: Vec<BackupRecord> = (0..5)
            .map(|i| record(&format!("b{i}"), at(2024, 3, 1 + i, 2)))
            .collect();
        for keep in records.len()..records.len() + 5 {
            let plan = select_for_deletion(&records, keep);
            assert!(!plan.should_delete(), "keep={keep} must not delete");
        }
        assert!(!select_for_deletion(&[], 0).should_delete());
    }

    #[test]
    fn test_deletion_keep_zero_deletes_everything() {
        let records = vec![record("b1", at(2024, 3, 1, 2))];
        assert_eq!(
            select_for_deletion(&records, 0),
            DeletionPlan::Everything { delete: 1 }
        );
    }

    #[test]
    fn test_deletion_is_deterministic() {
        let records = vec![
            record("b1", at(2024, 3, 1, 2)),
            record("b2", at(2024, 3, 2, 2)),
            record("b3", at(2024, 3, 3, 2)),
        ];
        assert_eq!(select_for_deletion(&records, 1), select_for_deletion(&records, 1));
        assert_eq!(names(&retained(&records, 1)), vec!["b3"]);
    }

    #[test]
    fn test_weekday_none_without_match() {
        let records = vec![record("b1", at(2024, 3, 1, 2)), record("b2", at(2024, 3, 3, 2))];
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert!(select_for_weekday(&records, day, &Utc).is_none());
        assert!(select_for_weekday(&[], day, &Utc).is_none());
    }

    #[test]
    fn test_weekday_picks_latest_on_day() {
        let records = vec![
            record("early", at(2024, 3, 2, 1)),
            record("late", at(2024, 3, 2, 23)),
            record("next-day", at(2024, 3, 3, 0)),
            record("mid", at(2024, 3, 2, 12)),
        ];
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert_eq!(select_for_weekday(&records, day, &Utc).unwrap().name, "late");
    }

    #[test]
    fn test_weekday_is_calendar_day_in_zone() {
        // 2024-03-02T20:00Z is already 2024-03-03 in UTC+05:30
        let records = vec![record("b1", at(2024, 3, 2, 20))];
        let ist = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        assert_eq!(select_for_weekday(&records, day, &ist).unwrap().name, "b1");
        assert!(select_for_weekday(&records, day, &Utc).is_none());
    }

    #[test]
    fn test_weekday_tie_keeps_catalog_order() {
        let ts = at(2024, 3, 2, 2);
        let records = vec![record("first", ts), record("second", ts)];
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert_eq!(select_for_weekday(&records, day, &Utc).unwrap().name, "first");
    }

    #[test]
    fn test_date_picks_latest_not_after_target() {
        let records = vec![
            record("b3", at(2024, 3, 3, 2)),
            record("b1", at(2024, 3, 1, 2)),
            record("b2", at(2024, 3, 2, 2)),
        ];
        assert_eq!(select_for_date(&records, at(2024, 3, 2, 12)).unwrap().name, "b2");
        assert_eq!(select_for_date(&records, at(2024, 3, 2, 2)).unwrap().name, "b2");
        assert_eq!(select_for_date(&records, at(2024, 4, 1, 0)).unwrap().name, "b3");
        assert!(select_for_date(&records, at(2024, 2, 28, 0)).is_none());
    }

    #[test]
    fn test_date_selection_is_monotonic() {
        let records: Vec<BackupRecord> = [5, 1, 9, 3, 7]
            .iter()
            .map(|d| record(&format!("b{d}"), at(2024, 3, *d, 2)))
            .collect();
        let targets: Vec<DateTime<Utc>> = (0..24 * 12)
            .map(|h| at(2024, 3, 1, 0) + Duration::hours(h))
            .collect();

        for pair in targets.windows(2) {
            let earlier = select_for_date(&records, pair[0]).map(|r| r.last_modified);
            let later = select_for_date(&records, pair[1]).map(|r| r.last_modified);
            if let Some(e) = earlier {
                assert!(later.is_some_and(|l| e <= l));
            }
        }
    }

    #[test]
    fn test_resolve_weekday() {
        // 2024-03-13 is a Wednesday
        let wed = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
        assert_eq!(resolve_weekday(wed, 0).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(resolve_weekday(wed, 6).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 16).unwrap());
        assert_eq!(resolve_weekday(wed, -1).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());

        // A Saturday run copying the previous day's backup
        let sat = NaiveDate::from_ymd_opt(2024, 3, 16).unwrap();
        assert_eq!(resolve_weekday(sat, 5).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn test_resolve_weekday_out_of_range() {
        let wed = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
        for day in [1_000_000_000_000, -1_000_000_000_000, i64::MAX, i64::MIN] {
            assert!(matches!(
                resolve_weekday(wed, day),
                Err(BackupError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn test_date_restore_branch_order() {
        assert_eq!(DATE_RESTORE_BRANCHES, [Branch::Daily, Branch::Weekly]);
    }
}
