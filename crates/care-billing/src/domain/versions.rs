//! Effective-version resolution for time-scoped entities.
//!
//! Subscriptions, services and fundings keep an append-only list of versions.
//! The version in force on a date is the one whose validity range covers the
//! date, picking the greatest [`VersionKey`] among survivors. Callers then
//! build a typed effective snapshot from the parent and the chosen version,
//! so which fields win is spelled out in one place per entity.

use crate::domain::types::VersionId;
use chrono::{DateTime, NaiveDateTime, Utc};

/// A single time-scoped version.
pub trait Versioned {
    fn version_id(&self) -> &VersionId;

    fn start_date(&self) -> NaiveDateTime;

    fn end_date(&self) -> Option<NaiveDateTime> {
        None
    }

    fn created_at(&self) -> DateTime<Utc>;
}

/// Timestamp used to rank versions that are all valid on the same date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey {
    CreatedAt,
    StartDate,
}

impl VersionKey {
    fn rank<V: Versioned>(&self, version: &V) -> DateTime<Utc> {
        match self {
            VersionKey::CreatedAt => version.created_at(),
            VersionKey::StartDate => version.start_date().and_utc(),
        }
    }
}

/// Return the version effective on `at`, or `None` when nothing applies.
///
/// Bounds are compared at calendar-day granularity. A list holding exactly
/// one version always resolves to it, whatever its dates. Ties on the ranking
/// key go to the earliest entry in the slice.
pub fn resolve_version<V: Versioned>(versions: &[V], at: NaiveDateTime, key: VersionKey) -> Option<&V> {
    if let [only] = versions {
        return Some(only);
    }

    let day = at.date();
    versions
        .iter()
        .filter(|v| {
            v.start_date().date() <= day && v.end_date().map_or(true, |end| end.date() >= day)
        })
        .fold(None, |best: Option<&V>, candidate| match best {
            Some(current) if key.rank(candidate) <= key.rank(current) => Some(current),
            _ => Some(candidate),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[derive(Debug, Clone, PartialEq)]
    struct TestVersion {
        id: VersionId,
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        created: DateTime<Utc>,
    }

    impl Versioned for TestVersion {
        fn version_id(&self) -> &VersionId {
            &self.id
        }

        fn start_date(&self) -> NaiveDateTime {
            self.start
        }

        fn end_date(&self) -> Option<NaiveDateTime> {
            self.end
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.created
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn version(id: &str, start: NaiveDateTime, end: Option<NaiveDateTime>, created_day: u32) -> TestVersion {
        TestVersion {
            id: VersionId::new(id),
            start,
            end,
            created: Utc.with_ymd_and_hms(2024, 1, created_day, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_single_version_always_applies() {
        let versions = vec![version("v1", day(2025, 1, 1), None, 1)];
        let resolved = resolve_version(&versions, day(2020, 6, 1), VersionKey::CreatedAt);
        assert_eq!(resolved.unwrap().id.as_str(), "v1");
    }

    #[test]
    fn test_latest_created_among_started_versions_wins() {
        let versions = vec![
            version("v1", day(2024, 1, 1), None, 1),
            version("v2", day(2024, 3, 1), None, 5),
            version("v3", day(2024, 9, 1), None, 9),
        ];

        let resolved = resolve_version(&versions, day(2024, 5, 15), VersionKey::CreatedAt);
        assert_eq!(resolved.unwrap().id.as_str(), "v2");
    }

    #[test]
    fn test_start_date_key_ranks_by_start() {
        let versions = vec![
            version("late-start-early-created", day(2024, 4, 1), None, 1),
            version("early-start-late-created", day(2024, 2, 1), None, 9),
        ];

        let by_start = resolve_version(&versions, day(2024, 5, 1), VersionKey::StartDate);
        assert_eq!(by_start.unwrap().id.as_str(), "late-start-early-created");

        let by_created = resolve_version(&versions, day(2024, 5, 1), VersionKey::CreatedAt);
        assert_eq!(by_created.unwrap().id.as_str(), "early-start-late-created");
    }

    #[test]
    fn test_end_date_is_inclusive_by_day() {
        let versions = vec![
            version("closed", day(2024, 1, 1), Some(day(2024, 3, 31)), 1),
            version("future", day(2024, 6, 1), None, 2),
        ];

        let last_day = day(2024, 3, 31) + chrono::Duration::hours(18);
        assert_eq!(
            resolve_version(&versions, last_day, VersionKey::CreatedAt)
                .unwrap()
                .id
                .as_str(),
            "closed"
        );
        assert!(resolve_version(&versions, day(2024, 4, 15), VersionKey::CreatedAt).is_none());
    }

    #[test]
    fn test_ties_resolve_to_first_entry() {
        let versions = vec![
            version("first", day(2024, 1, 1), None, 3),
            version("second", day(2024, 1, 1), None, 3),
        ];
        let resolved = resolve_version(&versions, day(2024, 2, 1), VersionKey::CreatedAt);
        assert_eq!(resolved.unwrap().id.as_str(), "first");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let versions = vec![
            version("v1", day(2024, 1, 1), None, 1),
            version("v2", day(2024, 3, 1), None, 2),
        ];
        let at = day(2024, 4, 1);
        let first = resolve_version(&versions, at, VersionKey::CreatedAt).cloned();
        let second = resolve_version(&versions, at, VersionKey::CreatedAt).cloned();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_list_resolves_to_none() {
        let versions: Vec<TestVersion> = Vec::new();
        assert!(resolve_version(&versions, day(2024, 4, 1), VersionKey::CreatedAt).is_none());
    }
}
