use crate::error::{BillingError, Result};
use chrono::{Datelike, Duration, NaiveDate};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::info;

/// Public holidays of the operating country.
///
/// Built once and never mutated while a billing run reads it; refreshes swap
/// a new calendar in through [`HolidayCalendarHandle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    dates: BTreeSet<NaiveDate>,
    /// Years a generator computed; `None` for a fixed list of dates.
    years: Option<RangeInclusive<i32>>,
}

impl HolidayCalendar {
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
            years: None,
        }
    }

    /// French public holidays for `reference_year` and the year before it, so
    /// that events straddling the new year are still recognised.
    pub fn french(reference_year: i32) -> Self {
        Self::french_years(reference_year - 1..=reference_year)
    }

    pub fn french_years(years: RangeInclusive<i32>) -> Self {
        Self {
            dates: years.clone().flat_map(french_holidays).collect(),
            years: Some(years),
        }
    }

    pub fn for_country(
        country: &str,
        years: RangeInclusive<i32>,
        extra_dates: &[NaiveDate],
    ) -> Result<Self> {
        let mut calendar = match country.to_ascii_uppercase().as_str() {
            "FR" => Self::french_years(years),
            "" | "NONE" => Self {
                dates: BTreeSet::new(),
                years: Some(years),
            },
            other => {
                return Err(BillingError::Configuration {
                    message: format!("no holiday generator for country '{}'", other),
                })
            }
        };
        calendar.dates.extend(extra_dates.iter().copied());
        Ok(calendar)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    /// Whether every year of `years` was generated. A fixed list covers
    /// whatever it was given.
    pub fn covers(&self, years: &RangeInclusive<i32>) -> bool {
        self.years.as_ref().map_or(true, |covered| {
            covered.start() <= years.start() && years.end() <= covered.end()
        })
    }

    pub fn years(&self) -> Option<&RangeInclusive<i32>> {
        self.years.as_ref()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Western (Gregorian) Easter Sunday, anonymous algorithm.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap_or_default()
}

fn french_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    let fixed = [(1, 1), (5, 1), (5, 8), (7, 14), (8, 15), (11, 1), (11, 11), (12, 25)];

    fixed
        .iter()
        .filter_map(|&(month, day)| NaiveDate::from_ymd_opt(year, month, day))
        .chain([
            easter + Duration::days(1),
            easter + Duration::days(39),
            easter + Duration::days(50),
        ])
        .collect()
}

#[derive(Debug, Clone)]
struct CalendarSource {
    country: String,
    extra_dates: Vec<NaiveDate>,
}

/// Shared, refreshable access to the current holiday calendar.
///
/// Readers take an `Arc` snapshot at the start of a run and keep it for the
/// whole computation.
#[derive(Debug, Clone)]
pub struct HolidayCalendarHandle {
    current: Arc<RwLock<Arc<HolidayCalendar>>>,
    source: Option<Arc<CalendarSource>>,
}

impl HolidayCalendarHandle {
    /// Handle over a fixed calendar that is never regenerated.
    pub fn new(calendar: HolidayCalendar) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(calendar))),
            source: None,
        }
    }

    /// Handle that regenerates the country's calendar when a run needs years
    /// it does not cover yet.
    pub fn for_country(
        country: &str,
        extra_dates: &[NaiveDate],
        reference_year: i32,
    ) -> Result<Self> {
        let calendar =
            HolidayCalendar::for_country(country, reference_year - 1..=reference_year, extra_dates)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(calendar))),
            source: Some(Arc::new(CalendarSource {
                country: country.to_string(),
                extra_dates: extra_dates.to_vec(),
            })),
        })
    }

    pub fn snapshot(&self) -> Arc<HolidayCalendar> {
        self.current.read().clone()
    }

    /// Rebuild the calendar when it does not cover every year of `years`.
    ///
    /// The rebuilt calendar spans both the previously covered years and the
    /// requested ones. Snapshots already taken are unaffected.
    pub fn refresh_if_stale(&self, years: RangeInclusive<i32>) -> Result<bool> {
        let Some(source) = &self.source else {
            return Ok(false);
        };

        let mut current = self.current.write();
        if current.covers(&years) {
            return Ok(false);
        }

        let wanted = match current.years() {
            Some(covered) => {
                *covered.start().min(years.start())..=*covered.end().max(years.end())
            }
            None => years,
        };
        let calendar = HolidayCalendar::for_country(&source.country, wanted.clone(), &source.extra_dates)?;
        info!(
            holidays = calendar.len(),
            first_year = wanted.start(),
            last_year = wanted.end(),
            "Holiday calendar refreshed"
        );
        *current = Arc::new(calendar);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_easter_dates() {
        assert_eq!(easter_sunday(2024), date(2024, 3, 31));
        assert_eq!(easter_sunday(2025), date(2025, 4, 20));
        assert_eq!(easter_sunday(2019), date(2019, 4, 21));
    }

    #[test]
    fn test_french_calendar_covers_previous_year() {
        let calendar = HolidayCalendar::french(2024);

        assert!(calendar.is_holiday(date(2024, 4, 1))); // Easter Monday
        assert!(calendar.is_holiday(date(2024, 5, 9))); // Ascension
        assert!(calendar.is_holiday(date(2024, 5, 20))); // Whit Monday
        assert!(calendar.is_holiday(date(2024, 7, 14)));
        assert!(calendar.is_holiday(date(2023, 12, 25)));
        assert!(!calendar.is_holiday(date(2022, 12, 25)));
        assert!(!calendar.is_holiday(date(2024, 5, 2)));
        assert_eq!(calendar.len(), 22);
    }

    #[test]
    fn test_for_country_adds_extra_dates() {
        let extra = [date(2024, 6, 3)];
        let calendar = HolidayCalendar::for_country("fr", 2023..=2024, &extra).unwrap();
        assert!(calendar.is_holiday(date(2024, 6, 3)));

        assert!(HolidayCalendar::for_country("XX", 2023..=2024, &[]).is_err());
        assert!(HolidayCalendar::for_country("none", 2023..=2024, &extra)
            .unwrap()
            .is_holiday(date(2024, 6, 3)));
    }

    #[test]
    fn test_handle_snapshot_is_stable_across_refresh() {
        let handle = HolidayCalendarHandle::for_country("FR", &[], 2023).unwrap();
        let before = handle.snapshot();

        let refreshed = handle.refresh_if_stale(2024..=2024).unwrap();
        assert!(refreshed);
        assert!(!before.is_holiday(date(2024, 5, 20)));
        assert!(handle.snapshot().is_holiday(date(2024, 5, 20)));
        assert!(handle.snapshot().is_holiday(date(2022, 12, 25)));

        let again = handle.refresh_if_stale(2023..=2024).unwrap();
        assert!(!again);
    }

    #[test]
    fn test_calendar_without_holidays_is_not_rebuilt_every_run() {
        let handle = HolidayCalendarHandle::for_country("none", &[], 2024).unwrap();
        assert!(handle.snapshot().is_empty());

        assert!(!handle.refresh_if_stale(2024..=2024).unwrap());
        assert!(!handle.refresh_if_stale(2023..=2024).unwrap());
        assert!(handle.refresh_if_stale(2020..=2024).unwrap());
        assert!(handle.snapshot().covers(&(2020..=2024)));
        assert!(!handle.refresh_if_stale(2021..=2022).unwrap());
    }

    #[test]
    fn test_fixed_calendar_is_never_regenerated() {
        let handle = HolidayCalendarHandle::new(HolidayCalendar::from_dates([date(2024, 6, 3)]));
        assert!(!handle.refresh_if_stale(1990..=2030).unwrap());
        assert_eq!(handle.snapshot().len(), 1);
    }
}
