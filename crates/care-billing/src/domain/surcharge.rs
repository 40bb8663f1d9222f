//! Premium-rate evaluation for care events.
//!
//! A plan holds day-type rules (25 December, 1 May, public holiday, Saturday,
//! Sunday) and time-window rules (evening, custom). Day-type rules are checked
//! in that order and the first one with a positive percentage decides the
//! whole event; windows are only looked at when no day-type rule matched, and
//! each window applies on top of the price left by the previous one.

use crate::domain::customers::Event;
use crate::domain::holidays::HolidayCalendar;
use crate::domain::types::{minutes_to_hours, Money, Percentage, SurchargePlanId};
use crate::error::{BillingError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurchargePlan {
    pub id: SurchargePlanId,
    pub name: String,
    pub twenty_fifth_of_december: Option<Percentage>,
    pub first_of_may: Option<Percentage>,
    pub public_holiday: Option<Percentage>,
    pub saturday: Option<Percentage>,
    pub sunday: Option<Percentage>,
    pub evening: Option<Percentage>,
    pub evening_start_time: Option<String>,
    pub evening_end_time: Option<String>,
    pub custom: Option<Percentage>,
    pub custom_start_time: Option<String>,
    pub custom_end_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurchargeCategory {
    TwentyFifthOfDecember,
    FirstOfMay,
    PublicHoliday,
    Saturday,
    Sunday,
    Evening,
    Custom,
}

impl fmt::Display for SurchargeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SurchargeCategory::TwentyFifthOfDecember => "twenty_fifth_of_december",
            SurchargeCategory::FirstOfMay => "first_of_may",
            SurchargeCategory::PublicHoliday => "public_holiday",
            SurchargeCategory::Saturday => "saturday",
            SurchargeCategory::Sunday => "sunday",
            SurchargeCategory::Evening => "evening",
            SurchargeCategory::Custom => "custom",
        };
        write!(f, "{}", label)
    }
}

/// Wall-clock time of day parsed from `HHMM` or `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockTime(NaiveTime);

impl ClockTime {
    pub fn parse(field: &str, value: &str) -> Result<Self> {
        let invalid = || BillingError::InvalidTimeString {
            field: field.to_string(),
            value: value.to_string(),
        };

        let digits: String = match value.len() {
            4 => value.to_string(),
            5 if value.as_bytes()[2] == b':' => value.replacen(':', "", 1),
            _ => return Err(invalid()),
        };
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let hour: u32 = digits[..2].parse().map_err(|_| invalid())?;
        let minute: u32 = digits[2..].parse().map_err(|_| invalid())?;
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(ClockTime)
            .ok_or_else(invalid)
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

/// A percentage applying between two clock times. When `end` precedes
/// `start` the window runs past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindowRule {
    pub category: SurchargeCategory,
    pub percentage: Percentage,
    pub start: ClockTime,
    pub end: ClockTime,
}

impl TimeWindowRule {
    pub fn crosses_midnight(&self) -> bool {
        self.end < self.start
    }

    /// Concrete occurrences of the window that may intersect an interval
    /// starting on `day`: the one opened on `day`, and for windows running
    /// past midnight the one opened the evening before.
    fn occurrences(&self, day: NaiveDate) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        let anchor = |d: NaiveDate| {
            let start = d.and_time(self.start.time());
            let mut end = d.and_time(self.end.time());
            if self.crosses_midnight() {
                end += Duration::days(1);
            }
            (start, end)
        };

        let mut occurrences = vec![anchor(day)];
        if self.crosses_midnight() {
            occurrences.insert(0, anchor(day - Duration::days(1)));
        }
        occurrences
    }

    /// Parts of `[start, end)` covered by this window, in chronological order.
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        self.occurrences(start.date())
            .into_iter()
            .chain(self.occurrences(end.date()))
            .filter_map(|(w_start, w_end)| {
                let from = w_start.max(start);
                let to = w_end.min(end);
                (from < to).then_some((from, to))
            })
            .fold(Vec::new(), |mut acc, interval| {
                if !acc.contains(&interval) {
                    acc.push(interval);
                }
                acc
            })
    }

    pub fn split(&self, start: NaiveDateTime, end: NaiveDateTime) -> WindowSplit {
        let total = (end - start).num_minutes();
        let inflated: i64 = self
            .overlaps(start, end)
            .iter()
            .map(|(from, to)| (*to - *from).num_minutes())
            .sum::<i64>()
            .min(total);
        WindowSplit {
            inflated_minutes: inflated,
            not_inflated_minutes: total - inflated,
        }
    }
}

/// Minutes of an interval inside and outside a surcharge window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSplit {
    pub inflated_minutes: i64,
    pub not_inflated_minutes: i64,
}

impl SurchargePlan {
    fn day_type_rules(&self) -> [(SurchargeCategory, Option<Percentage>); 5] {
        [
            (SurchargeCategory::TwentyFifthOfDecember, self.twenty_fifth_of_december),
            (SurchargeCategory::FirstOfMay, self.first_of_may),
            (SurchargeCategory::PublicHoliday, self.public_holiday),
            (SurchargeCategory::Saturday, self.saturday),
            (SurchargeCategory::Sunday, self.sunday),
        ]
    }

    /// Active window rules, evening first.
    pub fn window_rules(&self) -> Result<Vec<TimeWindowRule>> {
        let candidates = [
            (
                SurchargeCategory::Evening,
                self.evening,
                &self.evening_start_time,
                &self.evening_end_time,
            ),
            (
                SurchargeCategory::Custom,
                self.custom,
                &self.custom_start_time,
                &self.custom_end_time,
            ),
        ];

        let mut rules = Vec::new();
        for (category, percentage, start, end) in candidates {
            let Some(percentage) = percentage.filter(|p| !p.is_zero()) else {
                continue;
            };
            let start_field = format!("{}_start_time", category);
            let end_field = format!("{}_end_time", category);
            rules.push(TimeWindowRule {
                category,
                percentage,
                start: ClockTime::parse(&start_field, start.as_deref().unwrap_or(""))?,
                end: ClockTime::parse(&end_field, end.as_deref().unwrap_or(""))?,
            });
        }
        Ok(rules)
    }
}

/// One surcharge reflected in a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedSurcharge {
    pub category: SurchargeCategory,
    pub percentage: Percentage,
    pub surcharged_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurchargedPrice {
    pub price: Money,
    pub applied: Vec<AppliedSurcharge>,
}

/// Surcharged and plain hours of an interval, for worked-hours computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSplit {
    pub surcharged_hours: Decimal,
    pub not_surcharged_hours: Decimal,
    pub breakdown: BTreeMap<SurchargeCategory, Decimal>,
}

pub struct SurchargeEvaluator {
    calendar: Arc<HolidayCalendar>,
}

impl SurchargeEvaluator {
    pub fn new(calendar: Arc<HolidayCalendar>) -> Self {
        Self { calendar }
    }

    /// The day-type rule deciding `date`, if any.
    pub fn day_type_rule(
        &self,
        plan: &SurchargePlan,
        date: NaiveDate,
    ) -> Option<(SurchargeCategory, Percentage)> {
        plan.day_type_rules()
            .into_iter()
            .filter_map(|(category, pct)| pct.filter(|p| !p.is_zero()).map(|p| (category, p)))
            .find(|(category, _)| self.day_matches(*category, date))
    }

    fn day_matches(&self, category: SurchargeCategory, date: NaiveDate) -> bool {
        match category {
            SurchargeCategory::TwentyFifthOfDecember => date.month() == 12 && date.day() == 25,
            SurchargeCategory::FirstOfMay => date.month() == 5 && date.day() == 1,
            SurchargeCategory::PublicHoliday => self.calendar.is_holiday(date),
            SurchargeCategory::Saturday => date.weekday() == Weekday::Sat,
            SurchargeCategory::Sunday => date.weekday() == Weekday::Sun,
            SurchargeCategory::Evening | SurchargeCategory::Custom => false,
        }
    }

    /// Price of `event` once the plan's surcharges are applied to `base_price`.
    pub fn compute_price(
        &self,
        event: &Event,
        base_price: Money,
        plan: &SurchargePlan,
    ) -> Result<SurchargedPrice> {
        let minutes = checked_minutes(event, event.start_date)?;

        if let Some((category, percentage)) = self.day_type_rule(plan, event.start_date.date()) {
            return Ok(SurchargedPrice {
                price: base_price * percentage.factor(),
                applied: vec![AppliedSurcharge {
                    category,
                    percentage,
                    surcharged_minutes: minutes,
                }],
            });
        }

        let mut price = base_price;
        let mut applied = Vec::new();
        for rule in plan.window_rules()? {
            let split = rule.split(event.start_date, event.end_date);
            if split.inflated_minutes == 0 {
                continue;
            }

            let per_minute = price.as_decimal() / Decimal::from(minutes);
            let weighted = Decimal::from(split.not_inflated_minutes)
                + Decimal::from(split.inflated_minutes) * rule.percentage.factor();
            price = Money::from_decimal(per_minute * weighted);
            applied.push(AppliedSurcharge {
                category: rule.category,
                percentage: rule.percentage,
                surcharged_minutes: split.inflated_minutes,
            });
        }

        Ok(SurchargedPrice { price, applied })
    }

    /// Split the worked interval of `event` into surcharged and plain hours.
    ///
    /// Paid transport time is counted as worked time right before the event.
    pub fn split_interval(
        &self,
        event: &Event,
        plan: &SurchargePlan,
        paid_transport_minutes: i64,
    ) -> Result<IntervalSplit> {
        if paid_transport_minutes < 0 {
            return Err(BillingError::ValidationError {
                field: "paid_transport_minutes".to_string(),
                message: format!("must not be negative, got {}", paid_transport_minutes),
            });
        }
        let start = event.start_date - Duration::minutes(paid_transport_minutes);
        let total = checked_minutes(event, start)?;

        let mut breakdown = BTreeMap::new();
        if let Some((category, _)) = self.day_type_rule(plan, event.start_date.date()) {
            breakdown.insert(category, minutes_to_hours(total));
            return Ok(IntervalSplit {
                surcharged_hours: minutes_to_hours(total),
                not_surcharged_hours: Decimal::ZERO,
                breakdown,
            });
        }

        let mut covered: Vec<(NaiveDateTime, NaiveDateTime)> = Vec::new();
        for rule in plan.window_rules()? {
            let overlaps = rule.overlaps(start, event.end_date);
            let minutes: i64 = overlaps
                .iter()
                .map(|(from, to)| (*to - *from).num_minutes())
                .sum();
            if minutes > 0 {
                *breakdown.entry(rule.category).or_insert(Decimal::ZERO) +=
                    minutes_to_hours(minutes);
                covered.extend(overlaps);
            }
        }

        let surcharged = union_minutes(covered);
        Ok(IntervalSplit {
            surcharged_hours: minutes_to_hours(surcharged),
            not_surcharged_hours: minutes_to_hours(total - surcharged),
            breakdown,
        })
    }
}

fn checked_minutes(event: &Event, start: NaiveDateTime) -> Result<i64> {
    let minutes = (event.end_date - start).num_minutes();
    if minutes <= 0 {
        return Err(BillingError::InvalidEventInterval {
            event_id: event.id.to_string(),
            message: format!("duration of {} minutes", minutes),
        });
    }
    Ok(minutes)
}

fn union_minutes(mut intervals: Vec<(NaiveDateTime, NaiveDateTime)>) -> i64 {
    intervals.sort();
    let mut total = 0;
    let mut current: Option<(NaiveDateTime, NaiveDateTime)> = None;
    for (start, end) in intervals {
        current = match current {
            Some((c_start, c_end)) if start <= c_end => Some((c_start, c_end.max(end))),
            Some((c_start, c_end)) => {
                total += (c_end - c_start).num_minutes();
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((start, end)) = current {
        total += (end - start).num_minutes();
    }
    total
}
