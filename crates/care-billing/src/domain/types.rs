use crate::error::{BillingError, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Customer receiving care
    CustomerId
);
string_id!(
    /// Customer subscription to one service
    SubscriptionId
);
string_id!(
    /// Billable service from the company catalogue
    ServiceId
);
string_id!(
    /// Funding granted by a third-party payer on a subscription
    FundingId
);
string_id!(
    /// Identity of one version of a versioned entity
    VersionId
);
string_id!(
    /// Public or private funding body
    ThirdPartyPayerId
);
string_id!(
    /// Scheduled care event
    EventId
);
string_id!(
    /// Care worker performing an event
    AuxiliaryId
);
string_id!(
    /// Named surcharge plan
    SurchargePlanId
);

/// Currency amount held as a fixed-point decimal.
///
/// Arithmetic keeps full precision; rounding happens only at bill-line
/// granularity through [`Money::round_dp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_decimal(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Round half away from zero, the convention used on printed bills.
    pub fn round_dp(&self, dp: u32) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Tax-inclusive amount from a tax-exclusive one.
    pub fn with_vat(&self, vat: Percentage) -> Self {
        Self(self.0 * vat.factor())
    }

    /// Tax-exclusive amount from a tax-inclusive one.
    pub fn without_vat(&self, vat: Percentage) -> Self {
        Self(self.0 / vat.factor())
    }

    pub fn clamp_non_negative(&self) -> Self {
        Self(self.0.max(Decimal::ZERO))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Mul<Decimal> for Money {
    type Output = Money;

    fn mul(self, rhs: Decimal) -> Money {
        Money(self.0 * rhs)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

/// Percentage expressed on a 0–100 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percentage(Decimal);

impl Percentage {
    pub const ZERO: Percentage = Percentage(Decimal::ZERO);

    pub fn new(field: &str, value: Decimal) -> Result<Self> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            return Err(BillingError::InvalidPercentage {
                field: field.to_string(),
                value,
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `pct / 100`
    pub fn ratio(&self) -> Decimal {
        self.0 / Decimal::ONE_HUNDRED
    }

    /// `1 + pct / 100`
    pub fn factor(&self) -> Decimal {
        Decimal::ONE + self.ratio()
    }
}

impl TryFrom<Decimal> for Percentage {
    type Error = String;

    fn try_from(value: Decimal) -> std::result::Result<Self, Self::Error> {
        Percentage::new("percentage", value).map_err(|e| e.to_string())
    }
}

impl From<Percentage> for Decimal {
    fn from(value: Percentage) -> Self {
        value.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Half-open billing window `[start, end)` in agency-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl BillingPeriod {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if end <= start {
            return Err(BillingError::ValidationError {
                field: "period".to_string(),
                message: format!("end {} must be after start {}", end, start),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at >= self.start && at < self.end
    }
}

/// Consumption bucket of a funding history: lifetime or one calendar month.
/// Months order chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodKey {
    Once,
    Month { year: i32, month: u32 },
}

impl PeriodKey {
    pub fn month_of(date: NaiveDate) -> Self {
        PeriodKey::Month {
            month: date.month(),
            year: date.year(),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Once => write!(f, "once"),
            PeriodKey::Month { month, year } => write!(f, "{:02}/{}", month, year),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "once" {
            return Ok(PeriodKey::Once);
        }

        let invalid = || BillingError::ValidationError {
            field: "period_key".to_string(),
            message: format!("expected 'once' or 'MM/YYYY', got '{}'", s),
        };

        let (month, year) = s.split_once('/').ok_or_else(invalid)?;
        if month.len() != 2 || year.len() != 4 {
            return Err(invalid());
        }
        let month: u32 = month.parse().map_err(|_| invalid())?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(PeriodKey::Month { month, year })
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse().map_err(|e: BillingError| e.to_string())
    }
}

impl From<PeriodKey> for String {
    fn from(value: PeriodKey) -> Self {
        value.to_string()
    }
}

/// Day index used by funding care-day coverage: 0 = Monday .. 6 = Sunday,
/// 7 = public holiday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CareDay(u8);

impl CareDay {
    pub const HOLIDAY: CareDay = CareDay(7);

    pub fn new(index: u8) -> Result<Self> {
        if index > 7 {
            return Err(BillingError::ValidationError {
                field: "care_days".to_string(),
                message: format!("day index {} is outside 0..=7", index),
            });
        }
        Ok(Self(index))
    }

    pub fn weekday_of(date: NaiveDate) -> Self {
        Self(date.weekday().num_days_from_monday() as u8)
    }

    pub fn index(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for CareDay {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        CareDay::new(value).map_err(|e| e.to_string())
    }
}

impl From<CareDay> for u8 {
    fn from(value: CareDay) -> Self {
        value.0
    }
}

/// Whole minutes between two instants; fractional seconds are dropped.
pub fn minutes_between(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    (end - start).num_minutes()
}

/// Hours as a decimal from whole minutes.
pub fn minutes_to_hours(minutes: i64) -> Decimal {
    Decimal::from(minutes) / Decimal::from(60)
}
