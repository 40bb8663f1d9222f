//! Third-party funding: matching, ceiling-aware allocation and the
//! consumption ledger.
//!
//! A funding caps what a payer covers, either in care hours or in
//! tax-inclusive money, once for its lifetime or per calendar month. Each
//! bucket of consumption is a [`FundingHistory`] keyed by the funding version
//! and the [`PeriodKey`]. Allocation is a pure function from the current
//! bucket to the updated one; the [`FundingLedger`] threads buckets between
//! events of one customer so later events see earlier consumption.

use crate::domain::customers::Event;
use crate::domain::holidays::HolidayCalendar;
use crate::domain::services::EffectiveService;
use crate::domain::types::{
    CareDay, EventId, FundingId, Money, Percentage, PeriodKey, SubscriptionId,
    ThirdPartyPayerId, VersionId,
};
use crate::domain::versions::{resolve_version, VersionKey, Versioned};
use crate::error::{BillingError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Residue below which a consumed amount is snapped onto its ceiling.
const CEILING_EPSILON: Decimal = dec!(0.000000001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingNature {
    /// Ceiling in care hours, priced at the funding's unit rate.
    Hourly,
    /// Ceiling in tax-inclusive money.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingFrequency {
    Once,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingVersion {
    pub version_id: VersionId,
    pub start_date: NaiveDateTime,
    #[serde(default)]
    pub end_date: Option<NaiveDateTime>,
    pub care_days: Vec<CareDay>,
    #[serde(default)]
    pub care_hours: Option<Decimal>,
    #[serde(default)]
    pub amount_ttc: Option<Money>,
    #[serde(default)]
    pub unit_ttc_rate: Option<Money>,
    #[serde(default)]
    pub customer_participation_rate: Percentage,
    pub created_at: DateTime<Utc>,
}

impl Versioned for FundingVersion {
    fn version_id(&self) -> &VersionId {
        &self.version_id
    }

    fn start_date(&self) -> NaiveDateTime {
        self.start_date
    }

    fn end_date(&self) -> Option<NaiveDateTime> {
        self.end_date
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Funding {
    pub id: FundingId,
    pub subscription_id: SubscriptionId,
    pub third_party_payer: ThirdPartyPayerId,
    pub nature: FundingNature,
    pub frequency: FundingFrequency,
    pub versions: Vec<FundingVersion>,
}

/// Funding terms in force on a date. `version_id` keys the consumption ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveFunding {
    pub funding_id: FundingId,
    pub version_id: VersionId,
    pub third_party_payer: ThirdPartyPayerId,
    pub nature: FundingNature,
    pub frequency: FundingFrequency,
    pub start_date: NaiveDateTime,
    pub end_date: Option<NaiveDateTime>,
    pub care_days: BTreeSet<CareDay>,
    pub care_hours: Decimal,
    pub amount_ttc: Money,
    pub unit_ttc_rate: Money,
    pub customer_participation_rate: Percentage,
}

impl Funding {
    pub fn effective_at(&self, at: NaiveDateTime) -> Result<Option<EffectiveFunding>> {
        let Some(version) = resolve_version(&self.versions, at, VersionKey::CreatedAt) else {
            return Ok(None);
        };

        let missing = |field: &str| BillingError::ValidationError {
            field: field.to_string(),
            message: format!(
                "{:?} funding {} version {} has no {}",
                self.nature, self.id, version.version_id, field
            ),
        };

        let (care_hours, unit_ttc_rate, amount_ttc) = match self.nature {
            FundingNature::Hourly => (
                version.care_hours.ok_or_else(|| missing("care_hours"))?,
                version.unit_ttc_rate.ok_or_else(|| missing("unit_ttc_rate"))?,
                Money::ZERO,
            ),
            FundingNature::Fixed => (
                Decimal::ZERO,
                Money::ZERO,
                version.amount_ttc.ok_or_else(|| missing("amount_ttc"))?,
            ),
        };

        Ok(Some(EffectiveFunding {
            funding_id: self.id.clone(),
            version_id: version.version_id.clone(),
            third_party_payer: self.third_party_payer.clone(),
            nature: self.nature,
            frequency: self.frequency,
            start_date: version.start_date,
            end_date: version.end_date,
            care_days: version.care_days.iter().copied().collect(),
            care_hours,
            amount_ttc,
            unit_ttc_rate,
            customer_participation_rate: version.customer_participation_rate,
        }))
    }
}

impl EffectiveFunding {
    fn covers(&self, date: NaiveDate, day: CareDay) -> bool {
        self.start_date.date() <= date
            && self.end_date.map_or(true, |end| end.date() >= date)
            && self.care_days.contains(&day)
    }

    /// Ledger bucket consumed by an event on `date`.
    pub fn period_key(&self, date: NaiveDate) -> PeriodKey {
        match self.frequency {
            FundingFrequency::Once => PeriodKey::Once,
            FundingFrequency::Monthly => PeriodKey::month_of(date),
        }
    }

    pub fn bucket_key(&self, date: NaiveDate) -> BucketKey {
        BucketKey {
            funding_version_id: self.version_id.clone(),
            period: self.period_key(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub funding_version_id: VersionId,
    pub period: PeriodKey,
}

/// Consumption recorded so far against one funding bucket.
///
/// `revision` is the persisted revision the bucket was read at; 0 for a
/// bucket that does not exist in storage yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingHistory {
    pub funding_version_id: VersionId,
    pub period: PeriodKey,
    pub care_hours: Decimal,
    pub amount_ttc: Money,
    #[serde(default)]
    pub revision: i64,
}

impl FundingHistory {
    pub fn empty(key: &BucketKey) -> Self {
        Self {
            funding_version_id: key.funding_version_id.clone(),
            period: key.period,
            care_hours: Decimal::ZERO,
            amount_ttc: Money::ZERO,
            revision: 0,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            funding_version_id: self.funding_version_id.clone(),
            period: self.period,
        }
    }
}

/// Amount one event took from a funding bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub care_hours: Decimal,
    pub amount_ttc: Money,
}

/// What a billed event took from funding, kept so that unbilling the event
/// can give the consumption back. `bucket` is `None` when no funding covered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConsumption {
    pub event_id: EventId,
    #[serde(default)]
    pub bucket: Option<BucketKey>,
    #[serde(default)]
    pub consumption: Consumption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingAllocation {
    pub customer_price: Money,
    pub third_party_payer_price: Money,
    /// Minutes of the event charged to the payer (hourly fundings only).
    pub charged_minutes: Decimal,
    pub consumption: Consumption,
    pub history: FundingHistory,
}

/// Buckets read or produced during one customer's billing.
///
/// Owned by a single run and threaded through its events in date order;
/// never shared between concurrent runs.
#[derive(Debug, Clone, Default)]
pub struct FundingLedger {
    buckets: HashMap<BucketKey, FundingHistory>,
    touched: BTreeSet<BucketKey>,
}

impl FundingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_histories(histories: impl IntoIterator<Item = FundingHistory>) -> Self {
        Self {
            buckets: histories.into_iter().map(|h| (h.key(), h)).collect(),
            touched: BTreeSet::new(),
        }
    }

    pub fn get(&self, key: &BucketKey) -> Option<&FundingHistory> {
        self.buckets.get(key)
    }

    /// Current bucket for `key`, created empty when absent.
    pub fn current(&self, key: &BucketKey) -> FundingHistory {
        self.buckets
            .get(key)
            .cloned()
            .unwrap_or_else(|| FundingHistory::empty(key))
    }

    /// Store `history`; a bucket left unchanged is not marked as touched.
    pub fn record(&mut self, history: FundingHistory) {
        let key = history.key();
        if self.current(&key) == history {
            return;
        }
        self.touched.insert(key.clone());
        self.buckets.insert(key, history);
    }

    /// Buckets changed since the ledger was loaded, in key order.
    pub fn touched(&self) -> Vec<FundingHistory> {
        self.touched
            .iter()
            .filter_map(|key| self.buckets.get(key).cloned())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.touched.is_empty()
    }
}

pub struct FundingConsumptionTracker {
    calendar: Arc<HolidayCalendar>,
}

impl FundingConsumptionTracker {
    pub fn new(calendar: Arc<HolidayCalendar>) -> Self {
        Self { calendar }
    }

    /// Care-day index of `date`: public holidays are day 7 whatever the weekday.
    pub fn care_day(&self, date: NaiveDate) -> CareDay {
        if self.calendar.is_holiday(date) {
            CareDay::HOLIDAY
        } else {
            CareDay::weekday_of(date)
        }
    }

    /// Funding covering `event`, the most recently started one when several do.
    pub fn match_funding(
        &self,
        fundings: &[Funding],
        event: &Event,
    ) -> Result<Option<EffectiveFunding>> {
        let date = event.start_date.date();
        let day = self.care_day(date);

        let mut best: Option<EffectiveFunding> = None;
        for funding in fundings {
            let Some(effective) = funding.effective_at(event.start_date)? else {
                continue;
            };
            if !effective.covers(date, day) {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |current| effective.start_date > current.start_date)
            {
                best = Some(effective);
            }
        }
        Ok(best)
    }

    /// Split `event_price` (tax-exclusive) between customer and payer and
    /// return the bucket after consumption.
    pub fn allocate(
        &self,
        event: &Event,
        funding: &EffectiveFunding,
        history: FundingHistory,
        service: &EffectiveService,
        event_price: Money,
    ) -> Result<FundingAllocation> {
        let expected = funding.bucket_key(event.start_date.date());
        if history.key() != expected {
            return Err(BillingError::ValidationError {
                field: "funding_history".to_string(),
                message: format!(
                    "bucket {} {} does not belong to event {} (expected {})",
                    history.funding_version_id, history.period, event.id, expected.period
                ),
            });
        }

        let allocation = match funding.nature {
            FundingNature::Hourly => allocate_hourly(event, funding, history, service, event_price),
            FundingNature::Fixed => allocate_fixed(funding, history, service, event_price),
        };

        debug!(
            event_id = %event.id,
            funding_version_id = %funding.version_id,
            period = %allocation.history.period,
            payer_price = %allocation.third_party_payer_price,
            "Funding allocated"
        );
        Ok(allocation)
    }

    /// Reverse a previously recorded consumption, never going below zero.
    pub fn release(&self, history: FundingHistory, consumption: &Consumption) -> FundingHistory {
        let mut released = history;

        if released.care_hours < consumption.care_hours
            || released.amount_ttc < consumption.amount_ttc
        {
            warn!(
                funding_version_id = %released.funding_version_id,
                period = %released.period,
                recorded_hours = %released.care_hours,
                released_hours = %consumption.care_hours,
                recorded_amount = %released.amount_ttc,
                released_amount = %consumption.amount_ttc,
                "Releasing more consumption than recorded, clamping bucket to zero"
            );
        }

        released.care_hours = (released.care_hours - consumption.care_hours).max(Decimal::ZERO);
        released.amount_ttc = (released.amount_ttc - consumption.amount_ttc).clamp_non_negative();
        released
    }
}

fn allocate_hourly(
    event: &Event,
    funding: &EffectiveFunding,
    mut history: FundingHistory,
    service: &EffectiveService,
    event_price: Money,
) -> FundingAllocation {
    let remaining_hours = funding.care_hours - history.care_hours;
    if remaining_hours <= CEILING_EPSILON {
        return FundingAllocation {
            customer_price: event_price,
            third_party_payer_price: Money::ZERO,
            charged_minutes: Decimal::ZERO,
            consumption: Consumption::default(),
            history,
        };
    }

    let charged_minutes = Decimal::from(event.minutes()).min(remaining_hours * dec!(60));
    let charged_hours = charged_minutes / dec!(60);
    let unit_excl_taxes = funding.unit_ttc_rate.without_vat(service.vat);
    let payer_share = Decimal::ONE - funding.customer_participation_rate.ratio();
    let third_party_payer_price = unit_excl_taxes * (charged_hours * payer_share);

    let before = history.care_hours;
    history.care_hours = snap_to_ceiling(before + charged_hours, funding.care_hours);

    FundingAllocation {
        customer_price: event_price - third_party_payer_price,
        third_party_payer_price,
        charged_minutes,
        consumption: Consumption {
            care_hours: history.care_hours - before,
            amount_ttc: Money::ZERO,
        },
        history,
    }
}

fn allocate_fixed(
    funding: &EffectiveFunding,
    mut history: FundingHistory,
    service: &EffectiveService,
    event_price: Money,
) -> FundingAllocation {
    let remaining = funding.amount_ttc - history.amount_ttc;
    if remaining.as_decimal() <= CEILING_EPSILON {
        return FundingAllocation {
            customer_price: event_price,
            third_party_payer_price: Money::ZERO,
            charged_minutes: Decimal::ZERO,
            consumption: Consumption::default(),
            history,
        };
    }

    let event_incl_taxes = event_price.with_vat(service.vat);
    let before = history.amount_ttc;
    let third_party_payer_price = if event_incl_taxes <= remaining {
        history.amount_ttc = before + event_incl_taxes;
        event_price
    } else {
        history.amount_ttc = funding.amount_ttc;
        remaining.without_vat(service.vat)
    };

    FundingAllocation {
        customer_price: event_price - third_party_payer_price,
        third_party_payer_price,
        charged_minutes: Decimal::ZERO,
        consumption: Consumption {
            care_hours: Decimal::ZERO,
            amount_ttc: history.amount_ttc - before,
        },
        history,
    }
}

fn snap_to_ceiling(value: Decimal, ceiling: Decimal) -> Decimal {
    if value >= ceiling || ceiling - value <= CEILING_EPSILON {
        ceiling
    } else {
        value
    }
}
