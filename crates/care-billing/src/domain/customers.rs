use crate::domain::types::{
    minutes_between, AuxiliaryId, CustomerId, EventId, Money, ServiceId, SubscriptionId, VersionId,
};
use crate::domain::versions::{resolve_version, VersionKey, Versioned};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scheduled unit of care, in agency-local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub customer_id: CustomerId,
    pub subscription_id: SubscriptionId,
    #[serde(default)]
    pub auxiliary_id: Option<AuxiliaryId>,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    #[serde(default)]
    pub is_billed: bool,
}

impl Event {
    /// Check the interval invariants: `end > start`, and both on the same
    /// calendar day (an end at the following midnight is accepted).
    pub fn validate(&self) -> Result<()> {
        if self.end_date <= self.start_date {
            return Err(BillingError::InvalidEventInterval {
                event_id: self.id.to_string(),
                message: format!(
                    "end {} is not after start {}",
                    self.end_date, self.start_date
                ),
            });
        }

        let same_day = self.end_date.date() == self.start_date.date();
        let ends_at_midnight = self.end_date.time() == NaiveTime::MIN
            && self.end_date.date() == self.start_date.date() + Duration::days(1);
        if !same_day && !ends_at_midnight {
            return Err(BillingError::InvalidEventInterval {
                event_id: self.id.to_string(),
                message: "intervention spans more than one calendar day".to_string(),
            });
        }

        Ok(())
    }

    pub fn minutes(&self) -> i64 {
        minutes_between(self.start_date, self.end_date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    #[serde(default)]
    pub name: String,
}

/// Snapshot of a customer's terms for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionVersion {
    pub version_id: VersionId,
    /// Unit price including taxes.
    pub unit_ttc_rate: Money,
    #[serde(default)]
    pub estimated_weekly_volume: Decimal,
    pub start_date: NaiveDateTime,
    #[serde(default)]
    pub end_date: Option<NaiveDateTime>,
    pub created_at: DateTime<Utc>,
}

impl Versioned for SubscriptionVersion {
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
pub struct Subscription {
    pub id: SubscriptionId,
    pub service_id: ServiceId,
    pub versions: Vec<SubscriptionVersion>,
}

/// Subscription terms in force on a given date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSubscription {
    pub subscription_id: SubscriptionId,
    pub service_id: ServiceId,
    pub version_id: VersionId,
    pub unit_ttc_rate: Money,
    pub estimated_weekly_volume: Decimal,
    pub start_date: NaiveDateTime,
}

impl Subscription {
    /// Versions are ranked by creation time.
    pub fn effective_at(&self, at: NaiveDateTime) -> Option<EffectiveSubscription> {
        let version = resolve_version(&self.versions, at, VersionKey::CreatedAt)?;
        Some(EffectiveSubscription {
            subscription_id: self.id.clone(),
            service_id: self.service_id.clone(),
            version_id: version.version_id.clone(),
            unit_ttc_rate: version.unit_ttc_rate,
            estimated_weekly_volume: version.estimated_weekly_volume,
            start_date: version.start_date,
        })
    }
}
