use crate::domain::customers::{Event, Subscription};
use crate::domain::funding::{
    Consumption, EventConsumption, Funding, FundingConsumptionTracker, FundingHistory,
    FundingLedger, FundingNature,
};
use crate::domain::holidays::HolidayCalendar;
use crate::domain::services::{Service, ServiceNature};
use crate::domain::surcharge::{AppliedSurcharge, SurchargeEvaluator, SurchargePlan};
use crate::domain::types::{
    minutes_to_hours, AuxiliaryId, EventId, FundingId, Money, Percentage, ServiceId,
    SurchargePlanId, ThirdPartyPayerId, VersionId,
};
use crate::error::Result;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reference data shared by every subscription of a customer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: HashMap<ServiceId, Service>,
    #[serde(default)]
    pub surcharge_plans: HashMap<SurchargePlanId, SurchargePlan>,
}

impl Catalog {
    pub fn new(services: Vec<Service>, surcharge_plans: Vec<SurchargePlan>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
            surcharge_plans: surcharge_plans
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }
}

/// Why an event could not be priced. The event is left out of the draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricingGap {
    MissingSubscriptionVersion { event_id: EventId },
    UnknownService { event_id: EventId, service_id: ServiceId },
    MissingServiceVersion { event_id: EventId, service_id: ServiceId },
    UnknownSurchargePlan { event_id: EventId, plan_id: SurchargePlanId },
}

impl PricingGap {
    pub fn event_id(&self) -> &EventId {
        match self {
            PricingGap::MissingSubscriptionVersion { event_id }
            | PricingGap::UnknownService { event_id, .. }
            | PricingGap::MissingServiceVersion { event_id, .. }
            | PricingGap::UnknownSurchargePlan { event_id, .. } => event_id,
        }
    }
}

impl fmt::Display for PricingGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingGap::MissingSubscriptionVersion { event_id } => {
                write!(f, "no subscription version in force for event {}", event_id)
            }
            PricingGap::UnknownService { event_id, service_id } => {
                write!(f, "service {} of event {} is not in the catalogue", service_id, event_id)
            }
            PricingGap::MissingServiceVersion { event_id, service_id } => write!(
                f,
                "no version of service {} in force for event {}",
                service_id, event_id
            ),
            PricingGap::UnknownSurchargePlan { event_id, plan_id } => write!(
                f,
                "surcharge plan {} used by event {} is not in the catalogue",
                plan_id, event_id
            ),
        }
    }
}

/// Payer side of an event's price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingShare {
    pub funding_id: FundingId,
    pub funding_version_id: VersionId,
    pub third_party_payer: ThirdPartyPayerId,
    pub nature: FundingNature,
    pub third_party_payer_price: Money,
    pub charged_hours: Decimal,
    pub consumption: Consumption,
    /// Bucket state right after this event.
    pub history: FundingHistory,
}

/// Full breakdown of one priced event. Amounts keep full precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPrice {
    pub event_id: EventId,
    pub auxiliary_id: Option<AuxiliaryId>,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub subscription_version_id: VersionId,
    pub service_id: ServiceId,
    pub service_version_id: VersionId,
    pub service_name: String,
    pub nature: ServiceNature,
    pub vat: Percentage,
    pub minutes: i64,
    pub unit_excl_taxes: Money,
    pub base_price: Money,
    /// Tax-exclusive price after surcharges.
    pub excl_taxes: Money,
    pub surcharges: Vec<AppliedSurcharge>,
    pub customer_price: Money,
    pub funding: Option<FundingShare>,
}

impl EventPrice {
    pub fn hours(&self) -> Decimal {
        minutes_to_hours(self.minutes)
    }

    pub fn third_party_payer_price(&self) -> Money {
        self.funding
            .as_ref()
            .map_or(Money::ZERO, |f| f.third_party_payer_price)
    }

    pub fn customer_record(&self) -> EventPriceRecord {
        self.record(self.customer_price, self.hours())
    }

    /// Record for the payer line; `None` when the payer takes nothing.
    pub fn payer_record(&self) -> Option<EventPriceRecord> {
        let share = self.funding.as_ref()?;
        if share.third_party_payer_price.is_zero() {
            return None;
        }
        let hours = match share.nature {
            FundingNature::Hourly => share.charged_hours,
            FundingNature::Fixed => self.hours(),
        };
        Some(self.record(share.third_party_payer_price, hours))
    }

    /// Funding taken by this event, as recorded when its bill is committed.
    pub fn consumption_record(&self) -> EventConsumption {
        EventConsumption {
            event_id: self.event_id.clone(),
            bucket: self.funding.as_ref().map(|share| share.history.key()),
            consumption: self
                .funding
                .as_ref()
                .map_or_else(Consumption::default, |share| share.consumption),
        }
    }

    fn record(&self, excl_taxes: Money, hours: Decimal) -> EventPriceRecord {
        EventPriceRecord {
            event_id: self.event_id.clone(),
            auxiliary_id: self.auxiliary_id.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            hours,
            excl_taxes,
            incl_taxes: excl_taxes.with_vat(self.vat),
            surcharges: self.surcharges.clone(),
        }
    }
}

/// Per-event entry of a draft-bill line, reused for bill and credit-note items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPriceRecord {
    pub event_id: EventId,
    pub auxiliary_id: Option<AuxiliaryId>,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub hours: Decimal,
    pub excl_taxes: Money,
    pub incl_taxes: Money,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub surcharges: Vec<AppliedSurcharge>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PricingOutcome {
    Priced(Box<EventPrice>),
    Skipped(PricingGap),
}

/// Splits one event's price between the customer and its funding payer.
pub struct EventPriceCalculator {
    surcharges: SurchargeEvaluator,
    fundings: FundingConsumptionTracker,
}

impl EventPriceCalculator {
    pub fn new(calendar: Arc<HolidayCalendar>) -> Self {
        Self {
            surcharges: SurchargeEvaluator::new(calendar.clone()),
            fundings: FundingConsumptionTracker::new(calendar),
        }
    }

    /// Price `event`, consuming from `ledger` when a funding covers it.
    ///
    /// Reference-data gaps yield [`PricingOutcome::Skipped`] and leave the
    /// ledger untouched. Broken invariants are returned as errors.
    pub fn price(
        &self,
        event: &Event,
        subscription: &Subscription,
        fundings: &[Funding],
        catalog: &Catalog,
        ledger: &mut FundingLedger,
    ) -> Result<PricingOutcome> {
        event.validate()?;

        let Some(terms) = subscription.effective_at(event.start_date) else {
            return Ok(self.skip(PricingGap::MissingSubscriptionVersion {
                event_id: event.id.clone(),
            }));
        };
        let Some(service) = catalog.services.get(&terms.service_id) else {
            return Ok(self.skip(PricingGap::UnknownService {
                event_id: event.id.clone(),
                service_id: terms.service_id,
            }));
        };
        let Some(service) = service.effective_at(event.start_date) else {
            return Ok(self.skip(PricingGap::MissingServiceVersion {
                event_id: event.id.clone(),
                service_id: terms.service_id,
            }));
        };

        let minutes = event.minutes();
        let unit_excl_taxes = terms.unit_ttc_rate.without_vat(service.vat);
        let base_price = match service.nature {
            ServiceNature::Hourly => unit_excl_taxes * minutes_to_hours(minutes),
            ServiceNature::Fixed => unit_excl_taxes,
        };

        let (excl_taxes, surcharges) = match (&service.surcharge, service.nature) {
            (Some(plan_id), ServiceNature::Hourly) => {
                let Some(plan) = catalog.surcharge_plans.get(plan_id) else {
                    return Ok(self.skip(PricingGap::UnknownSurchargePlan {
                        event_id: event.id.clone(),
                        plan_id: plan_id.clone(),
                    }));
                };
                let surcharged = self.surcharges.compute_price(event, base_price, plan)?;
                (surcharged.price, surcharged.applied)
            }
            _ => (base_price, Vec::new()),
        };

        let (customer_price, funding) = match self.fundings.match_funding(fundings, event)? {
            Some(funding) => {
                let key = funding.bucket_key(event.start_date.date());
                let history = ledger.current(&key);
                let allocation =
                    self.fundings
                        .allocate(event, &funding, history, &service, excl_taxes)?;
                ledger.record(allocation.history.clone());

                let share = FundingShare {
                    funding_id: funding.funding_id,
                    funding_version_id: funding.version_id,
                    third_party_payer: funding.third_party_payer,
                    nature: funding.nature,
                    third_party_payer_price: allocation.third_party_payer_price,
                    charged_hours: allocation.charged_minutes / Decimal::from(60),
                    consumption: allocation.consumption,
                    history: allocation.history,
                };
                (allocation.customer_price, Some(share))
            }
            None => (excl_taxes, None),
        };

        debug!(
            event_id = %event.id,
            minutes,
            excl_taxes = %excl_taxes,
            customer_price = %customer_price,
            "Event priced"
        );

        Ok(PricingOutcome::Priced(Box::new(EventPrice {
            event_id: event.id.clone(),
            auxiliary_id: event.auxiliary_id.clone(),
            start_date: event.start_date,
            end_date: event.end_date,
            subscription_version_id: terms.version_id,
            service_id: service.service_id,
            service_version_id: service.version_id,
            service_name: service.name,
            nature: service.nature,
            vat: service.vat,
            minutes,
            unit_excl_taxes,
            base_price,
            excl_taxes,
            surcharges,
            customer_price,
            funding,
        })))
    }

    fn skip(&self, gap: PricingGap) -> PricingOutcome {
        warn!(event_id = %gap.event_id(), reason = %gap, "Event skipped from pricing");
        PricingOutcome::Skipped(gap)
    }
}
