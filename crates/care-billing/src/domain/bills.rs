//! Draft bills: per-subscription lines and their grouping per customer and
//! per third-party payer.
//!
//! [`SubscriptionBiller`] walks a subscription's events in date order through
//! the [`EventPriceCalculator`], accumulating one customer line and one line
//! per payer. [`DraftBillAggregator`] then groups the lines of every
//! subscription into one [`DraftBill`] per customer. Amounts on lines and
//! totals are rounded; per-event records keep full precision.

use crate::domain::customers::{Customer, Event, Subscription};
use crate::domain::funding::{BucketKey, EventConsumption, Funding, FundingHistory, FundingLedger};
use crate::domain::pricing::{
    Catalog, EventPrice, EventPriceCalculator, EventPriceRecord, PricingGap, PricingOutcome,
};
use crate::domain::types::{
    BillingPeriod, CustomerId, Money, ServiceId, SubscriptionId, ThirdPartyPayerId, VersionId,
};
use crate::error::Result;
use chrono::NaiveDateTime;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One subscription's charges over a period, for the customer or one payer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftBillLine {
    pub subscription_id: SubscriptionId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub hours: Decimal,
    pub excl_taxes: Money,
    pub incl_taxes: Money,
    pub events: Vec<EventPriceRecord>,
}

/// Payer line plus the funding buckets it consumed, as they stand after the
/// last event of the line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayerBillLine {
    pub third_party_payer: ThirdPartyPayerId,
    #[serde(flatten)]
    pub line: DraftBillLine,
    pub funding_histories: Vec<FundingHistory>,
}

/// A subscription with the fundings attached to it and the events to bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionGroup {
    pub subscription: Subscription,
    #[serde(default)]
    pub fundings: Vec<Funding>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl SubscriptionGroup {
    /// Funding version ids whose buckets this group may consume.
    pub fn funding_version_ids(&self) -> impl Iterator<Item = &VersionId> {
        self.fundings
            .iter()
            .flat_map(|f| f.versions.iter().map(|v| &v.version_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionBill {
    pub customer_id: CustomerId,
    pub subscription_id: SubscriptionId,
    pub customer_line: Option<DraftBillLine>,
    pub payer_lines: Vec<PayerBillLine>,
    pub skipped: Vec<PricingGap>,
    /// Every priced event with what it took from funding, in date order.
    #[serde(default)]
    pub billed_events: Vec<EventConsumption>,
}

#[derive(Debug, Default)]
struct LineAccumulator {
    service: Option<(ServiceId, String)>,
    earliest: Option<NaiveDateTime>,
    hours: Decimal,
    excl_taxes: Money,
    incl_taxes: Money,
    events: Vec<EventPriceRecord>,
}

impl LineAccumulator {
    fn push(&mut self, price: &EventPrice, record: EventPriceRecord) {
        self.service
            .get_or_insert_with(|| (price.service_id.clone(), price.service_name.clone()));
        self.earliest = Some(
            self.earliest
                .map_or(record.start_date, |e| e.min(record.start_date)),
        );
        self.hours += record.hours;
        self.excl_taxes += record.excl_taxes;
        self.incl_taxes += record.incl_taxes;
        self.events.push(record);
    }

    fn finish(
        self,
        subscription_id: &SubscriptionId,
        period: &BillingPeriod,
        decimal_places: u32,
    ) -> Option<DraftBillLine> {
        let (service_id, service_name) = self.service?;
        let start_date = self
            .earliest
            .map_or(period.start, |earliest| earliest.min(period.start));

        Some(DraftBillLine {
            subscription_id: subscription_id.clone(),
            service_id,
            service_name,
            start_date,
            end_date: period.end,
            hours: self
                .hours
                .round_dp_with_strategy(decimal_places, RoundingStrategy::MidpointAwayFromZero),
            excl_taxes: self.excl_taxes.round_dp(decimal_places),
            incl_taxes: self.incl_taxes.round_dp(decimal_places),
            events: self.events,
        })
    }
}

#[derive(Debug, Default)]
struct PayerAccumulator {
    line: LineAccumulator,
    histories: BTreeMap<BucketKey, FundingHistory>,
}

pub struct SubscriptionBiller<'a> {
    calculator: &'a EventPriceCalculator,
    decimal_places: u32,
}

impl<'a> SubscriptionBiller<'a> {
    pub fn new(calculator: &'a EventPriceCalculator, decimal_places: u32) -> Self {
        Self {
            calculator,
            decimal_places,
        }
    }

    /// Price every unbilled event of the group and build its draft lines.
    ///
    /// Events are priced in ascending start order so that funding buckets in
    /// `ledger` see earlier consumption first.
    pub fn bill_subscription(
        &self,
        customer: &Customer,
        group: &SubscriptionGroup,
        catalog: &Catalog,
        period: &BillingPeriod,
        ledger: &mut FundingLedger,
    ) -> Result<SubscriptionBill> {
        let subscription = &group.subscription;
        let mut ordered: Vec<&Event> = group.events.iter().filter(|e| !e.is_billed).collect();
        ordered.sort_by_key(|e| e.start_date);

        let mut customer_acc = LineAccumulator::default();
        let mut payers: BTreeMap<ThirdPartyPayerId, PayerAccumulator> = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut billed_events = Vec::new();

        for event in ordered {
            let price = match self
                .calculator
                .price(event, subscription, &group.fundings, catalog, ledger)?
            {
                PricingOutcome::Priced(price) => price,
                PricingOutcome::Skipped(gap) => {
                    skipped.push(gap);
                    continue;
                }
            };

            billed_events.push(price.consumption_record());
            customer_acc.push(&price, price.customer_record());

            if let (Some(share), Some(record)) = (&price.funding, price.payer_record()) {
                let payer = payers.entry(share.third_party_payer.clone()).or_default();
                payer.line.push(&price, record);
                payer
                    .histories
                    .insert(share.history.key(), share.history.clone());
            }
        }

        let customer_line = customer_acc
            .finish(&subscription.id, period, self.decimal_places)
            .filter(|line| !line.excl_taxes.is_zero());

        let payer_lines: Vec<PayerBillLine> = payers
            .into_iter()
            .filter_map(|(third_party_payer, acc)| {
                let line = acc
                    .line
                    .finish(&subscription.id, period, self.decimal_places)?;
                Some(PayerBillLine {
                    third_party_payer,
                    line,
                    funding_histories: acc.histories.into_values().collect(),
                })
            })
            .collect();

        debug!(
            customer_id = %customer.id,
            subscription_id = %subscription.id,
            customer_line = customer_line.is_some(),
            payer_lines = payer_lines.len(),
            skipped = skipped.len(),
            "Subscription billed"
        );

        Ok(SubscriptionBill {
            customer_id: customer.id.clone(),
            subscription_id: subscription.id.clone(),
            customer_line,
            payer_lines,
            skipped,
            billed_events,
        })
    }
}

/// Customer-side bills of a draft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillGroup {
    pub bills: Vec<DraftBillLine>,
    pub total: Money,
}

/// Bills of one third-party payer within a customer's draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayerBillGroup {
    pub third_party_payer: ThirdPartyPayerId,
    pub bills: Vec<PayerBillLine>,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftBill {
    pub customer_id: CustomerId,
    pub customer_bills: BillGroup,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub third_party_payer_bills: Vec<PayerBillGroup>,
}

impl DraftBill {
    pub fn grand_total(&self) -> Money {
        self.customer_bills.total
            + self
                .third_party_payer_bills
                .iter()
                .map(|group| group.total)
                .sum::<Money>()
    }
}

pub struct DraftBillAggregator;

impl DraftBillAggregator {
    /// One draft per customer, ordered by customer id. Customers whose
    /// subscriptions produced no line at all are left out.
    pub fn aggregate(bills: Vec<SubscriptionBill>) -> Vec<DraftBill> {
        let mut by_customer: BTreeMap<CustomerId, Vec<SubscriptionBill>> = BTreeMap::new();
        for bill in bills {
            by_customer
                .entry(bill.customer_id.clone())
                .or_default()
                .push(bill);
        }

        by_customer
            .into_iter()
            .filter_map(|(customer_id, bills)| Self::customer_draft(customer_id, bills))
            .collect()
    }

    fn customer_draft(customer_id: CustomerId, bills: Vec<SubscriptionBill>) -> Option<DraftBill> {
        let mut customer_bills = BillGroup::default();
        let mut payers: BTreeMap<ThirdPartyPayerId, Vec<PayerBillLine>> = BTreeMap::new();

        for bill in bills {
            if let Some(line) = bill.customer_line {
                customer_bills.total += line.incl_taxes;
                customer_bills.bills.push(line);
            }
            for payer_line in bill.payer_lines {
                payers
                    .entry(payer_line.third_party_payer.clone())
                    .or_default()
                    .push(payer_line);
            }
        }

        if customer_bills.bills.is_empty() && payers.is_empty() {
            return None;
        }

        let third_party_payer_bills = payers
            .into_iter()
            .map(|(third_party_payer, bills)| PayerBillGroup {
                total: bills.iter().map(|b| b.line.incl_taxes).sum(),
                third_party_payer,
                bills,
            })
            .collect();

        Some(DraftBill {
            customer_id,
            customer_bills,
            third_party_payer_bills,
        })
    }
}
