use crate::domain::bills::{DraftBill, DraftBillAggregator, SubscriptionBill, SubscriptionBiller};
use crate::domain::funding::{FundingConsumptionTracker, FundingHistory, FundingLedger};
use crate::domain::holidays::HolidayCalendarHandle;
use crate::domain::pricing::{EventPriceCalculator, PricingGap};
use crate::domain::types::{BillingPeriod, CustomerId, EventId, SubscriptionId, VersionId};
use crate::error::{BillingError, Result};
use crate::storage::{
    BillingDataSource, CustomerBillingData, FundingCommit, FundingHistoryRepository,
};
use chrono::{Datelike, NaiveDateTime};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Compute drafts only; funding consumption is never persisted.
    #[default]
    Draft,
    /// Persist the touched funding buckets together with the billed events,
    /// so that a later run never consumes funding for them again.
    Commit,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Draft => write!(f, "draft"),
            RunMode::Commit => write!(f, "commit"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(RunMode::Draft),
            "commit" => Ok(RunMode::Commit),
            other => Err(format!("unknown run mode '{}', expected draft or commit", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRunRequest {
    pub period: BillingPeriod,
    pub customer_id: Option<CustomerId>,
    pub mode: RunMode,
}

/// An event left out of the drafts because of missing reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub customer_id: CustomerId,
    pub subscription_id: SubscriptionId,
    #[serde(flatten)]
    pub gap: PricingGap,
}

/// A customer that could not be billed; the operator fixes the data and
/// reruns just this customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub customer_id: CustomerId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRunReport {
    pub period: BillingPeriod,
    pub mode: RunMode,
    pub draft_bills: Vec<DraftBill>,
    pub warnings: Vec<RunWarning>,
    pub failures: Vec<RunFailure>,
    /// Events left out because an earlier commit already billed them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub already_billed: Vec<EventId>,
    pub committed_buckets: usize,
    pub committed_events: usize,
}

/// Outcome of giving back the funding consumed by billed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnbillReport {
    pub unbilled: Vec<EventId>,
    /// Requested events that no commit had billed.
    pub not_billed: Vec<EventId>,
    pub released_buckets: usize,
}

struct CustomerRun {
    bills: Vec<SubscriptionBill>,
    histories: Vec<FundingHistory>,
    already_billed: Vec<EventId>,
}

/// Drives a billing run across customers.
///
/// Customers are independent: each gets its own [`FundingLedger`] and is
/// priced concurrently with the others, up to `max_concurrent_customers`.
/// A commit then persists the consumption of every customer at once.
pub struct BillingRunner {
    data_source: Arc<dyn BillingDataSource>,
    histories: Arc<dyn FundingHistoryRepository>,
    calendar: HolidayCalendarHandle,
    max_concurrent_customers: usize,
    amount_decimal_places: u32,
}

impl BillingRunner {
    pub fn new(
        data_source: Arc<dyn BillingDataSource>,
        histories: Arc<dyn FundingHistoryRepository>,
        calendar: HolidayCalendarHandle,
    ) -> Self {
        Self {
            data_source,
            histories,
            calendar,
            max_concurrent_customers: 8,
            amount_decimal_places: 2,
        }
    }

    pub fn with_max_concurrent_customers(mut self, max: usize) -> Self {
        self.max_concurrent_customers = max.max(1);
        self
    }

    pub fn with_amount_decimal_places(mut self, decimal_places: u32) -> Self {
        self.amount_decimal_places = decimal_places;
        self
    }

    /// Bill every selected customer.
    ///
    /// Invariant violations and infrastructure errors fail only the customer
    /// concerned and are listed in the report. In commit mode the touched
    /// buckets and the billed events of all customers are written in one
    /// commit; a conflict reprices everything from a fresh read once, and a
    /// second conflict fails the run with nothing written.
    pub async fn run(&self, request: &BillingRunRequest) -> Result<BillingRunReport> {
        let started = Instant::now();

        let customer_ids = self
            .data_source
            .customers(&request.period, request.customer_id.as_ref())
            .await?;

        info!(
            customers = customer_ids.len(),
            mode = %request.mode,
            start = %request.period.start,
            end = %request.period.end,
            "Starting billing run"
        );

        let (customers, load_failures) = self.load_customers(customer_ids, &request.period).await;

        let first_year = customers
            .iter()
            .filter_map(CustomerBillingData::earliest_event_start)
            .fold(request.period.start, NaiveDateTime::min)
            .year();
        self.calendar
            .refresh_if_stale(first_year..=request.period.end.year())?;
        let calculator = EventPriceCalculator::new(self.calendar.snapshot());

        let mut retried = false;
        loop {
            let calculator = &calculator;
            let outcomes: Vec<(CustomerId, Result<CustomerRun>)> = stream::iter(&customers)
                .map(|data| async move {
                    let outcome = self.run_customer(calculator, data, &request.period).await;
                    (data.customer.id.clone(), outcome)
                })
                .buffer_unordered(self.max_concurrent_customers)
                .collect()
                .await;

            let mut bills = Vec::new();
            let mut histories = Vec::new();
            let mut already_billed = Vec::new();
            let mut failures = load_failures.clone();

            for (customer_id, outcome) in outcomes {
                match outcome {
                    Ok(run) => {
                        bills.extend(run.bills);
                        histories.extend(run.histories);
                        already_billed.extend(run.already_billed);
                    }
                    Err(e) => {
                        error!(customer_id = %customer_id, error = %e, "Customer billing failed");
                        failures.push(RunFailure {
                            customer_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            let commit = FundingCommit {
                histories,
                billed: bills
                    .iter()
                    .flat_map(|bill| bill.billed_events.iter().cloned())
                    .collect(),
                unbilled: Vec::new(),
            };

            let committed_buckets = if request.mode == RunMode::Draft || commit.is_empty() {
                0
            } else {
                match self.histories.commit(&commit).await {
                    Ok(committed) => committed.len(),
                    Err(e) if e.is_conflict() && !retried => {
                        warn!(error = %e, "Funding history changed concurrently, repricing with a fresh read");
                        retried = true;
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Billing run commit failed, nothing was persisted");
                        return Err(e);
                    }
                }
            };
            let committed_events = match request.mode {
                RunMode::Draft => 0,
                RunMode::Commit => commit.billed.len(),
            };

            return Ok(self.report(
                request,
                bills,
                failures,
                already_billed,
                committed_buckets,
                committed_events,
                started,
            ));
        }
    }

    /// Give back the funding consumed by billed events, as when their bill is
    /// cancelled, so that the events can be billed again.
    ///
    /// Buckets are released and the events forgotten in one commit, retried
    /// once on conflict like a billing run.
    pub async fn unbill(&self, event_ids: &[EventId]) -> Result<UnbillReport> {
        let tracker = FundingConsumptionTracker::new(self.calendar.snapshot());
        let mut retried = false;

        loop {
            let billed = self.histories.billed_events(event_ids).await?;
            let found: HashSet<&EventId> = billed.iter().map(|b| &b.event_id).collect();
            let not_billed: Vec<EventId> = event_ids
                .iter()
                .filter(|id| !found.contains(id))
                .cloned()
                .collect();

            let mut version_ids: Vec<VersionId> = billed
                .iter()
                .filter_map(|b| b.bucket.as_ref())
                .map(|key| key.funding_version_id.clone())
                .collect();
            version_ids.sort();
            version_ids.dedup();

            let mut ledger = FundingLedger::from_histories(self.histories.fetch(&version_ids).await?);
            for record in &billed {
                if let Some(key) = &record.bucket {
                    let released = tracker.release(ledger.current(key), &record.consumption);
                    ledger.record(released);
                }
            }

            let commit = FundingCommit {
                histories: ledger.touched(),
                billed: Vec::new(),
                unbilled: billed.iter().map(|b| b.event_id.clone()).collect(),
            };
            if commit.is_empty() {
                return Ok(UnbillReport {
                    unbilled: Vec::new(),
                    not_billed,
                    released_buckets: 0,
                });
            }

            match self.histories.commit(&commit).await {
                Ok(committed) => {
                    info!(
                        events = commit.unbilled.len(),
                        buckets = committed.len(),
                        "Events unbilled"
                    );
                    return Ok(UnbillReport {
                        unbilled: commit.unbilled,
                        not_billed,
                        released_buckets: committed.len(),
                    });
                }
                Err(e) if e.is_conflict() && !retried => {
                    warn!(error = %e, "Funding history changed concurrently, retrying the release");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_customers(
        &self,
        customer_ids: Vec<CustomerId>,
        period: &BillingPeriod,
    ) -> (Vec<CustomerBillingData>, Vec<RunFailure>) {
        let loaded: Vec<(CustomerId, Result<CustomerBillingData>)> = stream::iter(customer_ids)
            .map(|customer_id| async move {
                let data = self.data_source.load_customer(&customer_id, period).await;
                (customer_id, data)
            })
            .buffer_unordered(self.max_concurrent_customers)
            .collect()
            .await;

        let mut customers = Vec::with_capacity(loaded.len());
        let mut failures = Vec::new();
        for (customer_id, data) in loaded {
            match data {
                Ok(data) => customers.push(data),
                Err(e) => {
                    error!(customer_id = %customer_id, error = %e, "Customer data could not be loaded");
                    failures.push(RunFailure {
                        customer_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (customers, failures)
    }

    async fn run_customer(
        &self,
        calculator: &EventPriceCalculator,
        data: &CustomerBillingData,
        period: &BillingPeriod,
    ) -> Result<CustomerRun> {
        let billed: HashSet<EventId> = self
            .histories
            .billed_events(&data.event_ids())
            .await?
            .into_iter()
            .map(|b| b.event_id)
            .collect();
        if !billed.is_empty() {
            debug!(
                customer_id = %data.customer.id,
                events = billed.len(),
                "Skipping events billed by an earlier commit"
            );
        }
        let pending = data.without_events(&billed);

        let histories = self.histories.fetch(&pending.funding_version_ids()).await?;
        let mut ledger = FundingLedger::from_histories(histories);
        let bills = self.bill_customer(calculator, &pending, period, &mut ledger)?;

        let mut already_billed: Vec<EventId> = billed.into_iter().collect();
        already_billed.sort();

        Ok(CustomerRun {
            bills,
            histories: ledger.touched(),
            already_billed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        request: &BillingRunRequest,
        mut bills: Vec<SubscriptionBill>,
        mut failures: Vec<RunFailure>,
        mut already_billed: Vec<EventId>,
        committed_buckets: usize,
        committed_events: usize,
        started: Instant,
    ) -> BillingRunReport {
        bills.sort_by(|a, b| {
            (&a.customer_id, &a.subscription_id).cmp(&(&b.customer_id, &b.subscription_id))
        });

        let warnings: Vec<RunWarning> = bills
            .iter()
            .flat_map(|bill| {
                bill.skipped.iter().map(|gap| RunWarning {
                    customer_id: bill.customer_id.clone(),
                    subscription_id: bill.subscription_id.clone(),
                    gap: gap.clone(),
                })
            })
            .collect();
        failures.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
        already_billed.sort();

        let draft_bills = DraftBillAggregator::aggregate(bills);

        info!(
            draft_bills = draft_bills.len(),
            warnings = warnings.len(),
            failures = failures.len(),
            already_billed = already_billed.len(),
            committed_buckets,
            committed_events,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Billing run completed"
        );

        BillingRunReport {
            period: request.period,
            mode: request.mode,
            draft_bills,
            warnings,
            failures,
            already_billed,
            committed_buckets,
            committed_events,
        }
    }

    fn bill_customer(
        &self,
        calculator: &EventPriceCalculator,
        data: &CustomerBillingData,
        period: &BillingPeriod,
        ledger: &mut FundingLedger,
    ) -> Result<Vec<SubscriptionBill>> {
        let biller = SubscriptionBiller::new(calculator, self.amount_decimal_places);
        data.groups
            .iter()
            .map(|group| {
                let subscription_id = &group.subscription.id;
                if let Some(stray) = group.events.iter().find(|e| &e.subscription_id != subscription_id) {
                    return Err(BillingError::ValidationError {
                        field: "subscription_id".to_string(),
                        message: format!(
                            "event {} belongs to subscription {}, not {}",
                            stray.id, stray.subscription_id, subscription_id
                        ),
                    });
                }
                biller.bill_subscription(&data.customer, group, &data.catalog, period, ledger)
            })
            .collect()
    }
}
