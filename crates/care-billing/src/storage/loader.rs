use crate::domain::bills::SubscriptionGroup;
use crate::domain::customers::Customer;
use crate::domain::funding::FundingHistory;
use crate::domain::pricing::Catalog;
use crate::domain::services::Service;
use crate::domain::surcharge::SurchargePlan;
use crate::domain::types::{BillingPeriod, CustomerId, EventId, VersionId};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything needed to bill one customer over a period.
#[derive(Debug, Clone)]
pub struct CustomerBillingData {
    pub customer: Customer,
    pub groups: Vec<SubscriptionGroup>,
    pub catalog: Arc<Catalog>,
}

impl CustomerBillingData {
    pub fn funding_version_ids(&self) -> Vec<VersionId> {
        let mut ids: Vec<VersionId> = self
            .groups
            .iter()
            .flat_map(|g| g.funding_version_ids().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn event_count(&self) -> usize {
        self.groups.iter().map(|g| g.events.len()).sum()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.groups
            .iter()
            .flat_map(|g| g.events.iter().map(|e| e.id.clone()))
            .collect()
    }

    pub fn earliest_event_start(&self) -> Option<NaiveDateTime> {
        self.groups
            .iter()
            .flat_map(|g| g.events.iter().map(|e| e.start_date))
            .min()
    }

    /// Copy without the events in `excluded`.
    pub fn without_events(&self, excluded: &HashSet<EventId>) -> Self {
        Self {
            customer: self.customer.clone(),
            groups: self
                .groups
                .iter()
                .map(|g| SubscriptionGroup {
                    subscription: g.subscription.clone(),
                    fundings: g.fundings.clone(),
                    events: g
                        .events
                        .iter()
                        .filter(|e| !excluded.contains(&e.id))
                        .cloned()
                        .collect(),
                })
                .collect(),
            catalog: self.catalog.clone(),
        }
    }
}

/// Source of customers and their reference data for a billing run.
#[async_trait]
pub trait BillingDataSource: Send + Sync {
    /// Customers with at least one unbilled event starting before the period end.
    async fn customers(
        &self,
        period: &BillingPeriod,
        customer_id: Option<&CustomerId>,
    ) -> Result<Vec<CustomerId>>;

    /// One customer's subscription groups, restricted to the events to bill.
    async fn load_customer(
        &self,
        customer_id: &CustomerId,
        period: &BillingPeriod,
    ) -> Result<CustomerBillingData>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    #[serde(flatten)]
    pub customer: Customer,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionGroup>,
}

/// On-disk dataset read by [`JsonDataSource`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub customers: Vec<CustomerRecord>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub surcharge_plans: Vec<SurchargePlan>,
    /// Consumption already recorded before this run.
    #[serde(default)]
    pub funding_histories: Vec<FundingHistory>,
}

pub struct JsonDataSource {
    customers: Vec<CustomerRecord>,
    catalog: Arc<Catalog>,
    funding_histories: Vec<FundingHistory>,
}

impl JsonDataSource {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            catalog: Arc::new(Catalog::new(dataset.services, dataset.surcharge_plans)),
            customers: dataset.customers,
            funding_histories: dataset.funding_histories,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let dataset: Dataset = serde_json::from_str(json).map_err(|e| BillingError::DataSource {
            message: format!("invalid dataset: {}", e),
        })?;
        Ok(Self::new(dataset))
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BillingError::DataSource {
                message: format!("cannot read {}: {}", path.display(), e),
            })?;
        let source = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            customers = source.customers.len(),
            services = source.catalog.services.len(),
            "Dataset loaded"
        );
        Ok(source)
    }

    pub fn funding_histories(&self) -> &[FundingHistory] {
        &self.funding_histories
    }

    fn selected(group: &SubscriptionGroup, period: &BillingPeriod) -> SubscriptionGroup {
        SubscriptionGroup {
            subscription: group.subscription.clone(),
            fundings: group.fundings.clone(),
            events: group
                .events
                .iter()
                .filter(|e| !e.is_billed && e.start_date < period.end)
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl BillingDataSource for JsonDataSource {
    async fn customers(
        &self,
        period: &BillingPeriod,
        customer_id: Option<&CustomerId>,
    ) -> Result<Vec<CustomerId>> {
        Ok(self
            .customers
            .iter()
            .filter(|record| customer_id.map_or(true, |id| &record.customer.id == id))
            .filter(|record| {
                record
                    .subscriptions
                    .iter()
                    .any(|g| !Self::selected(g, period).events.is_empty())
            })
            .map(|record| record.customer.id.clone())
            .collect())
    }

    async fn load_customer(
        &self,
        customer_id: &CustomerId,
        period: &BillingPeriod,
    ) -> Result<CustomerBillingData> {
        let record = self
            .customers
            .iter()
            .find(|record| &record.customer.id == customer_id)
            .ok_or_else(|| BillingError::DataSource {
                message: format!("unknown customer {}", customer_id),
            })?;

        Ok(CustomerBillingData {
            customer: record.customer.clone(),
            groups: record
                .subscriptions
                .iter()
                .map(|g| Self::selected(g, period))
                .filter(|g| !g.events.is_empty())
                .collect(),
            catalog: self.catalog.clone(),
        })
    }
}
