use crate::domain::funding::{BucketKey, Consumption, EventConsumption, FundingHistory};
use crate::domain::types::{EventId, Money, PeriodKey, VersionId};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use care_common::distributed::{lock_in_transaction, BucketLockKey};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Everything a billing or unbilling pass writes, persisted atomically.
///
/// `histories` carry the revision they were read at. `billed` events must not
/// be billed yet and `unbilled` events must be, otherwise the commit is a
/// conflict and nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundingCommit {
    pub histories: Vec<FundingHistory>,
    pub billed: Vec<EventConsumption>,
    pub unbilled: Vec<EventId>,
}

impl FundingCommit {
    pub fn is_empty(&self) -> bool {
        self.histories.is_empty() && self.billed.is_empty() && self.unbilled.is_empty()
    }
}

/// Persistence of funding consumption buckets keyed by
/// `(funding_version_id, period_key)`, together with the events whose
/// consumption they hold.
///
/// Each stored bucket carries a revision. [`FundingHistory::revision`] on an
/// update is the revision it was read at (0 for a bucket never stored); a
/// commit whose revisions no longer match storage fails as a whole with
/// [`BillingError::ConcurrentModification`].
#[async_trait]
pub trait FundingHistoryRepository: Send + Sync {
    /// Every stored bucket of the given funding versions, all periods.
    async fn fetch(&self, funding_version_ids: &[VersionId]) -> Result<Vec<FundingHistory>>;

    /// Recorded consumption of those `event_ids` that are already billed.
    async fn billed_events(&self, event_ids: &[EventId]) -> Result<Vec<EventConsumption>>;

    /// Persist `commit` atomically and return its buckets at their new revision.
    async fn commit(&self, commit: &FundingCommit) -> Result<Vec<FundingHistory>>;
}

fn conflict(history: &FundingHistory) -> BillingError {
    BillingError::ConcurrentModification {
        funding_version_id: history.funding_version_id.to_string(),
        period: history.period.to_string(),
    }
}

fn event_conflict(event_id: &EventId, change: &str) -> BillingError {
    BillingError::EventBillingConflict {
        event_id: event_id.to_string(),
        change: change.to_string(),
    }
}

#[derive(Debug, Default)]
struct Store {
    buckets: HashMap<BucketKey, FundingHistory>,
    billed: HashMap<EventId, EventConsumption>,
}

/// Process-local repository used for draft runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryFundingHistoryRepository {
    store: RwLock<Store>,
}

impl InMemoryFundingHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_histories(histories: impl IntoIterator<Item = FundingHistory>) -> Self {
        Self {
            store: RwLock::new(Store {
                buckets: histories.into_iter().map(|h| (h.key(), h)).collect(),
                billed: HashMap::new(),
            }),
        }
    }

    pub async fn get(&self, key: &BucketKey) -> Option<FundingHistory> {
        self.store.read().await.buckets.get(key).cloned()
    }
}

#[async_trait]
impl FundingHistoryRepository for InMemoryFundingHistoryRepository {
    async fn fetch(&self, funding_version_ids: &[VersionId]) -> Result<Vec<FundingHistory>> {
        let wanted: HashSet<&VersionId> = funding_version_ids.iter().collect();
        let store = self.store.read().await;
        let mut histories: Vec<FundingHistory> = store
            .buckets
            .values()
            .filter(|h| wanted.contains(&h.funding_version_id))
            .cloned()
            .collect();
        histories.sort_by_key(|h| h.key());
        Ok(histories)
    }

    async fn billed_events(&self, event_ids: &[EventId]) -> Result<Vec<EventConsumption>> {
        let wanted: HashSet<&EventId> = event_ids.iter().collect();
        let store = self.store.read().await;
        let mut billed: Vec<EventConsumption> = wanted
            .into_iter()
            .filter_map(|id| store.billed.get(id).cloned())
            .collect();
        billed.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(billed)
    }

    async fn commit(&self, commit: &FundingCommit) -> Result<Vec<FundingHistory>> {
        let mut store = self.store.write().await;

        for update in &commit.histories {
            let stored = store.buckets.get(&update.key()).map_or(0, |h| h.revision);
            if stored != update.revision {
                return Err(conflict(update));
            }
        }
        if let Some(billed) = commit.billed.iter().find(|b| store.billed.contains_key(&b.event_id)) {
            return Err(event_conflict(&billed.event_id, "billed"));
        }
        if let Some(event_id) = commit.unbilled.iter().find(|id| !store.billed.contains_key(*id)) {
            return Err(event_conflict(event_id, "unbilled"));
        }

        let committed: Vec<FundingHistory> = commit
            .histories
            .iter()
            .map(|update| FundingHistory {
                revision: update.revision + 1,
                ..update.clone()
            })
            .collect();
        for history in &committed {
            store.buckets.insert(history.key(), history.clone());
        }
        for event_id in &commit.unbilled {
            store.billed.remove(event_id);
        }
        for billed in &commit.billed {
            store.billed.insert(billed.event_id.clone(), billed.clone());
        }

        debug!(
            buckets = committed.len(),
            billed = commit.billed.len(),
            unbilled = commit.unbilled.len(),
            "Funding histories committed"
        );
        Ok(committed)
    }
}

pub struct SqlFundingHistoryRepository {
    pool: PgPool,
}

impl SqlFundingHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_history(
        tx: &mut Transaction<'_, Postgres>,
        update: &FundingHistory,
    ) -> Result<FundingHistory> {
        let funding_version_id = update.funding_version_id.to_string();
        let period_key = update.period.to_string();
        lock_in_transaction(
            &mut **tx,
            BucketLockKey::for_bucket(&funding_version_id, &period_key),
        )
        .await?;

        let result = if update.revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO billing.funding_histories
                    (funding_version_id, period_key, care_hours, amount_ttc, revision, updated_at)
                VALUES ($1, $2, $3, $4, 1, NOW())
                ON CONFLICT (funding_version_id, period_key) DO NOTHING
                "#,
            )
            .bind(&funding_version_id)
            .bind(&period_key)
            .bind(update.care_hours)
            .bind(update.amount_ttc.as_decimal())
            .execute(&mut **tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE billing.funding_histories
                SET care_hours = $3,
                    amount_ttc = $4,
                    revision = revision + 1,
                    updated_at = NOW()
                WHERE funding_version_id = $1 AND period_key = $2 AND revision = $5
                "#,
            )
            .bind(&funding_version_id)
            .bind(&period_key)
            .bind(update.care_hours)
            .bind(update.amount_ttc.as_decimal())
            .bind(update.revision)
            .execute(&mut **tx)
            .await
        }
        .map_err(|e| BillingError::DatabaseError {
            operation: "write_funding_history".to_string(),
            source: Box::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(conflict(update));
        }

        Ok(FundingHistory {
            revision: update.revision + 1,
            ..update.clone()
        })
    }

    async fn record_billed_event(
        tx: &mut Transaction<'_, Postgres>,
        billed: &EventConsumption,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing.billed_events
                (event_id, funding_version_id, period_key, care_hours, amount_ttc, billed_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(billed.event_id.to_string())
        .bind(billed.bucket.as_ref().map(|k| k.funding_version_id.to_string()))
        .bind(billed.bucket.as_ref().map(|k| k.period.to_string()))
        .bind(billed.consumption.care_hours)
        .bind(billed.consumption.amount_ttc.as_decimal())
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "record_billed_event".to_string(),
            source: Box::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(event_conflict(&billed.event_id, "billed"));
        }
        Ok(())
    }

    async fn forget_billed_event(tx: &mut Transaction<'_, Postgres>, event_id: &EventId) -> Result<()> {
        let result = sqlx::query("DELETE FROM billing.billed_events WHERE event_id = $1")
            .bind(event_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| BillingError::DatabaseError {
                operation: "forget_billed_event".to_string(),
                source: Box::new(e),
            })?;

        if result.rows_affected() == 0 {
            return Err(event_conflict(event_id, "unbilled"));
        }
        Ok(())
    }
}

#[async_trait]
impl FundingHistoryRepository for SqlFundingHistoryRepository {
    async fn fetch(&self, funding_version_ids: &[VersionId]) -> Result<Vec<FundingHistory>> {
        let ids: Vec<String> = funding_version_ids.iter().map(|id| id.to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT funding_version_id, period_key, care_hours, amount_ttc, revision
            FROM billing.funding_histories
            WHERE funding_version_id = ANY($1)
            ORDER BY funding_version_id, period_key
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "fetch_funding_histories".to_string(),
            source: Box::new(e),
        })?;

        rows.into_iter()
            .map(|row| {
                let period: String = row.get("period_key");
                Ok(FundingHistory {
                    funding_version_id: VersionId::new(row.get::<String, _>("funding_version_id")),
                    period: period.parse::<PeriodKey>()?,
                    care_hours: row.get("care_hours"),
                    amount_ttc: Money::from_decimal(row.get("amount_ttc")),
                    revision: row.get("revision"),
                })
            })
            .collect()
    }

    async fn billed_events(&self, event_ids: &[EventId]) -> Result<Vec<EventConsumption>> {
        let ids: Vec<String> = event_ids.iter().map(|id| id.to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT event_id, funding_version_id, period_key, care_hours, amount_ttc
            FROM billing.billed_events
            WHERE event_id = ANY($1)
            ORDER BY event_id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "fetch_billed_events".to_string(),
            source: Box::new(e),
        })?;

        rows.into_iter()
            .map(|row| {
                let funding_version_id: Option<String> = row.get("funding_version_id");
                let period: Option<String> = row.get("period_key");
                let bucket = match (funding_version_id, period) {
                    (Some(version), Some(period)) => Some(BucketKey {
                        funding_version_id: VersionId::new(version),
                        period: period.parse::<PeriodKey>()?,
                    }),
                    _ => None,
                };
                Ok(EventConsumption {
                    event_id: EventId::new(row.get::<String, _>("event_id")),
                    bucket,
                    consumption: Consumption {
                        care_hours: row.get("care_hours"),
                        amount_ttc: Money::from_decimal(row.get("amount_ttc")),
                    },
                })
            })
            .collect()
    }

    async fn commit(&self, commit: &FundingCommit) -> Result<Vec<FundingHistory>> {
        let mut ordered: Vec<&FundingHistory> = commit.histories.iter().collect();
        // Lock in key order so two runs never wait on each other crosswise.
        ordered.sort_by_key(|h| h.key());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::DatabaseError {
                operation: "begin_commit_funding_histories".to_string(),
                source: Box::new(e),
            })?;

        // Any early return drops the transaction and rolls back earlier writes.
        let mut committed = Vec::with_capacity(ordered.len());
        for update in ordered {
            committed.push(Self::write_history(&mut tx, update).await?);
        }
        for event_id in &commit.unbilled {
            Self::forget_billed_event(&mut tx, event_id).await?;
        }
        for billed in &commit.billed {
            Self::record_billed_event(&mut tx, billed).await?;
        }

        tx.commit().await.map_err(|e| BillingError::DatabaseError {
            operation: "commit_funding_histories".to_string(),
            source: Box::new(e),
        })?;

        debug!(
            buckets = committed.len(),
            billed = commit.billed.len(),
            unbilled = commit.unbilled.len(),
            "Funding histories committed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn history(version: &str, period: PeriodKey, hours: rust_decimal::Decimal, revision: i64) -> FundingHistory {
        FundingHistory {
            funding_version_id: VersionId::new(version),
            period,
            care_hours: hours,
            amount_ttc: Money::ZERO,
            revision,
        }
    }

    fn buckets(histories: Vec<FundingHistory>) -> FundingCommit {
        FundingCommit {
            histories,
            ..FundingCommit::default()
        }
    }

    fn billed(event_id: &str, bucket: Option<BucketKey>, hours: rust_decimal::Decimal) -> EventConsumption {
        EventConsumption {
            event_id: EventId::new(event_id),
            bucket,
            consumption: Consumption {
                care_hours: hours,
                amount_ttc: Money::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn test_commit_creates_and_bumps_revisions() {
        let repo = InMemoryFundingHistoryRepository::new();
        let may = PeriodKey::Month { year: 2024, month: 5 };

        let committed = repo.commit(&buckets(vec![history("fv-1", may, dec!(2), 0)])).await.unwrap();
        assert_eq!(committed[0].revision, 1);

        let committed = repo
            .commit(&buckets(vec![history("fv-1", may, dec!(3), 1)]))
            .await
            .unwrap();
        assert_eq!(committed[0].revision, 2);

        let stored = repo.fetch(&[VersionId::new("fv-1")]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].care_hours, dec!(3));
        assert_eq!(stored[0].revision, 2);
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected_without_partial_writes() {
        let repo = InMemoryFundingHistoryRepository::with_histories([history(
            "fv-1",
            PeriodKey::Once,
            dec!(5),
            3,
        )]);

        let result = repo
            .commit(&FundingCommit {
                histories: vec![
                    history("fv-2", PeriodKey::Once, dec!(1), 0),
                    history("fv-1", PeriodKey::Once, dec!(6), 2),
                ],
                billed: vec![billed("evt-1", None, dec!(0))],
                unbilled: vec![],
            })
            .await;
        assert!(result.unwrap_err().is_conflict());

        assert!(repo.fetch(&[VersionId::new("fv-2")]).await.unwrap().is_empty());
        assert!(repo.billed_events(&[EventId::new("evt-1")]).await.unwrap().is_empty());
        let key = BucketKey {
            funding_version_id: VersionId::new("fv-1"),
            period: PeriodKey::Once,
        };
        assert_eq!(repo.get(&key).await.unwrap().care_hours, dec!(5));
    }

    #[tokio::test]
    async fn test_fetch_filters_by_version() {
        let repo = InMemoryFundingHistoryRepository::with_histories([
            history("fv-1", PeriodKey::Once, dec!(1), 1),
            history("fv-2", PeriodKey::Once, dec!(2), 1),
        ]);
        let fetched = repo.fetch(&[VersionId::new("fv-2")]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].care_hours, dec!(2));
    }

    #[tokio::test]
    async fn test_events_are_billed_once_until_unbilled() {
        let repo = InMemoryFundingHistoryRepository::new();
        let key = BucketKey {
            funding_version_id: VersionId::new("fv-1"),
            period: PeriodKey::Once,
        };
        let first = FundingCommit {
            histories: vec![history("fv-1", PeriodKey::Once, dec!(1), 0)],
            billed: vec![billed("evt-1", Some(key.clone()), dec!(1)), billed("evt-2", None, dec!(0))],
            unbilled: vec![],
        };
        repo.commit(&first).await.unwrap();

        let recorded = repo
            .billed_events(&[EventId::new("evt-2"), EventId::new("evt-1"), EventId::new("evt-9")])
            .await
            .unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].bucket, Some(key));
        assert_eq!(recorded[0].consumption.care_hours, dec!(1));

        let again = FundingCommit {
            histories: vec![],
            billed: vec![billed("evt-2", None, dec!(0))],
            unbilled: vec![],
        };
        assert!(repo.commit(&again).await.unwrap_err().is_conflict());

        let unbill = FundingCommit {
            histories: vec![],
            billed: vec![],
            unbilled: vec![EventId::new("evt-2")],
        };
        repo.commit(&unbill).await.unwrap();
        assert!(repo.commit(&unbill).await.unwrap_err().is_conflict());
        assert!(repo.billed_events(&[EventId::new("evt-2")]).await.unwrap().is_empty());
    }
}
