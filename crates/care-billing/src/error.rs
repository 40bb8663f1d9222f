use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the billing engine.
///
/// Reference-data gaps (no effective version for an event's date) are not
/// errors: they surface as run warnings. Everything here is either a broken
/// invariant in the input data or an infrastructure failure.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Event {event_id} has an invalid interval: {message}")]
    InvalidEventInterval { event_id: String, message: String },

    #[error("Invalid surcharge time string '{value}' for {field}")]
    InvalidTimeString { field: String, value: String },

    #[error("Percentage {value} for {field} is outside 0..=100")]
    InvalidPercentage { field: String, value: Decimal },

    #[error("Validation error on {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Funding history bucket {funding_version_id} {period} was modified concurrently")]
    ConcurrentModification {
        funding_version_id: String,
        period: String,
    },

    #[error("Event {event_id} was {change} concurrently")]
    EventBillingConflict { event_id: String, change: String },

    #[error("Database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Data source error: {message}")]
    DataSource { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl BillingError {
    /// True when retrying with a fresh read of the funding history may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BillingError::ConcurrentModification { .. } | BillingError::EventBillingConflict { .. }
        )
    }
}

impl From<care_common::distributed::LockError> for BillingError {
    fn from(err: care_common::distributed::LockError) -> Self {
        BillingError::DatabaseError {
            operation: "advisory_lock".to_string(),
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
