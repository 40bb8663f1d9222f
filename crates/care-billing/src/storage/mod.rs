pub mod funding_history;
pub mod loader;

pub use funding_history::{
    FundingCommit, FundingHistoryRepository, InMemoryFundingHistoryRepository, SqlFundingHistoryRepository,
};
pub use loader::{BillingDataSource, CustomerBillingData, CustomerRecord, Dataset, JsonDataSource};
