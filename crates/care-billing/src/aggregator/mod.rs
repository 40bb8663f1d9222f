pub mod billing_run;

pub use billing_run::{
    BillingRunReport, BillingRunRequest, BillingRunner, RunFailure, RunMode, RunWarning,
    UnbillReport,
};
