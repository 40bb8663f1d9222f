pub mod bills;
pub mod customers;
pub mod funding;
pub mod holidays;
pub mod pricing;
pub mod services;
pub mod surcharge;
pub mod types;
pub mod versions;

pub use bills::{
    BillGroup, DraftBill, DraftBillAggregator, DraftBillLine, PayerBillGroup, PayerBillLine,
    SubscriptionBill, SubscriptionBiller, SubscriptionGroup,
};
pub use customers::{Customer, EffectiveSubscription, Event, Subscription, SubscriptionVersion};
pub use funding::{
    BucketKey, Consumption, EffectiveFunding, EventConsumption, Funding, FundingConsumptionTracker,
    FundingFrequency, FundingHistory, FundingLedger, FundingNature, FundingVersion,
};
pub use holidays::{HolidayCalendar, HolidayCalendarHandle};
pub use pricing::{Catalog, EventPrice, EventPriceCalculator, EventPriceRecord, PricingGap};
pub use services::{EffectiveService, Service, ServiceNature, ServiceVersion};
pub use surcharge::{SurchargeCategory, SurchargeEvaluator, SurchargePlan};
pub use types::{
    BillingPeriod, CareDay, CustomerId, EventId, FundingId, Money, Percentage, PeriodKey,
    ServiceId, SubscriptionId, ThirdPartyPayerId, VersionId,
};
pub use versions::{resolve_version, VersionKey, Versioned};
