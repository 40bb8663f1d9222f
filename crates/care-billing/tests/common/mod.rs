#![allow(dead_code)]

use care_billing::domain::{
    CareDay, Customer, CustomerId, Event, EventId, Funding, FundingFrequency, FundingHistory,
    FundingId, FundingNature, FundingVersion, Money, Percentage, PeriodKey, Service, ServiceId,
    ServiceNature, ServiceVersion, Subscription, SubscriptionGroup, SubscriptionId,
    SubscriptionVersion, SurchargePlan, ThirdPartyPayerId, VersionId,
};
use care_billing::domain::types::SurchargePlanId;
use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;

pub const VAT: Decimal = Decimal::TEN;

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

pub fn pct(value: Decimal) -> Percentage {
    Percentage::new("test", value).unwrap()
}

pub fn money(value: Decimal) -> Money {
    Money::from_decimal(value)
}

pub fn customer(id: &str) -> Customer {
    Customer {
        id: CustomerId::new(id),
        name: format!("Customer {}", id),
    }
}

pub fn event(id: &str, customer_id: &str, subscription_id: &str, start: NaiveDateTime, minutes: i64) -> Event {
    Event {
        id: EventId::new(id),
        customer_id: CustomerId::new(customer_id),
        subscription_id: SubscriptionId::new(subscription_id),
        auxiliary_id: None,
        start_date: start,
        end_date: start + Duration::minutes(minutes),
        is_billed: false,
    }
}

pub fn subscription(id: &str, service_id: &str, unit_ttc_rate: Decimal) -> Subscription {
    Subscription {
        id: SubscriptionId::new(id),
        service_id: ServiceId::new(service_id),
        versions: vec![SubscriptionVersion {
            version_id: VersionId::new(format!("{}-v1", id)),
            unit_ttc_rate: money(unit_ttc_rate),
            estimated_weekly_volume: Decimal::from(10),
            start_date: at(2020, 1, 1, 0, 0),
            end_date: None,
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }],
    }
}

pub fn service(id: &str, nature: ServiceNature, surcharge: Option<&str>) -> Service {
    Service {
        id: ServiceId::new(id),
        versions: vec![ServiceVersion {
            version_id: VersionId::new(format!("{}-v1", id)),
            name: format!("Service {}", id),
            vat: pct(VAT),
            nature,
            surcharge: surcharge.map(SurchargePlanId::new),
            exempt_from_charges: false,
            start_date: at(2020, 1, 1, 0, 0),
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }],
    }
}

pub fn plan(id: &str) -> SurchargePlan {
    SurchargePlan {
        id: SurchargePlanId::new(id),
        name: format!("Plan {}", id),
        ..SurchargePlan::default()
    }
}

pub fn every_day() -> Vec<CareDay> {
    (0..=7).map(|d| CareDay::new(d).unwrap()).collect()
}

pub fn hourly_funding(
    id: &str,
    subscription_id: &str,
    payer: &str,
    frequency: FundingFrequency,
    care_hours: Decimal,
    unit_ttc_rate: Decimal,
    participation: Decimal,
) -> Funding {
    Funding {
        id: FundingId::new(id),
        subscription_id: SubscriptionId::new(subscription_id),
        third_party_payer: ThirdPartyPayerId::new(payer),
        nature: FundingNature::Hourly,
        frequency,
        versions: vec![FundingVersion {
            version_id: VersionId::new(format!("{}-v1", id)),
            start_date: at(2020, 1, 1, 0, 0),
            end_date: None,
            care_days: every_day(),
            care_hours: Some(care_hours),
            amount_ttc: None,
            unit_ttc_rate: Some(money(unit_ttc_rate)),
            customer_participation_rate: pct(participation),
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }],
    }
}

pub fn fixed_funding(
    id: &str,
    subscription_id: &str,
    payer: &str,
    frequency: FundingFrequency,
    amount_ttc: Decimal,
) -> Funding {
    Funding {
        id: FundingId::new(id),
        subscription_id: SubscriptionId::new(subscription_id),
        third_party_payer: ThirdPartyPayerId::new(payer),
        nature: FundingNature::Fixed,
        frequency,
        versions: vec![FundingVersion {
            version_id: VersionId::new(format!("{}-v1", id)),
            start_date: at(2020, 1, 1, 0, 0),
            end_date: None,
            care_days: every_day(),
            care_hours: None,
            amount_ttc: Some(money(amount_ttc)),
            unit_ttc_rate: None,
            customer_participation_rate: Percentage::ZERO,
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }],
    }
}

pub fn history(funding_version_id: &str, period: PeriodKey, care_hours: Decimal, amount_ttc: Decimal) -> FundingHistory {
    FundingHistory {
        funding_version_id: VersionId::new(funding_version_id),
        period,
        care_hours,
        amount_ttc: money(amount_ttc),
        revision: 1,
    }
}

pub fn group(subscription: Subscription, fundings: Vec<Funding>, events: Vec<Event>) -> SubscriptionGroup {
    SubscriptionGroup {
        subscription,
        fundings,
        events,
    }
}

/// Absolute difference of two amounts is below one ten-thousandth.
pub fn assert_close(actual: Decimal, expected: Decimal) {
    let delta = (actual - expected).abs();
    assert!(
        delta < Decimal::new(1, 4),
        "expected {} to be close to {} (delta {})",
        actual,
        expected,
        delta
    );
}
