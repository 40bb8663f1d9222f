mod common;

use care_billing::domain::pricing::PricingOutcome;
use care_billing::domain::surcharge::{ClockTime, TimeWindowRule};
use care_billing::domain::{
    Catalog, EventPriceCalculator, FundingFrequency, FundingLedger, HolidayCalendar, Money,
    ServiceNature, SurchargeCategory, SurchargeEvaluator,
};
use chrono::Duration;
use common::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

fn clock(minute_of_day: u32) -> ClockTime {
    ClockTime::parse(
        "window",
        &format!("{:02}{:02}", minute_of_day / 60, minute_of_day % 60),
    )
    .unwrap()
}

fn tolerance() -> Decimal {
    Decimal::new(1, 9)
}

fn rounding_tolerance() -> Decimal {
    Decimal::new(1, 6)
}

proptest! {
    #[test]
    fn version_resolution_is_idempotent(
        day in 0i64..730,
        second_start in 1i64..365,
    ) {
        let mut subscription = subscription("sub", "srv", Decimal::from(22));
        let mut later = subscription.versions[0].clone();
        later.version_id = care_billing::domain::VersionId::new("sub-v2");
        later.start_date = at(2020, 1, 1, 0, 0) + Duration::days(second_start);
        later.created_at += Duration::days(second_start);
        subscription.versions.push(later);

        let when = at(2020, 1, 1, 12, 0) + Duration::days(day);
        let first = subscription.effective_at(when);
        prop_assert!(first.is_some());
        prop_assert_eq!(first, subscription.effective_at(when));
    }

    #[test]
    fn surcharges_never_lower_the_price(
        day in 0i64..366,
        start_minute in 0i64..(23 * 60),
        length in 1i64..60,
        evening in 0u32..=100,
        sunday in 0u32..=100,
        evening_start in 0u32..(24 * 60),
        evening_end in 0u32..(24 * 60),
    ) {
        let start = at(2024, 1, 1, 0, 0) + Duration::days(day) + Duration::minutes(start_minute);
        let minutes = length.min(24 * 60 - start_minute);
        let event = event("evt", "cus", "sub", start, minutes);

        let mut plan = plan("plan");
        plan.sunday = Some(pct(Decimal::from(sunday)));
        plan.evening = Some(pct(Decimal::from(evening)));
        plan.evening_start_time = Some(format!("{:02}{:02}", evening_start / 60, evening_start % 60));
        plan.evening_end_time = Some(format!("{:02}{:02}", evening_end / 60, evening_end % 60));

        let evaluator = SurchargeEvaluator::new(Arc::new(HolidayCalendar::french(2024)));
        let base = money(Decimal::from(minutes) / Decimal::from(3));
        let surcharged = evaluator.compute_price(&event, base, &plan).unwrap();

        prop_assert!(surcharged.price >= base);
    }

    #[test]
    fn window_split_conserves_minutes(
        window_start in 0u32..(24 * 60),
        window_end in 0u32..(24 * 60),
        start_minute in 0i64..(24 * 60 - 1),
        length in 1i64..(24 * 60),
    ) {
        prop_assume!(window_start != window_end);
        let rule = TimeWindowRule {
            category: SurchargeCategory::Custom,
            percentage: pct(Decimal::TEN),
            start: clock(window_start),
            end: clock(window_end),
        };
        let start = at(2024, 3, 12, 0, 0) + Duration::minutes(start_minute);
        let end = start + Duration::minutes(length.min(24 * 60 - start_minute));

        let split = rule.split(start, end);
        prop_assert!(split.inflated_minutes >= 0);
        prop_assert!(split.not_inflated_minutes >= 0);
        prop_assert_eq!(
            split.inflated_minutes + split.not_inflated_minutes,
            (end - start).num_minutes()
        );
    }

    #[test]
    fn hourly_ceiling_is_never_exceeded(
        ceiling_quarters in 1u32..80,
        participation in 0u32..=100,
        service_rate in 1u32..60,
        funding_rate in 1u32..60,
        lengths in prop::collection::vec(1i64..240, 1..20),
    ) {
        let ceiling = Decimal::from(ceiling_quarters) / Decimal::from(4);
        let calculator = EventPriceCalculator::new(Arc::new(HolidayCalendar::french(2024)));
        let catalog = Catalog::new(vec![service("srv", ServiceNature::Hourly, None)], vec![]);
        let subscription = subscription("sub", "srv", Decimal::from(service_rate));
        let funding = hourly_funding(
            "fund",
            "sub",
            "payer",
            FundingFrequency::Once,
            ceiling,
            Decimal::from(funding_rate),
            Decimal::from(participation),
        );
        let mut ledger = FundingLedger::new();
        let mut charged = Decimal::ZERO;

        for (i, minutes) in lengths.iter().enumerate() {
            let start = at(2024, 3, 1, 8, 0) + Duration::days(i as i64);
            let outcome = calculator
                .price(
                    &event(&format!("evt-{}", i), "cus", "sub", start, *minutes),
                    &subscription,
                    std::slice::from_ref(&funding),
                    &catalog,
                    &mut ledger,
                )
                .unwrap();
            let PricingOutcome::Priced(price) = outcome else {
                panic!("event skipped");
            };

            let share = price.funding.as_ref().unwrap();
            charged += share.charged_hours;
            prop_assert!(share.history.care_hours <= ceiling);
            prop_assert!(share.third_party_payer_price >= Money::ZERO);

            let total = price.customer_price + share.third_party_payer_price;
            prop_assert!((total - price.excl_taxes).as_decimal().abs() < rounding_tolerance());
            if funding_rate <= service_rate {
                prop_assert!(price.customer_price.as_decimal() > -tolerance());
            }
        }

        prop_assert!(charged <= ceiling + tolerance());
    }

    #[test]
    fn fixed_funding_splits_the_whole_price(
        amount in 1u32..500,
        consumed in 0u32..500,
        rate in 1u32..200,
        minutes in 1i64..300,
    ) {
        let calculator = EventPriceCalculator::new(Arc::new(HolidayCalendar::french(2024)));
        let catalog = Catalog::new(vec![service("srv", ServiceNature::Hourly, None)], vec![]);
        let funding = fixed_funding(
            "fund",
            "sub",
            "payer",
            FundingFrequency::Once,
            Decimal::from(amount),
        );
        let already = Decimal::from(consumed.min(amount));
        let mut ledger = FundingLedger::from_histories([history(
            "fund-v1",
            care_billing::domain::PeriodKey::Once,
            Decimal::ZERO,
            already,
        )]);

        let outcome = calculator
            .price(
                &event("evt", "cus", "sub", at(2024, 3, 5, 8, 0), minutes),
                &subscription("sub", "srv", Decimal::from(rate)),
                std::slice::from_ref(&funding),
                &catalog,
                &mut ledger,
            )
            .unwrap();
        let PricingOutcome::Priced(price) = outcome else {
            panic!("event skipped");
        };

        let share = price.funding.as_ref().unwrap();
        let total = price.customer_price + share.third_party_payer_price;
        prop_assert!((total - price.excl_taxes).as_decimal().abs() < rounding_tolerance());
        prop_assert!(price.customer_price.as_decimal() > -tolerance());
        prop_assert!(share.history.amount_ttc.as_decimal() <= Decimal::from(amount));
    }
}
