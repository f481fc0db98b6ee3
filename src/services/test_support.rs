use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::{
    models::{
        ConditionsTerms, Contract, ContractPeriod, DraftReport, MonthlyConditions, NewContract,
        NewMonthlyConditions, NewProperty, NewReading, Property, Reading, ReadingOrigin,
        ReadingType, UserId,
    },
    repository::store::BillingStore,
    services::reconciliation::{compute_report, ReconciliationContext, ReplacementBaselines},
    units::{MeterValue, Month},
};

/// A property billed for January 2024: cold water runs 100 → 115 m³ at 50 per
/// m³, the manager fee is 300 and the advance 2000.
pub struct SeededMonth {
    pub property: Property,
    pub contract: Contract,
    pub conditions: MonthlyConditions,
    pub start: Reading,
    pub next: Reading,
    pub month: Month,
}

impl SeededMonth {
    pub fn draft(&self) -> DraftReport {
        compute_report(
            &self.contract,
            self.month,
            &self.conditions,
            &self.start,
            &self.next,
            &ReconciliationContext {
                baselines: ReplacementBaselines::default(),
                timezone: Tz::UTC,
            },
        )
        .expect("seeded month reconciles")
        .draft
    }
}

pub fn seeded_at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 8, 0, 0).unwrap()
}

pub fn reading_input(
    property: &Property,
    reading_type: ReadingType,
    reading_at: DateTime<Utc>,
    effective_month: Option<Month>,
    cold: i64,
) -> NewReading {
    NewReading {
        property_id: property.id,
        reading_type,
        reading_at,
        effective_month,
        cold_m3: MeterValue::from_whole(cold),
        hot_m3: MeterValue::from_whole(10),
        heating_gj: MeterValue::from_whole(1),
        cold_replaced: false,
        hot_replaced: false,
        heating_replaced: false,
        origin: ReadingOrigin::Manual,
        comment_text: None,
        comment_visible_to_tenant: false,
    }
}

pub fn seeded_terms() -> ConditionsTerms {
    ConditionsTerms {
        forecast_cold: MeterValue::from_whole(12),
        forecast_hot: MeterValue::from_whole(4),
        forecast_heating: MeterValue::from_whole(1),
        price_cold: 50,
        price_hot_heating: 120,
        price_heating: 400,
        advance_payment: 2000,
        manager_fee: 300,
    }
}

pub async fn seed_billing_month(store: &dyn BillingStore) -> SeededMonth {
    let month: Month = "2024-01".parse().unwrap();
    let property = store
        .insert_property(
            NewProperty {
                label: "Flat 4B".to_string(),
                start_month: month,
            },
            seeded_at(1, 1),
        )
        .await
        .unwrap();
    let contract = store
        .insert_contract(
            NewContract {
                property_id: property.id,
                tenant_user_id: UserId::generate(),
                period: ContractPeriod::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), None)
                    .unwrap(),
            },
            seeded_at(1, 1),
        )
        .await
        .unwrap();
    let conditions = store
        .insert_conditions(
            NewMonthlyConditions {
                property_id: property.id,
                month,
                terms: seeded_terms(),
            },
            seeded_at(1, 1),
        )
        .await
        .unwrap();
    let start = store
        .insert_reading(
            reading_input(&property, ReadingType::Initial, seeded_at(1, 1), Some(month), 100),
            seeded_at(1, 1),
        )
        .await
        .unwrap();
    let next = store
        .insert_reading(
            reading_input(
                &property,
                ReadingType::Periodic,
                seeded_at(2, 1),
                Some(month.next()),
                115,
            ),
            seeded_at(2, 1),
        )
        .await
        .unwrap();

    SeededMonth {
        property,
        contract,
        conditions,
        start,
        next,
        month,
    }
}
