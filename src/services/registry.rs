use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    error::{BillingError, BillingResult},
    models::{
        ConditionsId, ConditionsTerms, Contract, ContractPeriod, MonthlyConditions,
        NewContract, NewMonthlyConditions, NewProperty, NewReading, Property, PropertyId,
        PropertyUpdate, Reading, ReadingId, Utility,
    },
    repository::store::BillingStore,
    units::Month,
};

const MAX_LABEL_LENGTH: usize = 255;

pub async fn create_property(
    store: &dyn BillingStore,
    input: NewProperty,
    now: DateTime<Utc>,
) -> BillingResult<Property> {
    let input = NewProperty {
        label: normalize_label(&input.label)?,
        ..input
    };
    let property = store.insert_property(input, now).await?;
    info!(property_id = %property.id, start_month = %property.start_month, "Property created");
    Ok(property)
}

pub async fn update_property(
    store: &dyn BillingStore,
    id: PropertyId,
    update: PropertyUpdate,
    now: DateTime<Utc>,
) -> BillingResult<Property> {
    let label = update.label.as_deref().map(normalize_label).transpose()?;
    store
        .update_property(
            id,
            PropertyUpdate {
                label,
                start_month: update.start_month,
            },
            now,
        )
        .await
}

/// A property's `start_month` is frozen once anything references it.
pub fn check_property_update(
    property: &Property,
    update: &PropertyUpdate,
    referenced: bool,
) -> BillingResult<()> {
    let changes_start = update
        .start_month
        .is_some_and(|month| month != property.start_month);
    if changes_start && referenced {
        return Err(BillingError::Validation(format!(
            "Property {} is referenced by readings or reports; only its label can change.",
            property.id
        )));
    }
    Ok(())
}

fn normalize_label(raw: &str) -> BillingResult<String> {
    let label = raw.trim();
    if label.is_empty() || label.chars().count() > MAX_LABEL_LENGTH {
        return Err(BillingError::Validation(format!(
            "Property label must be between 1 and {MAX_LABEL_LENGTH} characters."
        )));
    }
    Ok(label.to_string())
}

pub async fn register_contract(
    store: &dyn BillingStore,
    input: NewContract,
    now: DateTime<Utc>,
) -> BillingResult<Contract> {
    store.get_property(input.property_id).await?;
    let contract = store.insert_contract(input, now).await?;
    info!(
        contract_id = %contract.id,
        property_id = %contract.property_id,
        period = %contract.period.to_range_literal(),
        "Contract registered"
    );
    Ok(contract)
}

pub fn find_overlapping_contract<'a>(
    existing: &'a [Contract],
    property_id: PropertyId,
    period: &ContractPeriod,
) -> Option<&'a Contract> {
    existing
        .iter()
        .find(|contract| contract.property_id == property_id && contract.period.overlaps(period))
}

pub fn overlapping_contract_error(existing: &Contract, period: &ContractPeriod) -> BillingError {
    BillingError::Validation(format!(
        "Contract period {} overlaps contract {} ({}) of property {}.",
        period.to_range_literal(),
        existing.id,
        existing.period.to_range_literal(),
        existing.property_id
    ))
}

pub async fn record_reading(
    store: &dyn BillingStore,
    input: NewReading,
    now: DateTime<Utc>,
) -> BillingResult<Reading> {
    let reading = store.insert_reading(input, now).await?;
    info!(
        reading_id = %reading.id,
        property_id = %reading.property_id,
        reading_type = %reading.reading_type,
        origin = %reading.origin,
        "Reading recorded"
    );
    Ok(reading)
}

/// Replaces a reading with a corrected one. The original stays in the store,
/// soft-deleted.
pub async fn correct_reading(
    store: &dyn BillingStore,
    original_id: ReadingId,
    input: NewReading,
    now: DateTime<Utc>,
) -> BillingResult<Reading> {
    let original = store.get_reading(original_id).await?;
    if original.is_deleted() {
        return Err(BillingError::Validation(format!(
            "Reading {original_id} is deleted and cannot be corrected."
        )));
    }
    let input = NewReading {
        property_id: original.property_id,
        ..input
    };
    let replacement = store.replace_reading(original_id, input, now).await?;
    info!(
        original_reading_id = %original_id,
        reading_id = %replacement.id,
        "Reading corrected"
    );
    Ok(replacement)
}

pub async fn delete_reading(
    store: &dyn BillingStore,
    id: ReadingId,
    now: DateTime<Utc>,
) -> BillingResult<Reading> {
    let reading = store.soft_delete_reading(id, now).await?;
    info!(reading_id = %id, "Reading soft-deleted");
    Ok(reading)
}

/// Readings cannot be assigned to a month before the property's start month.
pub fn check_reading_month(property: &Property, input: &NewReading) -> BillingResult<()> {
    match input.effective_month {
        Some(month) if month < property.start_month => Err(BillingError::Validation(format!(
            "Effective month {month} precedes the start month {} of property {}.",
            property.start_month, property.id
        ))),
        _ => Ok(()),
    }
}

/// A live reading already holding the candidate's (effective month, type) slot.
pub fn find_conflicting_reading<'a>(
    existing: &'a [Reading],
    candidate: &NewReading,
    ignore: Option<ReadingId>,
) -> Option<&'a Reading> {
    let month = candidate.effective_month?;
    existing.iter().find(|reading| {
        Some(reading.id) != ignore
            && !reading.is_deleted()
            && reading.property_id == candidate.property_id
            && reading.reading_type == candidate.reading_type
            && reading.effective_month == Some(month)
    })
}

pub fn conflicting_reading_error(existing: &Reading) -> BillingError {
    BillingError::Validation(format!(
        "Property {} already has a {} reading ({}) for {}.",
        existing.property_id,
        existing.reading_type,
        existing.id,
        existing
            .effective_month
            .map(|month| month.to_string())
            .unwrap_or_default()
    ))
}

/// Cumulative meters never run backwards between live readings, except across
/// a reading that flags the meter as replaced.
pub fn check_reading_sequence(
    existing: &[Reading],
    candidate: &NewReading,
    ignore: Option<ReadingId>,
) -> BillingResult<()> {
    for utility in Utility::ALL {
        if candidate.value(utility).is_negative() {
            return Err(BillingError::Validation(format!(
                "The {} meter value cannot be negative.",
                utility.as_str()
            )));
        }
    }

    let live = existing.iter().filter(|reading| {
        Some(reading.id) != ignore
            && !reading.is_deleted()
            && reading.property_id == candidate.property_id
    });

    let mut previous: Option<&Reading> = None;
    let mut next: Option<&Reading> = None;
    for reading in live {
        if reading.reading_at == candidate.reading_at {
            return Err(BillingError::Validation(format!(
                "Reading {} was already taken at {}.",
                reading.id, reading.reading_at
            )));
        }
        if reading.reading_at < candidate.reading_at {
            if previous.map_or(true, |current| reading.reading_at > current.reading_at) {
                previous = Some(reading);
            }
        } else if next.map_or(true, |current| reading.reading_at < current.reading_at) {
            next = Some(reading);
        }
    }

    for utility in Utility::ALL {
        if let Some(previous) = previous {
            if !candidate.replaced(utility) && candidate.value(utility) < previous.value(utility) {
                return Err(BillingError::Validation(format!(
                    "The {} meter would run backwards from {} (reading {}) to {} without a replacement flag.",
                    utility.as_str(),
                    previous.value(utility),
                    previous.id,
                    candidate.value(utility)
                )));
            }
        }
        if let Some(next) = next {
            if !next.replaced(utility) && next.value(utility) < candidate.value(utility) {
                return Err(BillingError::Validation(format!(
                    "The {} meter value {} exceeds the later reading {} ({}).",
                    utility.as_str(),
                    candidate.value(utility),
                    next.id,
                    next.value(utility)
                )));
            }
        }
    }
    Ok(())
}

pub async fn create_conditions(
    store: &dyn BillingStore,
    input: NewMonthlyConditions,
    now: DateTime<Utc>,
) -> BillingResult<MonthlyConditions> {
    let property = store.get_property(input.property_id).await?;
    if input.month < property.start_month {
        return Err(BillingError::Validation(format!(
            "Month {} precedes the start month {} of property {}.",
            input.month, property.start_month, property.id
        )));
    }
    validate_terms(&input.terms)?;
    let conditions = store.insert_conditions(input, now).await?;
    info!(
        conditions_id = %conditions.id,
        property_id = %conditions.property_id,
        month = %conditions.month,
        "Monthly conditions created"
    );
    Ok(conditions)
}

pub async fn update_conditions(
    store: &dyn BillingStore,
    id: ConditionsId,
    terms: ConditionsTerms,
    now: DateTime<Utc>,
) -> BillingResult<MonthlyConditions> {
    validate_terms(&terms)?;
    store.update_conditions(id, terms, now).await
}

pub async fn conditions_for_month(
    store: &dyn BillingStore,
    property_id: PropertyId,
    month: Month,
) -> BillingResult<MonthlyConditions> {
    store
        .find_conditions(property_id, month)
        .await?
        .ok_or_else(|| BillingError::not_found("monthly_conditions", format!("{property_id}/{month}")))
}

pub fn validate_terms(terms: &ConditionsTerms) -> BillingResult<()> {
    let amounts = [
        ("price_cold", terms.price_cold),
        ("price_hot_heating", terms.price_hot_heating),
        ("price_heating", terms.price_heating),
        ("advance_payment", terms.advance_payment),
        ("manager_fee", terms.manager_fee),
    ];
    if let Some((field, _)) = amounts.iter().find(|(_, amount)| *amount < 0) {
        return Err(BillingError::Validation(format!("{field} cannot be negative.")));
    }
    let forecasts = [
        ("forecast_cold", terms.forecast_cold),
        ("forecast_hot", terms.forecast_hot),
        ("forecast_heating", terms.forecast_heating),
    ];
    if let Some((field, _)) = forecasts.iter().find(|(_, value)| value.is_negative()) {
        return Err(BillingError::Validation(format!("{field} cannot be negative.")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone};

    use super::*;
    use crate::models::{ReadingOrigin, ReadingType, UserId};
    use crate::repository::memory::MemoryStore;
    use crate::units::MeterValue;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap()
    }

    fn month(raw: &str) -> Month {
        raw.parse().expect("valid month")
    }

    fn reading_input(property_id: PropertyId, when: DateTime<Utc>, cold: i64) -> NewReading {
        NewReading {
            property_id,
            reading_type: ReadingType::Periodic,
            reading_at: when,
            effective_month: None,
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

    async fn seeded_property(store: &MemoryStore) -> Property {
        create_property(
            store,
            NewProperty {
                label: "  Flat 4B ".to_string(),
                start_month: month("2024-01"),
            },
            at(1),
        )
        .await
        .expect("property")
    }

    fn period(start: &str, end: Option<&str>) -> ContractPeriod {
        let parse = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap();
        ContractPeriod::new(parse(start), end.map(parse)).unwrap()
    }

    #[tokio::test]
    async fn trims_labels_and_rejects_empty_ones() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        assert_eq!(property.label, "Flat 4B");

        let error = create_property(
            &store,
            NewProperty {
                label: "   ".to_string(),
                start_month: month("2024-01"),
            },
            at(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn start_month_freezes_once_readings_exist() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;

        let moved = update_property(
            &store,
            property.id,
            PropertyUpdate {
                label: None,
                start_month: Some(month("2023-12")),
            },
            at(2),
        )
        .await
        .expect("unreferenced property can move");
        assert_eq!(moved.start_month, month("2023-12"));

        record_reading(&store, reading_input(property.id, at(3), 100), at(3))
            .await
            .expect("reading");

        let error = update_property(
            &store,
            property.id,
            PropertyUpdate {
                label: Some("Flat 4C".to_string()),
                start_month: Some(month("2024-02")),
            },
            at(4),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));

        let relabelled = update_property(
            &store,
            property.id,
            PropertyUpdate {
                label: Some("Flat 4C".to_string()),
                start_month: None,
            },
            at(4),
        )
        .await
        .expect("label stays editable");
        assert_eq!(relabelled.label, "Flat 4C");
        assert_eq!(relabelled.start_month, month("2023-12"));
    }

    #[tokio::test]
    async fn rejects_overlapping_contracts_per_property() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        let other = seeded_property(&store).await;
        let tenant = UserId::generate();

        register_contract(
            &store,
            NewContract {
                property_id: property.id,
                tenant_user_id: tenant,
                period: period("2024-01-01", Some("2024-07-01")),
            },
            at(1),
        )
        .await
        .expect("first contract");

        let error = register_contract(
            &store,
            NewContract {
                property_id: property.id,
                tenant_user_id: UserId::generate(),
                period: period("2024-06-15", None),
            },
            at(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));
        assert_eq!(store.list_contracts(property.id).await.unwrap().len(), 1);

        register_contract(
            &store,
            NewContract {
                property_id: property.id,
                tenant_user_id: UserId::generate(),
                period: period("2024-07-01", None),
            },
            at(1),
        )
        .await
        .expect("adjacent period does not overlap");

        register_contract(
            &store,
            NewContract {
                property_id: other.id,
                tenant_user_id: tenant,
                period: period("2024-03-01", None),
            },
            at(1),
        )
        .await
        .expect("other properties are independent");
    }

    #[tokio::test]
    async fn contract_for_unknown_property_is_not_found() {
        let store = MemoryStore::new();
        let error = register_contract(
            &store,
            NewContract {
                property_id: PropertyId::generate(),
                tenant_user_id: UserId::generate(),
                period: period("2024-01-01", None),
            },
            at(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, BillingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn readings_must_not_run_backwards_without_replacement() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        record_reading(&store, reading_input(property.id, at(1), 100), at(1))
            .await
            .unwrap();
        record_reading(&store, reading_input(property.id, at(20), 130), at(20))
            .await
            .unwrap();

        let backwards = record_reading(&store, reading_input(property.id, at(25), 90), at(25))
            .await
            .unwrap_err();
        assert!(matches!(backwards, BillingError::Validation(_)));

        let above_later = record_reading(&store, reading_input(property.id, at(10), 140), at(10))
            .await
            .unwrap_err();
        assert!(matches!(above_later, BillingError::Validation(_)));

        let mut swapped = reading_input(property.id, at(25), 2);
        swapped.cold_replaced = true;
        record_reading(&store, swapped, at(25))
            .await
            .expect("replacement flag allows a reset");
    }

    #[tokio::test]
    async fn one_live_reading_per_month_and_type() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        let mut first = reading_input(property.id, at(1), 100);
        first.effective_month = Some(month("2024-01"));
        let stored = record_reading(&store, first, at(1)).await.unwrap();

        let mut duplicate = reading_input(property.id, at(2), 101);
        duplicate.effective_month = Some(month("2024-01"));
        let error = record_reading(&store, duplicate.clone(), at(2))
            .await
            .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));

        let mut final_reading = duplicate.clone();
        final_reading.reading_type = ReadingType::Final;
        record_reading(&store, final_reading, at(2))
            .await
            .expect("a different type may share the month");

        delete_reading(&store, stored.id, at(3)).await.unwrap();
        duplicate.reading_at = at(3) + Duration::hours(1);
        record_reading(&store, duplicate, at(3))
            .await
            .expect("deleted readings free their slot");
    }

    #[tokio::test]
    async fn correction_soft_deletes_the_original() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        let original = record_reading(&store, reading_input(property.id, at(5), 100), at(5))
            .await
            .unwrap();

        let corrected = correct_reading(
            &store,
            original.id,
            reading_input(property.id, at(5), 104),
            at(6),
        )
        .await
        .expect("correction");
        assert_eq!(corrected.cold_m3, MeterValue::from_whole(104));

        let original = store.get_reading(original.id).await.unwrap();
        assert_eq!(original.deleted_at, Some(at(6)));
        assert_eq!(store.list_readings(property.id, false).await.unwrap().len(), 1);

        let again = correct_reading(&store, original.id, reading_input(property.id, at(5), 1), at(7))
            .await
            .unwrap_err();
        assert!(matches!(again, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn one_conditions_row_per_property_month() {
        let store = MemoryStore::new();
        let property = seeded_property(&store).await;
        let terms = ConditionsTerms {
            forecast_cold: MeterValue::from_whole(10),
            forecast_hot: MeterValue::from_whole(5),
            forecast_heating: MeterValue::from_whole(2),
            price_cold: 50,
            price_hot_heating: 120,
            price_heating: 400,
            advance_payment: 2000,
            manager_fee: 300,
        };
        let input = NewMonthlyConditions {
            property_id: property.id,
            month: month("2024-01"),
            terms,
        };
        create_conditions(&store, input.clone(), at(1)).await.unwrap();
        let error = create_conditions(&store, input, at(1)).await.unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));

        let before_start = NewMonthlyConditions {
            property_id: property.id,
            month: month("2023-12"),
            terms,
        };
        assert!(create_conditions(&store, before_start, at(1)).await.is_err());

        let negative = ConditionsTerms {
            manager_fee: -1,
            ..terms
        };
        assert!(validate_terms(&negative).is_err());

        let found = conditions_for_month(&store, property.id, month("2024-01"))
            .await
            .unwrap();
        assert_eq!(found.terms(), terms);
        assert!(matches!(
            conditions_for_month(&store, property.id, month("2024-02")).await,
            Err(BillingError::NotFound { .. })
        ));
    }
}
