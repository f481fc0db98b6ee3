use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::{
    error::{BillingError, BillingResult},
    models::{ContractId, Reading, ReadingId, ReadingType, Report},
    repository::store::BillingStore,
    services::{
        reconciliation::{
            compute_report, ConsumptionBreakdown, ReconciliationContext, ReplacementBaselines,
        },
        registry::conditions_for_month,
    },
    units::Month,
};

type GenerationKey = (ContractId, Month);

/// Serializes report generation per `(contract_id, month)` inside the process.
#[derive(Clone, Default)]
pub struct GenerationLocks {
    inner: Arc<Mutex<HashMap<GenerationKey, Arc<Mutex<()>>>>>,
}

impl GenerationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, contract_id: ContractId, month: Month) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            // Entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry((contract_id, month)).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub contract_id: ContractId,
    pub month: Month,
    pub anchor_reading_id: Option<ReadingId>,
    pub anchor_reading_next_id: Option<ReadingId>,
    pub baselines: ReplacementBaselines,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedReport {
    pub report: Report,
    pub consumption: ConsumptionBreakdown,
}

/// Fetches inputs, runs the reconciliation engine and saves the draft while
/// holding the generation lock for the contract and month.
pub async fn generate_report(
    store: &dyn BillingStore,
    locks: &GenerationLocks,
    request: GenerationRequest,
    timezone: Tz,
    now: DateTime<Utc>,
) -> BillingResult<GeneratedReport> {
    let _guard = locks.acquire(request.contract_id, request.month).await;

    let contract = store.get_contract(request.contract_id).await?;
    let property = store.get_property(contract.property_id).await?;
    if request.month < property.start_month {
        return Err(BillingError::Validation(format!(
            "Month {} precedes the start month {} of property {}.",
            request.month, property.start_month, property.id
        )));
    }
    let conditions = conditions_for_month(store, property.id, request.month).await?;

    let (start, next) = match (request.anchor_reading_id, request.anchor_reading_next_id) {
        (Some(start_id), Some(next_id)) => (
            store.get_reading(start_id).await?,
            store.get_reading(next_id).await?,
        ),
        (None, None) => {
            let readings = store.list_readings(property.id, false).await?;
            let (start, next) = select_anchors(&readings, request.month, timezone)?;
            (start.clone(), next.clone())
        }
        _ => {
            return Err(BillingError::Validation(
                "Provide both anchor readings or neither.".to_string(),
            ))
        }
    };

    let reconciliation = compute_report(
        &contract,
        request.month,
        &conditions,
        &start,
        &next,
        &ReconciliationContext {
            baselines: request.baselines,
            timezone,
        },
    )?;
    let report = store.save_draft_report(reconciliation.draft, now).await?;

    info!(
        report_id = %report.id,
        contract_id = %report.contract_id,
        month = %report.month,
        anchor_reading_id = %report.anchor_reading_id,
        anchor_reading_next_id = %report.anchor_reading_next_id,
        actual_rent_raw = report.figures.actual_rent_raw,
        balance_raw = report.figures.balance_raw,
        replacement_applied = reconciliation.consumption.replacement_applied(),
        "Report generated"
    );
    Ok(GeneratedReport {
        report,
        consumption: reconciliation.consumption,
    })
}

/// Picks the readings bounding `month` from live readings of one property.
///
/// The opening anchor is a reading of `month` itself, preferring `initial`
/// over `periodic` over `final`. The closing anchor is a reading of the
/// following month, preferring `final` over `periodic` over `initial`, or a
/// later `final` reading within `month` when the tenancy ends mid-month.
pub fn select_anchors<'a>(
    readings: &'a [Reading],
    month: Month,
    timezone: Tz,
) -> BillingResult<(&'a Reading, &'a Reading)> {
    let live = || readings.iter().filter(|reading| !reading.is_deleted());

    let start = live()
        .filter(|reading| reading.billing_month(timezone) == month)
        .min_by_key(|reading| (opening_rank(reading.reading_type), reading.reading_at))
        .ok_or_else(|| {
            BillingError::Validation(format!("No reading opens the billing month {month}."))
        })?;

    let following = month.next();
    let next = live()
        .filter(|reading| {
            reading.reading_at > start.reading_at
                && reading.billing_month(timezone) == following
        })
        .min_by_key(|reading| (closing_rank(reading.reading_type), reading.reading_at))
        .or_else(|| {
            live()
                .filter(|reading| {
                    reading.reading_type == ReadingType::Final
                        && reading.reading_at > start.reading_at
                        && reading.billing_month(timezone) == month
                })
                .min_by_key(|reading| reading.reading_at)
        })
        .ok_or_else(|| {
            BillingError::Validation(format!(
                "No reading closes the billing month {month} after reading {}.",
                start.id
            ))
        })?;

    Ok((start, next))
}

fn opening_rank(reading_type: ReadingType) -> u8 {
    match reading_type {
        ReadingType::Initial => 0,
        ReadingType::Periodic => 1,
        ReadingType::Final => 2,
    }
}

fn closing_rank(reading_type: ReadingType) -> u8 {
    match reading_type {
        ReadingType::Final => 0,
        ReadingType::Periodic => 1,
        ReadingType::Initial => 2,
    }
}
