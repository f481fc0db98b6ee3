use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    error::{BillingError, BillingResult},
    models::{
        ConditionsId, Contract, DraftReport, MonthlyConditions, PropertyId, Reading,
        ReportFigures, Utility,
    },
    units::{metered_cost, MeterValue, Month},
};

/// Pre-replacement readings of swapped meters, supplied out of band by the
/// caller. A meter flagged as replaced on the closing reading is billed from
/// its baseline instead of the opening reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementBaselines {
    #[serde(default)]
    pub cold: Option<MeterValue>,
    #[serde(default)]
    pub hot: Option<MeterValue>,
    #[serde(default)]
    pub heating: Option<MeterValue>,
}

impl ReplacementBaselines {
    pub fn get(&self, utility: Utility) -> Option<MeterValue> {
        match utility {
            Utility::Cold => self.cold,
            Utility::Hot => self.hot,
            Utility::Heating => self.heating,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationContext {
    pub baselines: ReplacementBaselines,
    pub timezone: Tz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UtilityConsumption {
    pub start: MeterValue,
    pub next: MeterValue,
    pub baseline: Option<MeterValue>,
    pub delta: MeterValue,
    pub cost_raw: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumptionBreakdown {
    pub cold: UtilityConsumption,
    pub hot: UtilityConsumption,
    pub heating: UtilityConsumption,
}

impl ConsumptionBreakdown {
    pub fn replacement_applied(&self) -> bool {
        [self.cold, self.hot, self.heating]
            .iter()
            .any(|consumption| consumption.baseline.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub draft: DraftReport,
    pub consumption: ConsumptionBreakdown,
}

/// Turns two bounding readings and a month's conditions into a draft report.
///
/// Pure and deterministic: the same inputs always yield the same figures, and
/// nothing is read from or written to a store.
pub fn compute_report(
    contract: &Contract,
    month: Month,
    conditions: &MonthlyConditions,
    start: &Reading,
    next: &Reading,
    context: &ReconciliationContext,
) -> BillingResult<Reconciliation> {
    check_preconditions(contract, month, conditions, start, next, context.timezone)?;

    let consumption = |utility: Utility| {
        consumption_for(
            contract,
            month,
            utility,
            conditions.price(utility),
            start,
            next,
            &context.baselines,
        )
    };
    let cold = consumption(Utility::Cold)?;
    let hot = consumption(Utility::Hot)?;
    let heating = consumption(Utility::Heating)?;

    let fixed_cost = conditions.manager_fee;
    let actual_rent = cold
        .cost_raw
        .checked_add(hot.cost_raw)
        .and_then(|sum| sum.checked_add(heating.cost_raw))
        .and_then(|sum| sum.checked_add(fixed_cost))
        .ok_or_else(|| validation("Report amounts overflow."))?;
    let balance = conditions
        .advance_payment
        .checked_sub(actual_rent)
        .ok_or_else(|| validation("Report balance overflows."))?;

    Ok(Reconciliation {
        draft: DraftReport {
            contract_id: contract.id,
            month,
            anchor_reading_id: start.id,
            anchor_reading_next_id: next.id,
            monthly_conditions_id: conditions.id,
            conditions_updated_at: conditions.updated_at,
            figures: ReportFigures {
                meter_cost_cold_raw: cold.cost_raw,
                meter_cost_hot_raw: hot.cost_raw,
                meter_cost_heating_raw: heating.cost_raw,
                fixed_cost_raw: fixed_cost,
                actual_rent_raw: actual_rent,
                balance_raw: balance,
            },
        },
        consumption: ConsumptionBreakdown { cold, hot, heating },
    })
}

fn check_preconditions(
    contract: &Contract,
    month: Month,
    conditions: &MonthlyConditions,
    start: &Reading,
    next: &Reading,
    timezone: Tz,
) -> BillingResult<()> {
    for reading in [start, next] {
        if reading.property_id != contract.property_id {
            return Err(validation(format!(
                "Reading {} belongs to property {}, not to property {} of contract {}.",
                reading.id, reading.property_id, contract.property_id, contract.id
            )));
        }
    }
    if conditions.property_id != contract.property_id || conditions.month != month {
        return Err(validation(format!(
            "Monthly conditions {} cover property {} in {}, expected property {} in {month}.",
            conditions.id, conditions.property_id, conditions.month, contract.property_id
        )));
    }
    if !contract.period.covers_month(month) {
        return Err(validation(format!(
            "Contract {} ({}) does not cover {month}.",
            contract.id,
            contract.period.to_range_literal()
        )));
    }
    for reading in [start, next] {
        if reading.is_deleted() {
            return Err(BillingError::Reconciliation {
                contract_id: contract.id,
                month,
                reason: format!("anchor reading {} is deleted", reading.id),
            });
        }
    }
    if next.reading_at <= start.reading_at {
        return Err(validation(format!(
            "Reading {} ({}) must be taken after reading {} ({}).",
            next.id, next.reading_at, start.id, start.reading_at
        )));
    }
    let start_month = start.billing_month(timezone);
    let next_month = next.billing_month(timezone);
    if start_month > month || month > next_month {
        return Err(validation(format!(
            "Readings {} ({start_month}) and {} ({next_month}) do not bound {month}.",
            start.id, next.id
        )));
    }
    Ok(())
}

fn consumption_for(
    contract: &Contract,
    month: Month,
    utility: Utility,
    unit_price: i64,
    start: &Reading,
    next: &Reading,
    baselines: &ReplacementBaselines,
) -> BillingResult<UtilityConsumption> {
    let reconciliation_error = |reason: String| BillingError::Reconciliation {
        contract_id: contract.id,
        month,
        reason,
    };
    let start_value = start.value(utility);
    let next_value = next.value(utility);

    let (baseline, from) = if next.replaced(utility) {
        let baseline = baselines.get(utility).ok_or_else(|| {
            reconciliation_error(format!(
                "the {} meter was replaced at reading {} and no replacement baseline was supplied",
                utility.as_str(),
                next.id
            ))
        })?;
        if baseline > next_value {
            return Err(reconciliation_error(format!(
                "the {} replacement baseline {baseline} is above the closing value {next_value} of reading {}",
                utility.as_str(),
                next.id
            )));
        }
        (Some(baseline), baseline)
    } else {
        (None, start_value)
    };

    let delta = next_value
        .checked_sub(from)
        .ok_or_else(|| validation("Meter delta overflows."))?;
    if delta.is_negative() {
        return Err(reconciliation_error(format!(
            "the {} meter runs backwards from {start_value} (reading {}) to {next_value} (reading {}) without a replacement flag",
            utility.as_str(),
            start.id,
            next.id
        )));
    }
    let cost_raw = metered_cost(delta, unit_price).ok_or_else(|| {
        validation(format!(
            "The {} cost of {delta} at {unit_price} overflows.",
            utility.as_str()
        ))
    })?;

    Ok(UtilityConsumption {
        start: start_value,
        next: next_value,
        baseline,
        delta,
        cost_raw,
    })
}

/// Expected cost of a month from its forecast consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForecastProjection {
    pub monthly_conditions_id: ConditionsId,
    pub property_id: PropertyId,
    pub month: Month,
    pub meter_cost_cold_raw: i64,
    pub meter_cost_hot_raw: i64,
    pub meter_cost_heating_raw: i64,
    pub fixed_cost_raw: i64,
    pub projected_rent_raw: i64,
    pub advance_payment_raw: i64,
    pub projected_balance_raw: i64,
}

pub fn project_forecast(conditions: &MonthlyConditions) -> BillingResult<ForecastProjection> {
    let cost = |utility: Utility| {
        metered_cost(conditions.forecast(utility), conditions.price(utility))
            .ok_or_else(|| validation("Forecast cost overflows."))
    };
    let cold = cost(Utility::Cold)?;
    let hot = cost(Utility::Hot)?;
    let heating = cost(Utility::Heating)?;
    let projected_rent = cold
        .checked_add(hot)
        .and_then(|sum| sum.checked_add(heating))
        .and_then(|sum| sum.checked_add(conditions.manager_fee))
        .ok_or_else(|| validation("Forecast amounts overflow."))?;
    let projected_balance = conditions
        .advance_payment
        .checked_sub(projected_rent)
        .ok_or_else(|| validation("Forecast balance overflows."))?;

    Ok(ForecastProjection {
        monthly_conditions_id: conditions.id,
        property_id: conditions.property_id,
        month: conditions.month,
        meter_cost_cold_raw: cold,
        meter_cost_hot_raw: hot,
        meter_cost_heating_raw: heating,
        fixed_cost_raw: conditions.manager_fee,
        projected_rent_raw: projected_rent,
        advance_payment_raw: conditions.advance_payment,
        projected_balance_raw: projected_balance,
    })
}

fn validation(message: impl Into<String>) -> BillingError {
    BillingError::Validation(message.into())
}
