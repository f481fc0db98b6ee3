use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    error::{BillingError, BillingResult},
    models::{MonthlyConditions, Reading, Report, ReportFigures, ReportId, ReportStatus},
    repository::store::BillingStore,
};

/// Partial update of a draft's cost components. Totals are derived.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ReportPatch {
    pub meter_cost_cold_raw: Option<i64>,
    pub meter_cost_hot_raw: Option<i64>,
    pub meter_cost_heating_raw: Option<i64>,
    pub fixed_cost_raw: Option<i64>,
}

impl ReportPatch {
    pub fn is_empty(&self) -> bool {
        self.meter_cost_cold_raw.is_none()
            && self.meter_cost_hot_raw.is_none()
            && self.meter_cost_heating_raw.is_none()
            && self.fixed_cost_raw.is_none()
    }
}

/// Only drafts may be realized.
pub fn ensure_draft(report: &Report) -> BillingResult<()> {
    match report.status {
        ReportStatus::Draft => Ok(()),
        ReportStatus::Realized => Err(BillingError::AlreadyRealized {
            report_id: report.id,
        }),
    }
}

/// Computed fields of a realized report never change.
pub fn ensure_mutable(report: &Report) -> BillingResult<()> {
    match report.status {
        ReportStatus::Draft => Ok(()),
        ReportStatus::Realized => Err(BillingError::ImmutableReport {
            report_id: report.id,
        }),
    }
}

/// Both anchors must still exist and be live. `lookup` resolves an anchor id
/// to the stored reading, if any.
pub fn check_anchors_live<'a>(
    report: &Report,
    lookup: impl Fn(&crate::models::ReadingId) -> Option<&'a Reading>,
) -> BillingResult<()> {
    for reading_id in report.anchor_ids() {
        let live = lookup(&reading_id).is_some_and(|reading| !reading.is_deleted());
        if !live {
            return Err(BillingError::StaleAnchor {
                report_id: report.id,
                reading_id,
            });
        }
    }
    Ok(())
}

/// A draft's figures are only valid while its conditions row is unchanged
/// since the draft was last written.
pub fn check_conditions_current(
    report: &Report,
    conditions: &MonthlyConditions,
) -> BillingResult<()> {
    if conditions.id != report.monthly_conditions_id || conditions.updated_at > report.updated_at {
        return Err(BillingError::StaleConditions {
            conditions_id: report.monthly_conditions_id,
        });
    }
    Ok(())
}

/// Applies `patch` while keeping `actual_rent = Σ components` and
/// `balance = advance - actual_rent` with the advance implied by `current`.
pub fn apply_patch(current: &ReportFigures, patch: &ReportPatch) -> BillingResult<ReportFigures> {
    let advance_payment = current.advance_payment();
    let cold = patch.meter_cost_cold_raw.unwrap_or(current.meter_cost_cold_raw);
    let hot = patch.meter_cost_hot_raw.unwrap_or(current.meter_cost_hot_raw);
    let heating = patch
        .meter_cost_heating_raw
        .unwrap_or(current.meter_cost_heating_raw);
    let fixed = patch.fixed_cost_raw.unwrap_or(current.fixed_cost_raw);
    if [cold, hot, heating, fixed].iter().any(|amount| *amount < 0) {
        return Err(BillingError::Validation(
            "Report cost components cannot be negative.".to_string(),
        ));
    }
    let overflow = || BillingError::Validation("Report amounts overflow.".to_string());
    let actual_rent = cold
        .checked_add(hot)
        .and_then(|sum| sum.checked_add(heating))
        .and_then(|sum| sum.checked_add(fixed))
        .ok_or_else(overflow)?;
    let balance = advance_payment.checked_sub(actual_rent).ok_or_else(overflow)?;
    Ok(ReportFigures {
        meter_cost_cold_raw: cold,
        meter_cost_hot_raw: hot,
        meter_cost_heating_raw: heating,
        fixed_cost_raw: fixed,
        actual_rent_raw: actual_rent,
        balance_raw: balance,
    })
}

/// Freezes a draft. Exactly one of any number of concurrent callers wins;
/// the rest observe `AlreadyRealized`.
pub async fn realize_report(
    store: &dyn BillingStore,
    report_id: ReportId,
    now: DateTime<Utc>,
) -> BillingResult<Report> {
    match store.realize_report(report_id, now).await {
        Ok(report) => {
            info!(
                report_id = %report.id,
                contract_id = %report.contract_id,
                month = %report.month,
                balance_raw = report.figures.balance_raw,
                "Report realized"
            );
            Ok(report)
        }
        Err(error @ (BillingError::StaleAnchor { .. } | BillingError::StaleConditions { .. })) => {
            warn!(report_id = %report_id, error = %error, "Report must be regenerated before realization");
            Err(error)
        }
        Err(error) => Err(error),
    }
}

pub async fn update_report(
    store: &dyn BillingStore,
    report_id: ReportId,
    patch: ReportPatch,
    now: DateTime<Utc>,
) -> BillingResult<Report> {
    let current = store.get_report(report_id).await?;
    if let Err(error) = ensure_mutable(&current) {
        warn!(report_id = %report_id, "Rejected update of a realized report");
        return Err(error);
    }
    if patch.is_empty() {
        return Ok(current);
    }
    let figures = apply_patch(&current.figures, &patch)?;
    store.update_draft_figures(report_id, figures, now).await
}

pub async fn discard_draft(store: &dyn BillingStore, report_id: ReportId) -> BillingResult<Report> {
    let report = store.delete_draft_report(report_id).await?;
    info!(report_id = %report_id, contract_id = %report.contract_id, month = %report.month, "Draft report discarded");
    Ok(report)
}
