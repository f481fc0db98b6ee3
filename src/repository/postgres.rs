use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    error::{BillingError, BillingResult},
    models::{
        AttemptStatus, ConditionsId, ConditionsTerms, Contract, ContractId, DraftReport,
        MonthlyConditions, NewAttempt, NewContract, NewMonthlyConditions, NewProperty, NewReading,
        Property, PropertyId, PropertyUpdate, Reading, ReadingId, Report, ReportEmail,
        ReportEmailAttempt, ReportEmailId, ReportFigures, ReportId, ReportStatus,
    },
    repository::store::BillingStore,
    services::{
        delivery::RetryPolicy,
        registry::{
            check_property_update, check_reading_month, check_reading_sequence,
            conflicting_reading_error, find_conflicting_reading, find_overlapping_contract,
            overlapping_contract_error,
        },
        report_lifecycle::{
            check_anchors_live, check_conditions_current, ensure_draft, ensure_mutable,
        },
    },
    units::Month,
};

const READING_COLUMNS: &str = "property_id, reading_type, reading_at, effective_month, \
    cold_m3, hot_m3, heating_gj, cold_replaced, hot_replaced, heating_replaced, origin, \
    comment_text, comment_visible_to_tenant, created_at, updated_at";

const READING_VALUES: &str = "$1, $2, $3, $4, $5::numeric, $6::numeric, $7::numeric, \
    $8, $9, $10, $11, $12, $13, $14, $14";

/// Postgres-backed store. Conditional writes run inside one transaction with
/// the rows they depend on locked.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> BillingResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(map_db_error)
    }
}

fn decode_row<T: DeserializeOwned>(row: PgRow) -> BillingResult<T> {
    let value: Value = row.try_get("row").map_err(map_db_error)?;
    serde_json::from_value(value)
        .map_err(|error| BillingError::Store(format!("Could not decode stored row: {error}")))
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<PgRow>) -> BillingResult<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

fn decode_optional<T: DeserializeOwned>(row: Option<PgRow>) -> BillingResult<Option<T>> {
    row.map(decode_row).transpose()
}

fn map_db_error(error: sqlx::Error) -> BillingError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    let code = error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .map(|code| code.into_owned());
    match code.as_deref() {
        Some("23505") => {
            BillingError::Validation("Duplicate value violates a unique constraint.".to_string())
        }
        Some("23P01") => {
            BillingError::Validation("Value conflicts with an existing record.".to_string())
        }
        Some("23503") => {
            BillingError::Validation("Referenced record does not exist.".to_string())
        }
        Some("23514") => BillingError::Validation("Value violates a check constraint.".to_string()),
        _ => BillingError::Store("Database operation failed.".to_string()),
    }
}

fn bind_reading<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    reading: &'q NewReading,
    now: DateTime<Utc>,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(reading.property_id.0)
        .bind(reading.reading_type.as_str())
        .bind(reading.reading_at)
        .bind(reading.effective_month.map(Month::first_day))
        .bind(reading.cold_m3.to_string())
        .bind(reading.hot_m3.to_string())
        .bind(reading.heating_gj.to_string())
        .bind(reading.cold_replaced)
        .bind(reading.hot_replaced)
        .bind(reading.heating_replaced)
        .bind(reading.origin.as_str())
        .bind(reading.comment_text.as_deref())
        .bind(reading.comment_visible_to_tenant)
        .bind(now)
}

async fn lock_property(
    tx: &mut Transaction<'static, Postgres>,
    id: PropertyId,
    mode: &str,
) -> BillingResult<Property> {
    let sql = format!("SELECT row_to_json(t) AS row FROM properties t WHERE t.id = $1 {mode}");
    let row = sqlx::query(&sql)
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
    decode_optional(row)?.ok_or_else(|| BillingError::not_found("property", id))
}

/// Checks `reading` against the live readings of its property. The caller
/// holds the property row `FOR UPDATE`.
async fn check_reading_fits(
    tx: &mut Transaction<'static, Postgres>,
    property: &Property,
    reading: &NewReading,
    ignore: Option<ReadingId>,
) -> BillingResult<()> {
    check_reading_month(property, reading)?;
    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row FROM readings t
         WHERE t.property_id = $1 AND t.deleted_at IS NULL",
    )
    .bind(property.id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(map_db_error)?;
    let existing: Vec<Reading> = decode_rows(rows)?;
    if let Some(conflict) = find_conflicting_reading(&existing, reading, ignore) {
        return Err(conflicting_reading_error(conflict));
    }
    check_reading_sequence(&existing, reading, ignore)
}

async fn lock_conditions(
    tx: &mut Transaction<'static, Postgres>,
    id: ConditionsId,
    mode: &str,
) -> BillingResult<MonthlyConditions> {
    let sql =
        format!("SELECT row_to_json(t) AS row FROM monthly_conditions t WHERE t.id = $1 {mode}");
    let row = sqlx::query(&sql)
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
    decode_optional(row)?.ok_or_else(|| BillingError::not_found("monthly_conditions", id))
}

async fn lock_report(
    tx: &mut Transaction<'static, Postgres>,
    id: ReportId,
) -> BillingResult<Report> {
    let row = sqlx::query("SELECT row_to_json(t) AS row FROM reports t WHERE t.id = $1 FOR UPDATE")
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
    decode_optional(row)?.ok_or_else(|| BillingError::not_found("report", id))
}

async fn report_conflict(
    tx: &mut Transaction<'static, Postgres>,
    id: ReportId,
) -> BillingResult<BillingError> {
    let row = sqlx::query("SELECT row_to_json(t) AS row FROM reports t WHERE t.id = $1")
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
    let report: Option<Report> = decode_optional(row)?;
    Ok(match report {
        Some(report) => match ensure_mutable(&report) {
            Err(error) => error,
            Ok(()) => BillingError::Store(format!("Report {id} changed concurrently.")),
        },
        None => BillingError::not_found("report", id),
    })
}

#[async_trait]
impl BillingStore for PgStore {
    async fn insert_property(
        &self,
        property: NewProperty,
        now: DateTime<Utc>,
    ) -> BillingResult<Property> {
        let row = sqlx::query(
            "INSERT INTO properties (label, start_month, created_at, updated_at)
             VALUES ($1, $2, $3, $3)
             RETURNING row_to_json(properties.*) AS row",
        )
        .bind(&property.label)
        .bind(property.start_month.first_day())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_row(row)
    }

    async fn get_property(&self, id: PropertyId) -> BillingResult<Property> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM properties t WHERE t.id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("property", id))
    }

    async fn update_property(
        &self,
        id: PropertyId,
        update: PropertyUpdate,
        now: DateTime<Utc>,
    ) -> BillingResult<Property> {
        let mut tx = self.begin().await?;
        let current = lock_property(&mut tx, id, "FOR UPDATE").await?;
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM readings WHERE property_id = $1)
                 OR EXISTS (
                     SELECT 1 FROM reports r
                     JOIN contracts c ON c.id = r.contract_id
                     WHERE c.property_id = $1
                 )",
        )
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        check_property_update(&current, &update, referenced)?;

        let row = sqlx::query(
            "UPDATE properties
             SET label = COALESCE($2, label),
                 start_month = COALESCE($3, start_month),
                 updated_at = $4
             WHERE id = $1
             RETURNING row_to_json(properties.*) AS row",
        )
        .bind(id.0)
        .bind(update.label.as_deref())
        .bind(update.start_month.map(Month::first_day))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let property = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(property)
    }

    async fn insert_contract(
        &self,
        contract: NewContract,
        now: DateTime<Utc>,
    ) -> BillingResult<Contract> {
        let mut tx = self.begin().await?;
        lock_property(&mut tx, contract.property_id, "FOR UPDATE").await?;
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM contracts t WHERE t.property_id = $1",
        )
        .bind(contract.property_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let existing: Vec<Contract> = decode_rows(rows)?;
        if let Some(overlap) =
            find_overlapping_contract(&existing, contract.property_id, &contract.period)
        {
            return Err(overlapping_contract_error(overlap, &contract.period));
        }

        let row = sqlx::query(
            "INSERT INTO contracts (property_id, tenant_user_id, period, created_at, updated_at)
             VALUES ($1, $2, $3::daterange, $4, $4)
             RETURNING row_to_json(contracts.*) AS row",
        )
        .bind(contract.property_id.0)
        .bind(contract.tenant_user_id.0)
        .bind(contract.period.to_range_literal())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let contract = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(contract)
    }

    async fn get_contract(&self, id: ContractId) -> BillingResult<Contract> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM contracts t WHERE t.id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("contract", id))
    }

    async fn list_contracts(&self, property_id: PropertyId) -> BillingResult<Vec<Contract>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM contracts t
             WHERE t.property_id = $1
             ORDER BY lower(t.period) ASC",
        )
        .bind(property_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }

    async fn insert_reading(
        &self,
        reading: NewReading,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let mut tx = self.begin().await?;
        let property = lock_property(&mut tx, reading.property_id, "FOR UPDATE").await?;
        check_reading_fits(&mut tx, &property, &reading, None).await?;
        let sql = format!(
            "INSERT INTO readings ({READING_COLUMNS}) VALUES ({READING_VALUES})
             RETURNING row_to_json(readings.*) AS row"
        );
        let row = bind_reading(sqlx::query(&sql), &reading, now)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let reading = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(reading)
    }

    async fn get_reading(&self, id: ReadingId) -> BillingResult<Reading> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM readings t WHERE t.id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("reading", id))
    }

    async fn list_readings(
        &self,
        property_id: PropertyId,
        include_deleted: bool,
    ) -> BillingResult<Vec<Reading>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM readings t
             WHERE t.property_id = $1 AND ($2 OR t.deleted_at IS NULL)
             ORDER BY t.reading_at ASC, t.created_at ASC",
        )
        .bind(property_id.0)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }

    async fn soft_delete_reading(
        &self,
        id: ReadingId,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let row = sqlx::query(
            "UPDATE readings
             SET deleted_at = COALESCE(deleted_at, $2),
                 updated_at = CASE WHEN deleted_at IS NULL THEN $2 ELSE updated_at END
             WHERE id = $1
             RETURNING row_to_json(readings.*) AS row",
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("reading", id))
    }

    async fn replace_reading(
        &self,
        original: ReadingId,
        replacement: NewReading,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let mut tx = self.begin().await?;
        let property = lock_property(&mut tx, replacement.property_id, "FOR UPDATE").await?;
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row FROM readings t WHERE t.id = $1 FOR UPDATE",
        )
        .bind(original.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let current: Reading =
            decode_optional(row)?.ok_or_else(|| BillingError::not_found("reading", original))?;
        if current.is_deleted() {
            return Err(BillingError::Validation(format!(
                "Reading {original} is deleted and cannot be corrected."
            )));
        }
        if current.property_id != property.id {
            return Err(BillingError::Validation(format!(
                "A correction of reading {original} must stay on property {}.",
                current.property_id
            )));
        }
        check_reading_fits(&mut tx, &property, &replacement, Some(original)).await?;

        sqlx::query("UPDATE readings SET deleted_at = $2, updated_at = $2 WHERE id = $1")
            .bind(original.0)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let sql = format!(
            "INSERT INTO readings ({READING_COLUMNS}) VALUES ({READING_VALUES})
             RETURNING row_to_json(readings.*) AS row"
        );
        let row = bind_reading(sqlx::query(&sql), &replacement, now)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let reading = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(reading)
    }

    async fn insert_conditions(
        &self,
        conditions: NewMonthlyConditions,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions> {
        let terms = conditions.terms;
        let row = sqlx::query(
            "INSERT INTO monthly_conditions (
                 property_id, month, forecast_cold, forecast_hot, forecast_heating,
                 price_cold, price_hot_heating, price_heating, advance_payment, manager_fee,
                 created_at, updated_at
             )
             VALUES ($1, $2, $3::numeric, $4::numeric, $5::numeric, $6, $7, $8, $9, $10, $11, $11)
             RETURNING row_to_json(monthly_conditions.*) AS row",
        )
        .bind(conditions.property_id.0)
        .bind(conditions.month.first_day())
        .bind(terms.forecast_cold.to_string())
        .bind(terms.forecast_hot.to_string())
        .bind(terms.forecast_heating.to_string())
        .bind(terms.price_cold)
        .bind(terms.price_hot_heating)
        .bind(terms.price_heating)
        .bind(terms.advance_payment)
        .bind(terms.manager_fee)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| match map_db_error(error) {
            BillingError::Validation(_) => BillingError::Validation(format!(
                "Monthly conditions for property {} in {} already exist.",
                conditions.property_id, conditions.month
            )),
            other => other,
        })?;
        decode_row(row)
    }

    async fn get_conditions(&self, id: ConditionsId) -> BillingResult<MonthlyConditions> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row FROM monthly_conditions t WHERE t.id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("monthly_conditions", id))
    }

    async fn find_conditions(
        &self,
        property_id: PropertyId,
        month: Month,
    ) -> BillingResult<Option<MonthlyConditions>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row FROM monthly_conditions t
             WHERE t.property_id = $1 AND t.month = $2",
        )
        .bind(property_id.0)
        .bind(month.first_day())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn update_conditions(
        &self,
        id: ConditionsId,
        terms: ConditionsTerms,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions> {
        let mut tx = self.begin().await?;
        lock_conditions(&mut tx, id, "FOR UPDATE").await?;
        let realized: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM reports
             WHERE monthly_conditions_id = $1 AND status = 'realized'
             LIMIT 1",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;
        if let Some(report_id) = realized {
            return Err(BillingError::Validation(format!(
                "Monthly conditions {id} back realized report {report_id} and cannot change."
            )));
        }

        let row = sqlx::query(
            "UPDATE monthly_conditions
             SET forecast_cold = $2::numeric,
                 forecast_hot = $3::numeric,
                 forecast_heating = $4::numeric,
                 price_cold = $5,
                 price_hot_heating = $6,
                 price_heating = $7,
                 advance_payment = $8,
                 manager_fee = $9,
                 updated_at = $10
             WHERE id = $1
             RETURNING row_to_json(monthly_conditions.*) AS row",
        )
        .bind(id.0)
        .bind(terms.forecast_cold.to_string())
        .bind(terms.forecast_hot.to_string())
        .bind(terms.forecast_heating.to_string())
        .bind(terms.price_cold)
        .bind(terms.price_hot_heating)
        .bind(terms.price_heating)
        .bind(terms.advance_payment)
        .bind(terms.manager_fee)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let conditions = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(conditions)
    }

    async fn save_draft_report(
        &self,
        draft: DraftReport,
        now: DateTime<Utc>,
    ) -> BillingResult<Report> {
        let mut tx = self.begin().await?;
        let lock_key = format!("report:{}:{}", draft.contract_id, draft.month);
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&lock_key)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let conditions = lock_conditions(&mut tx, draft.monthly_conditions_id, "FOR SHARE").await?;
        if conditions.updated_at != draft.conditions_updated_at {
            return Err(BillingError::StaleConditions {
                conditions_id: conditions.id,
            });
        }

        let figures = draft.figures;
        let updated = sqlx::query(
            "UPDATE reports
             SET anchor_reading_id = $3,
                 anchor_reading_next_id = $4,
                 monthly_conditions_id = $5,
                 meter_cost_cold_raw = $6,
                 meter_cost_hot_raw = $7,
                 meter_cost_heating_raw = $8,
                 fixed_cost_raw = $9,
                 actual_rent_raw = $10,
                 balance_raw = $11,
                 updated_at = $12
             WHERE contract_id = $1 AND month = $2 AND status = 'draft'
             RETURNING row_to_json(reports.*) AS row",
        )
        .bind(draft.contract_id.0)
        .bind(draft.month.first_day())
        .bind(draft.anchor_reading_id.0)
        .bind(draft.anchor_reading_next_id.0)
        .bind(draft.monthly_conditions_id.0)
        .bind(figures.meter_cost_cold_raw)
        .bind(figures.meter_cost_hot_raw)
        .bind(figures.meter_cost_heating_raw)
        .bind(figures.fixed_cost_raw)
        .bind(figures.actual_rent_raw)
        .bind(figures.balance_raw)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let row = match updated {
            Some(row) => row,
            None => sqlx::query(
                "INSERT INTO reports (
                     contract_id, month, anchor_reading_id, anchor_reading_next_id,
                     monthly_conditions_id, meter_cost_cold_raw, meter_cost_hot_raw,
                     meter_cost_heating_raw, fixed_cost_raw, actual_rent_raw, balance_raw,
                     status, created_at, updated_at
                 )
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'draft', $12, $12)
                 RETURNING row_to_json(reports.*) AS row",
            )
            .bind(draft.contract_id.0)
            .bind(draft.month.first_day())
            .bind(draft.anchor_reading_id.0)
            .bind(draft.anchor_reading_next_id.0)
            .bind(draft.monthly_conditions_id.0)
            .bind(figures.meter_cost_cold_raw)
            .bind(figures.meter_cost_hot_raw)
            .bind(figures.meter_cost_heating_raw)
            .bind(figures.fixed_cost_raw)
            .bind(figures.actual_rent_raw)
            .bind(figures.balance_raw)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?,
        };
        let report = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(report)
    }

    async fn get_report(&self, id: ReportId) -> BillingResult<Report> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM reports t WHERE t.id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("report", id))
    }

    async fn list_reports(&self, contract_id: ContractId) -> BillingResult<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM reports t
             WHERE t.contract_id = $1
             ORDER BY t.month ASC, t.created_at ASC",
        )
        .bind(contract_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }

    async fn realize_report(&self, id: ReportId, now: DateTime<Utc>) -> BillingResult<Report> {
        let mut tx = self.begin().await?;
        let report = lock_report(&mut tx, id).await?;
        ensure_draft(&report)?;

        let anchor_ids: Vec<Uuid> = report.anchor_ids().iter().map(|reading| reading.0).collect();
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM readings t WHERE t.id = ANY($1) FOR SHARE",
        )
        .bind(anchor_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let anchors: HashMap<ReadingId, Reading> = decode_rows::<Reading>(rows)?
            .into_iter()
            .map(|reading| (reading.id, reading))
            .collect();
        check_anchors_live(&report, |reading_id| anchors.get(reading_id))?;

        let conditions = lock_conditions(&mut tx, report.monthly_conditions_id, "FOR SHARE").await?;
        check_conditions_current(&report, &conditions)?;

        let row = sqlx::query(
            "UPDATE reports
             SET status = $2, realized_at = $3, updated_at = $3
             WHERE id = $1 AND status = 'draft'
             RETURNING row_to_json(reports.*) AS row",
        )
        .bind(id.0)
        .bind(ReportStatus::Realized.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let realized: Report = decode_optional(row)?
            .ok_or(BillingError::AlreadyRealized { report_id: id })?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(realized)
    }

    async fn update_draft_figures(
        &self,
        id: ReportId,
        figures: ReportFigures,
        now: DateTime<Utc>,
    ) -> BillingResult<Report> {
        let mut tx = self.begin().await?;
        let report = lock_report(&mut tx, id).await?;
        ensure_mutable(&report)?;
        let conditions = lock_conditions(&mut tx, report.monthly_conditions_id, "FOR SHARE").await?;
        check_conditions_current(&report, &conditions)?;

        let row = sqlx::query(
            "UPDATE reports
             SET meter_cost_cold_raw = $2,
                 meter_cost_hot_raw = $3,
                 meter_cost_heating_raw = $4,
                 fixed_cost_raw = $5,
                 actual_rent_raw = $6,
                 balance_raw = $7,
                 updated_at = $8
             WHERE id = $1 AND status = 'draft'
             RETURNING row_to_json(reports.*) AS row",
        )
        .bind(id.0)
        .bind(figures.meter_cost_cold_raw)
        .bind(figures.meter_cost_hot_raw)
        .bind(figures.meter_cost_heating_raw)
        .bind(figures.fixed_cost_raw)
        .bind(figures.actual_rent_raw)
        .bind(figures.balance_raw)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let report = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(report)
    }

    async fn delete_draft_report(&self, id: ReportId) -> BillingResult<Report> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "DELETE FROM reports WHERE id = $1 AND status = 'draft'
             RETURNING row_to_json(reports.*) AS row",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let Some(row) = row else {
            return Err(report_conflict(&mut tx, id).await?);
        };
        let report = decode_row(row)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(report)
    }

    async fn upsert_report_email(
        &self,
        report_id: ReportId,
        email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<(ReportEmail, bool)> {
        self.get_report(report_id).await?;
        let inserted = sqlx::query(
            "INSERT INTO report_emails (report_id, recipient_email, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (report_id, recipient_email) DO NOTHING
             RETURNING row_to_json(report_emails.*) AS row",
        )
        .bind(report_id.0)
        .bind(email)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        if let Some(row) = inserted {
            return Ok((decode_row(row)?, true));
        }

        let row = sqlx::query(
            "SELECT row_to_json(t) AS row FROM report_emails t
             WHERE t.report_id = $1 AND t.recipient_email = $2",
        )
        .bind(report_id.0)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok((decode_row(row)?, false))
    }

    async fn get_report_email(&self, id: ReportEmailId) -> BillingResult<ReportEmail> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM report_emails t WHERE t.id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)?.ok_or_else(|| BillingError::not_found("report_email", id))
    }

    async fn list_report_emails(&self, report_id: ReportId) -> BillingResult<Vec<ReportEmail>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM report_emails t
             WHERE t.report_id = $1
             ORDER BY t.created_at ASC, t.recipient_email ASC",
        )
        .bind(report_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }

    async fn append_attempt(&self, attempt: NewAttempt) -> BillingResult<ReportEmailAttempt> {
        let mut tx = self.begin().await?;
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM report_emails WHERE id = $1 FOR UPDATE")
                .bind(attempt.report_email_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?;
        if locked.is_none() {
            return Err(BillingError::not_found("report_email", attempt.report_email_id));
        }

        let row = sqlx::query(
            "INSERT INTO report_email_attempts (report_email_id, attempted_at, status, error_message)
             VALUES ($1, $2, $3, $4)
             RETURNING row_to_json(report_email_attempts.*) AS row",
        )
        .bind(attempt.report_email_id.0)
        .bind(attempt.attempted_at)
        .bind(attempt.status.as_str())
        .bind(attempt.error_message.as_deref())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let stored = decode_row(row)?;

        if attempt.status == AttemptStatus::Success {
            sqlx::query("UPDATE report_emails SET last_sent_at = $2 WHERE id = $1")
                .bind(attempt.report_email_id.0)
                .bind(attempt.attempted_at)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }
        tx.commit().await.map_err(map_db_error)?;
        Ok(stored)
    }

    async fn list_attempts(
        &self,
        report_email_id: ReportEmailId,
    ) -> BillingResult<Vec<ReportEmailAttempt>> {
        self.get_report_email(report_email_id).await?;
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row FROM report_email_attempts t
             WHERE t.report_email_id = $1
             ORDER BY t.attempted_at ASC, (t.status <> 'pending') ASC, t.id ASC",
        )
        .bind(report_email_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }

    async fn list_undelivered_emails(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BillingResult<Vec<ReportEmail>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pending_cutoff = now
            .checked_sub_signed(policy.backoff(1))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        // Mirrors `retry_decision`: failures since the last success plus
        // abandoned pending attempts newer than every outcome.
        let rows = sqlx::query(
            "SELECT row_to_json(e) AS row
             FROM report_emails e
             JOIN reports r ON r.id = e.report_id
             CROSS JOIN LATERAL (
                 SELECT
                     max(a.attempted_at) FILTER (WHERE a.status = 'success') AS last_success,
                     max(a.attempted_at) FILTER (WHERE a.status <> 'pending') AS last_outcome
                 FROM report_email_attempts a
                 WHERE a.report_email_id = e.id
             ) o
             WHERE r.status = 'realized'
               AND e.last_sent_at IS NULL
               AND (
                   SELECT count(*)
                   FROM report_email_attempts a
                   WHERE a.report_email_id = e.id
                     AND (
                         (a.status = 'failure'
                             AND a.attempted_at > COALESCE(o.last_success, '-infinity'::timestamptz))
                         OR (a.status = 'pending'
                             AND a.attempted_at <= $3
                             AND a.attempted_at > COALESCE(o.last_outcome, '-infinity'::timestamptz))
                     )
               ) < $2
             ORDER BY e.created_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .bind(i64::from(policy.max_attempts))
        .bind(pending_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::models::{Contract, MonthlyConditions, Reading};
    use crate::units::MeterValue;

    #[test]
    fn decodes_row_to_json_output() {
        let contract: Contract = serde_json::from_value(json!({
            "id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d001",
            "property_id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d002",
            "tenant_user_id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d003",
            "period": "[2024-01-01,)",
            "created_at": "2024-01-01T08:00:00+00:00",
            "updated_at": "2024-01-01T08:00:00+00:00"
        }))
        .expect("contract row");
        assert_eq!(contract.period.end, None);

        let reading: Reading = serde_json::from_value(json!({
            "id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d004",
            "property_id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d002",
            "reading_type": "periodic",
            "reading_at": "2024-02-01T08:00:00+00:00",
            "effective_month": null,
            "cold_m3": 115.250,
            "hot_m3": 10,
            "heating_gj": 1.005,
            "cold_replaced": false,
            "hot_replaced": false,
            "heating_replaced": true,
            "origin": "import",
            "comment_text": null,
            "comment_visible_to_tenant": false,
            "deleted_at": null,
            "created_at": "2024-02-01T08:00:00+00:00",
            "updated_at": "2024-02-01T08:00:00+00:00"
        }))
        .expect("reading row");
        assert_eq!(reading.cold_m3, MeterValue::from_thousandths(115_250));
        assert_eq!(reading.heating_gj, MeterValue::from_thousandths(1_005));

        let conditions: MonthlyConditions = serde_json::from_value(json!({
            "id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d005",
            "property_id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d002",
            "month": "2024-01-01",
            "forecast_cold": 12.000,
            "forecast_hot": 4,
            "forecast_heating": 1.5,
            "price_cold": 50,
            "price_hot_heating": 120,
            "price_heating": 400,
            "advance_payment": 2000,
            "manager_fee": 300,
            "created_at": "2024-01-01T08:00:00+00:00",
            "updated_at": "2024-01-01T08:00:00+00:00"
        }))
        .expect("conditions row");
        assert_eq!(conditions.month.to_string(), "2024-01");
        assert_eq!(conditions.forecast_heating, MeterValue::from_thousandths(1_500));
    }
}
