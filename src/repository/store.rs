use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::BillingResult,
    models::{
        ConditionsId, ConditionsTerms, Contract, ContractId, DraftReport, MonthlyConditions,
        NewAttempt, NewContract, NewMonthlyConditions, NewProperty, NewReading, Property,
        PropertyId, PropertyUpdate, Reading, ReadingId, Report, ReportEmail, ReportEmailAttempt,
        ReportEmailId, ReportFigures, ReportId,
    },
    services::delivery::RetryPolicy,
    units::Month,
};

/// Persistence for the billing core.
///
/// Implementations own atomicity: every method either commits fully or leaves
/// the store untouched, and methods documented as conditional must evaluate
/// their condition and write under the same lock or transaction.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn insert_property(
        &self,
        property: NewProperty,
        now: DateTime<Utc>,
    ) -> BillingResult<Property>;

    async fn get_property(&self, id: PropertyId) -> BillingResult<Property>;

    /// Rejects a `start_month` change once readings or reports reference the property.
    async fn update_property(
        &self,
        id: PropertyId,
        update: PropertyUpdate,
        now: DateTime<Utc>,
    ) -> BillingResult<Property>;

    /// Rejects periods overlapping another contract of the same property.
    async fn insert_contract(
        &self,
        contract: NewContract,
        now: DateTime<Utc>,
    ) -> BillingResult<Contract>;

    async fn get_contract(&self, id: ContractId) -> BillingResult<Contract>;

    async fn list_contracts(&self, property_id: PropertyId) -> BillingResult<Vec<Contract>>;

    /// Rejects a second live reading for the same property, effective month and
    /// type, and any value that would make a meter run backwards against the
    /// live readings around it. Both checks hold the property for the write.
    async fn insert_reading(&self, reading: NewReading, now: DateTime<Utc>)
        -> BillingResult<Reading>;

    async fn get_reading(&self, id: ReadingId) -> BillingResult<Reading>;

    /// Readings of a property ordered by `reading_at`.
    async fn list_readings(
        &self,
        property_id: PropertyId,
        include_deleted: bool,
    ) -> BillingResult<Vec<Reading>>;

    /// Idempotent: a deleted reading keeps its original `deleted_at`.
    async fn soft_delete_reading(&self, id: ReadingId, now: DateTime<Utc>)
        -> BillingResult<Reading>;

    /// Soft-deletes `original` and inserts `replacement` atomically, with the
    /// same checks as `insert_reading` applied as if `original` were gone.
    async fn replace_reading(
        &self,
        original: ReadingId,
        replacement: NewReading,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading>;

    /// Rejects a second row for the same property and month.
    async fn insert_conditions(
        &self,
        conditions: NewMonthlyConditions,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions>;

    async fn get_conditions(&self, id: ConditionsId) -> BillingResult<MonthlyConditions>;

    async fn find_conditions(
        &self,
        property_id: PropertyId,
        month: Month,
    ) -> BillingResult<Option<MonthlyConditions>>;

    /// Rejects changes to conditions already backing a realized report.
    async fn update_conditions(
        &self,
        id: ConditionsId,
        terms: ConditionsTerms,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions>;

    /// Replaces the draft of `(contract_id, month)` in place, or inserts a new
    /// draft when none exists.
    async fn save_draft_report(
        &self,
        draft: DraftReport,
        now: DateTime<Utc>,
    ) -> BillingResult<Report>;

    async fn get_report(&self, id: ReportId) -> BillingResult<Report>;

    async fn list_reports(&self, contract_id: ContractId) -> BillingResult<Vec<Report>>;

    /// Compare-and-swap `draft -> realized` after re-checking both anchors.
    async fn realize_report(&self, id: ReportId, now: DateTime<Utc>) -> BillingResult<Report>;

    /// Overwrites the figures of a draft; realized reports are left untouched.
    async fn update_draft_figures(
        &self,
        id: ReportId,
        figures: ReportFigures,
        now: DateTime<Utc>,
    ) -> BillingResult<Report>;

    async fn delete_draft_report(&self, id: ReportId) -> BillingResult<Report>;

    /// Returns the recipient row and whether it was created by this call.
    /// `email` must already be normalized.
    async fn upsert_report_email(
        &self,
        report_id: ReportId,
        email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<(ReportEmail, bool)>;

    async fn get_report_email(&self, id: ReportEmailId) -> BillingResult<ReportEmail>;

    async fn list_report_emails(&self, report_id: ReportId) -> BillingResult<Vec<ReportEmail>>;

    /// Appends an attempt; a successful one also stamps `last_sent_at`.
    async fn append_attempt(&self, attempt: NewAttempt) -> BillingResult<ReportEmailAttempt>;

    /// Attempts of one recipient in `attempt_order`.
    async fn list_attempts(
        &self,
        report_email_id: ReportEmailId,
    ) -> BillingResult<Vec<ReportEmailAttempt>>;

    /// Recipients of realized reports that never received a successful send
    /// and have not exhausted `policy` at `now`, oldest first.
    async fn list_undelivered_emails(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BillingResult<Vec<ReportEmail>>;
}
