use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::{BillingError, BillingResult},
    models::{
        AttemptId, AttemptStatus, ConditionsId, ConditionsTerms, Contract, ContractId,
        DraftReport, MonthlyConditions, NewAttempt, NewContract, NewMonthlyConditions,
        NewProperty, NewReading, Property, PropertyId, PropertyUpdate, Reading, ReadingId, Report,
        ReportEmail, ReportEmailAttempt, ReportEmailId, ReportFigures, ReportId, ReportStatus,
    },
    repository::store::BillingStore,
    services::{
        delivery::{attempt_order, retry_decision, RetryDecision, RetryPolicy},
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

#[derive(Default)]
struct Arena {
    properties: HashMap<PropertyId, Property>,
    contracts: HashMap<ContractId, Contract>,
    readings: HashMap<ReadingId, Reading>,
    conditions: HashMap<ConditionsId, MonthlyConditions>,
    reports: HashMap<ReportId, Report>,
    report_emails: HashMap<ReportEmailId, ReportEmail>,
    attempts: Vec<ReportEmailAttempt>,
}

impl Arena {
    fn property(&self, id: PropertyId) -> BillingResult<&Property> {
        self.properties
            .get(&id)
            .ok_or_else(|| BillingError::not_found("property", id))
    }

    fn report(&self, id: ReportId) -> BillingResult<&Report> {
        self.reports
            .get(&id)
            .ok_or_else(|| BillingError::not_found("report", id))
    }

    fn readings_of(&self, property_id: PropertyId) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self
            .readings
            .values()
            .filter(|reading| reading.property_id == property_id)
            .cloned()
            .collect();
        readings.sort_by_key(|reading| (reading.reading_at, reading.created_at));
        readings
    }

    fn property_is_referenced(&self, property_id: PropertyId) -> bool {
        if self
            .readings
            .values()
            .any(|reading| reading.property_id == property_id)
        {
            return true;
        }
        self.reports.values().any(|report| {
            self.contracts
                .get(&report.contract_id)
                .is_some_and(|contract| contract.property_id == property_id)
        })
    }

    fn check_new_reading(&self, reading: &NewReading, ignore: Option<ReadingId>) -> BillingResult<()> {
        check_reading_month(self.property(reading.property_id)?, reading)?;
        let existing = self.readings_of(reading.property_id);
        if let Some(conflict) = find_conflicting_reading(&existing, reading, ignore) {
            return Err(conflicting_reading_error(conflict));
        }
        check_reading_sequence(&existing, reading, ignore)
    }
}

/// Process-local store used by tests and database-less runs. A single
/// `RwLock` serializes writers, so every conditional write is atomic.
#[derive(Default)]
pub struct MemoryStore {
    arena: RwLock<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn insert_property(
        &self,
        property: NewProperty,
        now: DateTime<Utc>,
    ) -> BillingResult<Property> {
        let mut arena = self.arena.write().await;
        let property = Property {
            id: PropertyId::generate(),
            label: property.label,
            start_month: property.start_month,
            created_at: now,
            updated_at: now,
        };
        arena.properties.insert(property.id, property.clone());
        Ok(property)
    }

    async fn get_property(&self, id: PropertyId) -> BillingResult<Property> {
        self.arena.read().await.property(id).cloned()
    }

    async fn update_property(
        &self,
        id: PropertyId,
        update: PropertyUpdate,
        now: DateTime<Utc>,
    ) -> BillingResult<Property> {
        let mut arena = self.arena.write().await;
        let current = arena.property(id)?;
        check_property_update(current, &update, arena.property_is_referenced(id))?;

        let property = arena
            .properties
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("property", id))?;
        if let Some(label) = update.label {
            property.label = label;
        }
        if let Some(start_month) = update.start_month {
            property.start_month = start_month;
        }
        property.updated_at = now;
        Ok(property.clone())
    }

    async fn insert_contract(
        &self,
        contract: NewContract,
        now: DateTime<Utc>,
    ) -> BillingResult<Contract> {
        let mut arena = self.arena.write().await;
        arena.property(contract.property_id)?;
        let existing: Vec<Contract> = arena.contracts.values().cloned().collect();
        if let Some(overlap) =
            find_overlapping_contract(&existing, contract.property_id, &contract.period)
        {
            return Err(overlapping_contract_error(overlap, &contract.period));
        }
        let contract = Contract {
            id: ContractId::generate(),
            property_id: contract.property_id,
            tenant_user_id: contract.tenant_user_id,
            period: contract.period,
            created_at: now,
            updated_at: now,
        };
        arena.contracts.insert(contract.id, contract.clone());
        Ok(contract)
    }

    async fn get_contract(&self, id: ContractId) -> BillingResult<Contract> {
        self.arena
            .read()
            .await
            .contracts
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("contract", id))
    }

    async fn list_contracts(&self, property_id: PropertyId) -> BillingResult<Vec<Contract>> {
        let arena = self.arena.read().await;
        let mut contracts: Vec<Contract> = arena
            .contracts
            .values()
            .filter(|contract| contract.property_id == property_id)
            .cloned()
            .collect();
        contracts.sort_by_key(|contract| contract.period.start);
        Ok(contracts)
    }

    async fn insert_reading(
        &self,
        reading: NewReading,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let mut arena = self.arena.write().await;
        arena.check_new_reading(&reading, None)?;
        let reading = reading.into_reading(ReadingId::generate(), now);
        arena.readings.insert(reading.id, reading.clone());
        Ok(reading)
    }

    async fn get_reading(&self, id: ReadingId) -> BillingResult<Reading> {
        self.arena
            .read()
            .await
            .readings
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("reading", id))
    }

    async fn list_readings(
        &self,
        property_id: PropertyId,
        include_deleted: bool,
    ) -> BillingResult<Vec<Reading>> {
        let arena = self.arena.read().await;
        let mut readings = arena.readings_of(property_id);
        if !include_deleted {
            readings.retain(|reading| !reading.is_deleted());
        }
        Ok(readings)
    }

    async fn soft_delete_reading(
        &self,
        id: ReadingId,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let mut arena = self.arena.write().await;
        let reading = arena
            .readings
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("reading", id))?;
        if reading.deleted_at.is_none() {
            reading.deleted_at = Some(now);
            reading.updated_at = now;
        }
        Ok(reading.clone())
    }

    async fn replace_reading(
        &self,
        original: ReadingId,
        replacement: NewReading,
        now: DateTime<Utc>,
    ) -> BillingResult<Reading> {
        let mut arena = self.arena.write().await;
        let current = arena
            .readings
            .get(&original)
            .ok_or_else(|| BillingError::not_found("reading", original))?;
        if current.is_deleted() {
            return Err(BillingError::Validation(format!(
                "Reading {original} is deleted and cannot be corrected."
            )));
        }
        if current.property_id != replacement.property_id {
            return Err(BillingError::Validation(format!(
                "A correction of reading {original} must stay on property {}.",
                current.property_id
            )));
        }
        arena.check_new_reading(&replacement, Some(original))?;

        if let Some(current) = arena.readings.get_mut(&original) {
            current.deleted_at = Some(now);
            current.updated_at = now;
        }
        let reading = replacement.into_reading(ReadingId::generate(), now);
        arena.readings.insert(reading.id, reading.clone());
        Ok(reading)
    }

    async fn insert_conditions(
        &self,
        conditions: NewMonthlyConditions,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions> {
        let mut arena = self.arena.write().await;
        arena.property(conditions.property_id)?;
        let duplicate = arena.conditions.values().any(|existing| {
            existing.property_id == conditions.property_id && existing.month == conditions.month
        });
        if duplicate {
            return Err(BillingError::Validation(format!(
                "Monthly conditions for property {} in {} already exist.",
                conditions.property_id, conditions.month
            )));
        }
        let terms = conditions.terms;
        let conditions = MonthlyConditions {
            id: ConditionsId::generate(),
            property_id: conditions.property_id,
            month: conditions.month,
            forecast_cold: terms.forecast_cold,
            forecast_hot: terms.forecast_hot,
            forecast_heating: terms.forecast_heating,
            price_cold: terms.price_cold,
            price_hot_heating: terms.price_hot_heating,
            price_heating: terms.price_heating,
            advance_payment: terms.advance_payment,
            manager_fee: terms.manager_fee,
            created_at: now,
            updated_at: now,
        };
        arena.conditions.insert(conditions.id, conditions.clone());
        Ok(conditions)
    }

    async fn get_conditions(&self, id: ConditionsId) -> BillingResult<MonthlyConditions> {
        self.arena
            .read()
            .await
            .conditions
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("monthly_conditions", id))
    }

    async fn find_conditions(
        &self,
        property_id: PropertyId,
        month: Month,
    ) -> BillingResult<Option<MonthlyConditions>> {
        let arena = self.arena.read().await;
        Ok(arena
            .conditions
            .values()
            .find(|conditions| conditions.property_id == property_id && conditions.month == month)
            .cloned())
    }

    async fn update_conditions(
        &self,
        id: ConditionsId,
        terms: ConditionsTerms,
        now: DateTime<Utc>,
    ) -> BillingResult<MonthlyConditions> {
        let mut arena = self.arena.write().await;
        if let Some(report) = arena.reports.values().find(|report| {
            report.monthly_conditions_id == id && report.status == ReportStatus::Realized
        }) {
            return Err(BillingError::Validation(format!(
                "Monthly conditions {id} back realized report {} and cannot change.",
                report.id
            )));
        }
        let conditions = arena
            .conditions
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("monthly_conditions", id))?;
        conditions.apply_terms(terms);
        conditions.updated_at = now;
        Ok(conditions.clone())
    }

    async fn save_draft_report(
        &self,
        draft: DraftReport,
        now: DateTime<Utc>,
    ) -> BillingResult<Report> {
        let mut arena = self.arena.write().await;
        if !arena.contracts.contains_key(&draft.contract_id) {
            return Err(BillingError::not_found("contract", draft.contract_id));
        }
        let conditions = arena
            .conditions
            .get(&draft.monthly_conditions_id)
            .ok_or_else(|| {
                BillingError::not_found("monthly_conditions", draft.monthly_conditions_id)
            })?;
        if conditions.updated_at != draft.conditions_updated_at {
            return Err(BillingError::StaleConditions {
                conditions_id: conditions.id,
            });
        }
        for reading_id in [draft.anchor_reading_id, draft.anchor_reading_next_id] {
            if !arena.readings.contains_key(&reading_id) {
                return Err(BillingError::not_found("reading", reading_id));
            }
        }

        let existing = arena.reports.values_mut().find(|report| {
            report.contract_id == draft.contract_id
                && report.month == draft.month
                && report.status == ReportStatus::Draft
        });
        if let Some(report) = existing {
            report.anchor_reading_id = draft.anchor_reading_id;
            report.anchor_reading_next_id = draft.anchor_reading_next_id;
            report.monthly_conditions_id = draft.monthly_conditions_id;
            report.figures = draft.figures;
            report.updated_at = now;
            return Ok(report.clone());
        }

        let report = Report {
            id: ReportId::generate(),
            contract_id: draft.contract_id,
            month: draft.month,
            anchor_reading_id: draft.anchor_reading_id,
            anchor_reading_next_id: draft.anchor_reading_next_id,
            monthly_conditions_id: draft.monthly_conditions_id,
            figures: draft.figures,
            status: ReportStatus::Draft,
            realized_at: None,
            created_at: now,
            updated_at: now,
        };
        arena.reports.insert(report.id, report.clone());
        Ok(report)
    }

    async fn get_report(&self, id: ReportId) -> BillingResult<Report> {
        self.arena.read().await.report(id).cloned()
    }

    async fn list_reports(&self, contract_id: ContractId) -> BillingResult<Vec<Report>> {
        let arena = self.arena.read().await;
        let mut reports: Vec<Report> = arena
            .reports
            .values()
            .filter(|report| report.contract_id == contract_id)
            .cloned()
            .collect();
        reports.sort_by_key(|report| (report.month, report.created_at));
        Ok(reports)
    }

    async fn realize_report(&self, id: ReportId, now: DateTime<Utc>) -> BillingResult<Report> {
        let mut arena = self.arena.write().await;
        let Arena {
            reports,
            readings,
            conditions,
            ..
        } = &mut *arena;
        let readings: &HashMap<ReadingId, Reading> = readings;
        let report = reports
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("report", id))?;
        ensure_draft(report)?;
        check_anchors_live(report, |reading_id| readings.get(reading_id))?;
        let backing = conditions.get(&report.monthly_conditions_id).ok_or_else(|| {
            BillingError::not_found("monthly_conditions", report.monthly_conditions_id)
        })?;
        check_conditions_current(report, backing)?;

        report.status = ReportStatus::Realized;
        report.realized_at = Some(now);
        report.updated_at = now;
        Ok(report.clone())
    }

    async fn update_draft_figures(
        &self,
        id: ReportId,
        figures: ReportFigures,
        now: DateTime<Utc>,
    ) -> BillingResult<Report> {
        let mut arena = self.arena.write().await;
        let Arena {
            reports,
            conditions,
            ..
        } = &mut *arena;
        let report = reports
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("report", id))?;
        ensure_mutable(report)?;
        let backing = conditions.get(&report.monthly_conditions_id).ok_or_else(|| {
            BillingError::not_found("monthly_conditions", report.monthly_conditions_id)
        })?;
        check_conditions_current(report, backing)?;
        report.figures = figures;
        report.updated_at = now;
        Ok(report.clone())
    }

    async fn delete_draft_report(&self, id: ReportId) -> BillingResult<Report> {
        let mut arena = self.arena.write().await;
        ensure_mutable(arena.report(id)?)?;
        let report = arena
            .reports
            .remove(&id)
            .ok_or_else(|| BillingError::not_found("report", id))?;

        let removed: Vec<ReportEmailId> = arena
            .report_emails
            .values()
            .filter(|email| email.report_id == id)
            .map(|email| email.id)
            .collect();
        for email_id in &removed {
            arena.report_emails.remove(email_id);
        }
        arena
            .attempts
            .retain(|attempt| !removed.contains(&attempt.report_email_id));
        Ok(report)
    }

    async fn upsert_report_email(
        &self,
        report_id: ReportId,
        email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<(ReportEmail, bool)> {
        let mut arena = self.arena.write().await;
        arena.report(report_id)?;
        if let Some(existing) = arena
            .report_emails
            .values()
            .find(|existing| existing.report_id == report_id && existing.recipient_email == email)
        {
            return Ok((existing.clone(), false));
        }
        let recipient = ReportEmail {
            id: ReportEmailId::generate(),
            report_id,
            recipient_email: email.to_string(),
            last_sent_at: None,
            created_at: now,
        };
        arena.report_emails.insert(recipient.id, recipient.clone());
        Ok((recipient, true))
    }

    async fn get_report_email(&self, id: ReportEmailId) -> BillingResult<ReportEmail> {
        self.arena
            .read()
            .await
            .report_emails
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("report_email", id))
    }

    async fn list_report_emails(&self, report_id: ReportId) -> BillingResult<Vec<ReportEmail>> {
        let arena = self.arena.read().await;
        let mut emails: Vec<ReportEmail> = arena
            .report_emails
            .values()
            .filter(|email| email.report_id == report_id)
            .cloned()
            .collect();
        emails.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.recipient_email.cmp(&b.recipient_email))
        });
        Ok(emails)
    }

    async fn append_attempt(&self, attempt: NewAttempt) -> BillingResult<ReportEmailAttempt> {
        let mut arena = self.arena.write().await;
        let recipient = arena
            .report_emails
            .get_mut(&attempt.report_email_id)
            .ok_or_else(|| BillingError::not_found("report_email", attempt.report_email_id))?;
        if attempt.status == AttemptStatus::Success {
            recipient.last_sent_at = Some(attempt.attempted_at);
        }
        let attempt = ReportEmailAttempt {
            id: AttemptId::generate(),
            report_email_id: attempt.report_email_id,
            attempted_at: attempt.attempted_at,
            status: attempt.status,
            error_message: attempt.error_message,
        };
        arena.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn list_attempts(
        &self,
        report_email_id: ReportEmailId,
    ) -> BillingResult<Vec<ReportEmailAttempt>> {
        let arena = self.arena.read().await;
        if !arena.report_emails.contains_key(&report_email_id) {
            return Err(BillingError::not_found("report_email", report_email_id));
        }
        let mut attempts: Vec<ReportEmailAttempt> = arena
            .attempts
            .iter()
            .filter(|attempt| attempt.report_email_id == report_email_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for attempts sharing a sort key.
        attempts.sort_by_key(attempt_order);
        Ok(attempts)
    }

    async fn list_undelivered_emails(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BillingResult<Vec<ReportEmail>> {
        let arena = self.arena.read().await;
        let mut attempts: HashMap<ReportEmailId, Vec<ReportEmailAttempt>> = HashMap::new();
        for attempt in &arena.attempts {
            attempts
                .entry(attempt.report_email_id)
                .or_default()
                .push(attempt.clone());
        }
        let mut pending: Vec<ReportEmail> = arena
            .report_emails
            .values()
            .filter(|email| {
                email.last_sent_at.is_none()
                    && arena
                        .reports
                        .get(&email.report_id)
                        .is_some_and(|report| report.status == ReportStatus::Realized)
            })
            .filter(|email| {
                let log = attempts.get(&email.id).map(Vec::as_slice).unwrap_or_default();
                !matches!(
                    retry_decision(log, policy, now),
                    RetryDecision::Exhausted { .. }
                )
            })
            .cloned()
            .collect();
        pending.sort_by_key(|email| email.created_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::models::ReadingType;
    use crate::services::test_support::{reading_input, seed_billing_month, seeded_at};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 5, hour, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            min_backoff: std::time::Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn saving_a_draft_twice_replaces_it_in_place() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;

        let first = store.save_draft_report(seeded.draft(), at(8)).await.unwrap();
        let mut changed = seeded.draft();
        changed.figures.fixed_cost_raw += 1;
        let second = store.save_draft_report(changed, at(9)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.created_at, at(8));
        assert_eq!(second.updated_at, at(9));
        assert_eq!(store.list_reports(seeded.contract.id).await.unwrap().len(), 1);

        store.realize_report(first.id, at(10)).await.unwrap();
        let fresh = store.save_draft_report(seeded.draft(), at(11)).await.unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(store.list_reports(seeded.contract.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn soft_delete_keeps_the_first_deletion_time() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;

        let first = store.soft_delete_reading(seeded.start.id, at(8)).await.unwrap();
        let second = store.soft_delete_reading(seeded.start.id, at(9)).await.unwrap();
        assert_eq!(first.deleted_at, Some(at(8)));
        assert_eq!(second.deleted_at, Some(at(8)));

        let live = store.list_readings(seeded.property.id, false).await.unwrap();
        assert!(live.iter().all(|reading| reading.id != seeded.start.id));
        let all = store.list_readings(seeded.property.id, true).await.unwrap();
        assert!(all.iter().any(|reading| reading.id == seeded.start.id));
    }

    #[tokio::test]
    async fn conditions_freeze_once_a_report_is_realized() {
        let store = MemoryStore::new();
        let mut seeded = seed_billing_month(&store).await;
        let terms = seeded.conditions.terms();

        seeded.conditions = store
            .update_conditions(seeded.conditions.id, terms, at(8))
            .await
            .expect("editable while only drafts exist");

        let report = store.save_draft_report(seeded.draft(), at(8)).await.unwrap();
        store.realize_report(report.id, at(9)).await.unwrap();

        let error = store
            .update_conditions(seeded.conditions.id, terms, at(10))
            .await
            .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn successful_attempts_stamp_last_sent_at() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;
        let report = store.save_draft_report(seeded.draft(), at(8)).await.unwrap();
        let (recipient, created) = store
            .upsert_report_email(report.id, "tenant@example.com", at(8))
            .await
            .unwrap();
        assert!(created);
        let (again, created) = store
            .upsert_report_email(report.id, "tenant@example.com", at(9))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, recipient.id);

        assert!(store.list_undelivered_emails(&policy(), at(12), 10).await.unwrap().is_empty());
        store.realize_report(report.id, at(9)).await.unwrap();
        assert_eq!(store.list_undelivered_emails(&policy(), at(12), 10).await.unwrap().len(), 1);

        store
            .append_attempt(NewAttempt {
                report_email_id: recipient.id,
                attempted_at: at(10),
                status: AttemptStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();
        let stored = store.get_report_email(recipient.id).await.unwrap();
        assert_eq!(stored.last_sent_at, Some(at(10)));
        assert!(store.list_undelivered_emails(&policy(), at(12), 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_readings_cannot_both_break_meter_order() {
        let store = Arc::new(MemoryStore::new());
        let seeded = seed_billing_month(store.as_ref()).await;
        let first_of_march =
            reading_input(&seeded.property, ReadingType::Periodic, seeded_at(3, 1), None, 200);
        let second_of_march =
            reading_input(&seeded.property, ReadingType::Periodic, seeded_at(3, 2), None, 150);

        let (a, b) = tokio::join!(
            tokio::spawn({
                let store = Arc::clone(&store);
                async move { store.insert_reading(first_of_march, seeded_at(3, 2)).await }
            }),
            tokio::spawn({
                let store = Arc::clone(&store);
                async move { store.insert_reading(second_of_march, seeded_at(3, 2)).await }
            }),
        );
        let outcomes = [a.expect("task completed"), b.expect("task completed")];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(BillingError::Validation(_)))));
        assert_eq!(store.list_readings(seeded.property.id, false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn direct_writes_check_month_and_meter_order() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;

        let before_start = reading_input(
            &seeded.property,
            ReadingType::Periodic,
            seeded_at(3, 1),
            Some("2023-12".parse().unwrap()),
            200,
        );
        assert!(matches!(
            store.insert_reading(before_start, seeded_at(3, 1)).await,
            Err(BillingError::Validation(_))
        ));

        let overshoot =
            reading_input(&seeded.property, ReadingType::Initial, seeded_at(1, 1), None, 120);
        let error = store
            .replace_reading(seeded.start.id, overshoot, seeded_at(3, 1))
            .await
            .unwrap_err();
        assert!(matches!(error, BillingError::Validation(_)));
        let start = store.get_reading(seeded.start.id).await.unwrap();
        assert!(!start.is_deleted());
    }

    #[tokio::test]
    async fn exhausted_recipients_leave_the_undelivered_scan() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;
        let report = store.save_draft_report(seeded.draft(), at(8)).await.unwrap();
        store.realize_report(report.id, at(8)).await.unwrap();

        for index in 0..3 {
            let (stuck, _) = store
                .upsert_report_email(report.id, &format!("stuck{index}@example.com"), at(8))
                .await
                .unwrap();
            store
                .append_attempt(NewAttempt {
                    report_email_id: stuck.id,
                    attempted_at: at(9),
                    status: AttemptStatus::Failure,
                    error_message: Some("bounced".to_string()),
                })
                .await
                .unwrap();
        }
        let (fresh, _) = store
            .upsert_report_email(report.id, "fresh@example.com", at(10))
            .await
            .unwrap();

        let window = store.list_undelivered_emails(&policy(), at(12), 1).await.unwrap();
        assert_eq!(
            window.iter().map(|email| email.id).collect::<Vec<_>>(),
            vec![fresh.id]
        );
    }
}
