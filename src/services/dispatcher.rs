use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::BillingResult,
    models::{AttemptStatus, ReportEmail},
    repository::store::BillingStore,
    services::{
        delivery::{record_attempt, retry_decision, RetryDecision, RetryPolicy},
        mailer::{render_report_email, ReportMailer},
    },
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub picked: u32,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
}

enum DispatchOutcome {
    Sent,
    Failed,
    /// Not due yet, or already delivered when no decision is attached.
    Skipped(Option<RetryDecision>),
}

/// Upper bound on undelivered recipients examined per run.
const UNDELIVERED_SCAN_LIMIT: usize = 10_000;

/// Sends realized reports to recipients that have not received them yet.
/// Recipients outside their retry window are left for a later run and do not
/// count against `batch_size`, which caps send attempts per run. Exhausted
/// recipients are not scanned at all.
///
/// Each send is reserved with a `pending` attempt first. If the outcome cannot
/// be recorded, the reservation keeps the recipient in flight until it expires
/// under the retry policy instead of being sent again on the next run.
pub async fn process_pending_deliveries(
    store: &dyn BillingStore,
    mailer: &dyn ReportMailer,
    policy: &RetryPolicy,
    batch_size: usize,
    now: DateTime<Utc>,
) -> BillingResult<DispatchSummary> {
    policy.validate()?;
    let recipients = store
        .list_undelivered_emails(policy, now, UNDELIVERED_SCAN_LIMIT)
        .await?;
    let mut summary = DispatchSummary::default();

    for recipient in recipients {
        if (summary.sent + summary.failed) as usize >= batch_size {
            break;
        }
        summary.picked += 1;
        match deliver(store, mailer, policy, &recipient, now).await {
            Ok(DispatchOutcome::Sent) => summary.sent += 1,
            Ok(DispatchOutcome::Failed) => summary.failed += 1,
            Ok(DispatchOutcome::Skipped(decision)) => {
                summary.skipped += 1;
                tracing::debug!(report_email_id = %recipient.id, ?decision, "Report email not due");
            }
            Err(error) => {
                summary.skipped += 1;
                warn!(report_email_id = %recipient.id, error = %error, "Report email dispatch aborted");
            }
        }
    }

    if summary.picked > 0 {
        info!(
            picked = summary.picked,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "processed report deliveries"
        );
    }
    Ok(summary)
}

async fn deliver(
    store: &dyn BillingStore,
    mailer: &dyn ReportMailer,
    policy: &RetryPolicy,
    recipient: &ReportEmail,
    now: DateTime<Utc>,
) -> BillingResult<DispatchOutcome> {
    if recipient.last_sent_at.is_some() {
        return Ok(DispatchOutcome::Skipped(None));
    }
    let attempts = store.list_attempts(recipient.id).await?;
    let decision = retry_decision(&attempts, policy, now);
    if !decision.is_ready() {
        return Ok(DispatchOutcome::Skipped(Some(decision)));
    }

    let report = store.get_report(recipient.report_id).await?;
    let message = render_report_email(&report, &recipient.recipient_email);
    record_attempt(store, recipient.id, AttemptStatus::Pending, None, now).await?;
    match mailer.send(&message).await {
        Ok(provider_id) => {
            record_attempt(store, recipient.id, AttemptStatus::Success, None, now).await?;
            info!(
                report_id = %report.id,
                report_email_id = %recipient.id,
                provider_id = provider_id.as_deref().unwrap_or_default(),
                "Report email sent"
            );
            Ok(DispatchOutcome::Sent)
        }
        Err(error) => {
            record_attempt(store, recipient.id, AttemptStatus::Failure, Some(error), now).await?;
            Ok(DispatchOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeDelta;

    use super::*;
    use crate::models::{Report, ReportEmailId};
    use crate::repository::memory::MemoryStore;
    use crate::services::delivery::register_recipient;
    use crate::services::mailer::ReportMessage;
    use crate::services::test_support::{seed_billing_month, seeded_at};

    struct FakeMailer {
        fail_for: Option<String>,
        sent: Mutex<Vec<ReportMessage>>,
    }

    impl FakeMailer {
        fn new(fail_for: Option<&str>) -> Self {
            Self {
                fail_for: fail_for.map(ToOwned::to_owned),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_to(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|message| message.to.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReportMailer for FakeMailer {
        async fn send(&self, message: &ReportMessage) -> Result<Option<String>, String> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail_for.as_deref() == Some(message.to.as_str()) {
                return Err("mailbox unavailable".to_string());
            }
            Ok(Some("msg_1".to_string()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            min_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    async fn realized_report(store: &MemoryStore) -> Report {
        let seeded = seed_billing_month(store).await;
        let report = store
            .save_draft_report(seeded.draft(), seeded_at(2, 2))
            .await
            .unwrap();
        store.realize_report(report.id, seeded_at(2, 2)).await.unwrap()
    }

    #[tokio::test]
    async fn records_outcomes_and_never_resends() {
        let store = MemoryStore::new();
        let report = realized_report(&store).await;
        let ok = register_recipient(&store, report.id, "tenant@example.com", seeded_at(2, 2))
            .await
            .unwrap();
        let bad = register_recipient(&store, report.id, "owner@example.com", seeded_at(2, 2))
            .await
            .unwrap();
        let mailer = FakeMailer::new(Some("owner@example.com"));
        let now = seeded_at(2, 3);

        let summary = process_pending_deliveries(&store, &mailer, &policy(), 10, now)
            .await
            .unwrap();
        assert_eq!(
            summary,
            DispatchSummary {
                picked: 2,
                sent: 1,
                failed: 1,
                skipped: 0,
            }
        );
        assert_eq!(
            store.get_report_email(ok.id).await.unwrap().last_sent_at,
            Some(now)
        );
        let log = store.list_attempts(bad.id).await.unwrap();
        assert_eq!(
            log.iter().map(|attempt| attempt.status).collect::<Vec<_>>(),
            vec![AttemptStatus::Pending, AttemptStatus::Failure]
        );
        assert_eq!(log[1].error_message.as_deref(), Some("mailbox unavailable"));

        let backing_off = process_pending_deliveries(
            &store,
            &mailer,
            &policy(),
            10,
            now + TimeDelta::seconds(30),
        )
        .await
        .unwrap();
        assert_eq!(backing_off.picked, 1);
        assert_eq!(backing_off.skipped, 1);

        let retried = process_pending_deliveries(
            &store,
            &mailer,
            &policy(),
            10,
            now + TimeDelta::seconds(60),
        )
        .await
        .unwrap();
        assert_eq!(retried.failed, 1);

        let exhausted = process_pending_deliveries(
            &store,
            &mailer,
            &policy(),
            10,
            now + TimeDelta::days(1),
        )
        .await
        .unwrap();
        assert_eq!(exhausted, DispatchSummary::default());
        assert_eq!(store.list_attempts(bad.id).await.unwrap().len(), 4);

        let to = mailer.sent_to();
        assert_eq!(to.iter().filter(|addr| *addr == "tenant@example.com").count(), 1);
        assert_eq!(to.iter().filter(|addr| *addr == "owner@example.com").count(), 2);
    }

    #[tokio::test]
    async fn exhausted_recipients_do_not_block_the_batch() {
        let store = MemoryStore::new();
        let report = realized_report(&store).await;
        let stuck = register_recipient(&store, report.id, "owner@example.com", seeded_at(2, 2))
            .await
            .unwrap();
        for minute in 0..2 {
            record_attempt(
                &store,
                stuck.id,
                AttemptStatus::Failure,
                Some("bounced".to_string()),
                seeded_at(2, 2) + TimeDelta::minutes(minute),
            )
            .await
            .unwrap();
        }
        register_recipient(&store, report.id, "tenant@example.com", seeded_at(2, 3))
            .await
            .unwrap();
        let mailer = FakeMailer::new(None);

        let summary = process_pending_deliveries(&store, &mailer, &policy(), 1, seeded_at(2, 4))
            .await
            .unwrap();
        assert_eq!(
            summary,
            DispatchSummary {
                picked: 1,
                sent: 1,
                failed: 0,
                skipped: 0,
            }
        );
        assert_eq!(mailer.sent_to(), vec!["tenant@example.com".to_string()]);
    }

    /// Reports the attempt log of one recipient as seen while a send is in
    /// progress.
    struct ReservationCheckingMailer {
        store: Arc<MemoryStore>,
        recipient: ReportEmailId,
        seen: Mutex<Vec<Vec<AttemptStatus>>>,
    }

    #[async_trait]
    impl ReportMailer for ReservationCheckingMailer {
        async fn send(&self, _message: &ReportMessage) -> Result<Option<String>, String> {
            let log = self.store.list_attempts(self.recipient).await.unwrap();
            self.seen
                .lock()
                .unwrap()
                .push(log.iter().map(|attempt| attempt.status).collect());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn sends_are_reserved_and_abandoned_reservations_expire() {
        let store = Arc::new(MemoryStore::new());
        let report = realized_report(&store).await;
        let recipient =
            register_recipient(store.as_ref(), report.id, "tenant@example.com", seeded_at(2, 2))
                .await
                .unwrap();
        // A run that crashed between reserving and recording the outcome.
        record_attempt(
            store.as_ref(),
            recipient.id,
            AttemptStatus::Pending,
            None,
            seeded_at(2, 3),
        )
        .await
        .unwrap();
        let mailer = ReservationCheckingMailer {
            store: Arc::clone(&store),
            recipient: recipient.id,
            seen: Mutex::new(Vec::new()),
        };

        let blocked = process_pending_deliveries(
            store.as_ref(),
            &mailer,
            &policy(),
            10,
            seeded_at(2, 3) + TimeDelta::seconds(30),
        )
        .await
        .unwrap();
        assert_eq!(blocked.skipped, 1);
        assert!(mailer.seen.lock().unwrap().is_empty());

        let resumed = process_pending_deliveries(
            store.as_ref(),
            &mailer,
            &policy(),
            10,
            seeded_at(2, 3) + TimeDelta::seconds(60),
        )
        .await
        .unwrap();
        assert_eq!(resumed.sent, 1);
        assert_eq!(
            *mailer.seen.lock().unwrap(),
            vec![vec![AttemptStatus::Pending, AttemptStatus::Pending]]
        );
        let delivered = store.get_report_email(recipient.id).await.unwrap();
        assert_eq!(
            delivered.last_sent_at,
            Some(seeded_at(2, 3) + TimeDelta::seconds(60))
        );
    }

    #[tokio::test]
    async fn drafts_are_not_delivered() {
        let store = MemoryStore::new();
        let seeded = seed_billing_month(&store).await;
        let report = store
            .save_draft_report(seeded.draft(), seeded_at(2, 2))
            .await
            .unwrap();
        register_recipient(&store, report.id, "tenant@example.com", seeded_at(2, 2))
            .await
            .unwrap();
        let mailer = FakeMailer::new(None);

        let summary = process_pending_deliveries(&store, &mailer, &policy(), 10, seeded_at(2, 3))
            .await
            .unwrap();
        assert_eq!(summary, DispatchSummary::default());
        assert!(mailer.sent_to().is_empty());
    }
}
