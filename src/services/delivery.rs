use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, warn};
use validator::ValidateEmail;

use crate::{
    error::{BillingError, BillingResult},
    models::{AttemptStatus, NewAttempt, ReportEmail, ReportEmailAttempt, ReportEmailId, ReportId},
    repository::store::BillingStore,
};

const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn validate(&self) -> BillingResult<()> {
        if self.max_attempts == 0 {
            return Err(BillingError::Validation(
                "Retry policy needs at least one attempt.".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(BillingError::Validation(format!(
                "Retry backoff multiplier {} must be at least 1.0.",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Wait required after a failure streak of `streak` attempts.
    pub fn backoff(&self, streak: u32) -> TimeDelta {
        if streak == 0 {
            return TimeDelta::zero();
        }
        let exponent = i32::try_from(streak - 1).unwrap_or(i32::MAX);
        let millis = self.min_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(exponent)
            * 1000.0;
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return TimeDelta::MAX;
        }
        TimeDelta::try_milliseconds(millis.round() as i64).unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    Ready,
    /// The newest attempt is still pending. It counts as a failure from
    /// `expires_at` on.
    InFlight { expires_at: DateTime<Utc> },
    Backoff { retry_at: DateTime<Utc> },
    Exhausted { failures: u32 },
}

impl RetryDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Chronological sort key for attempts. An outcome recorded at the same
/// instant as a pending attempt resolves it and sorts after it.
pub fn attempt_order(attempt: &ReportEmailAttempt) -> (DateTime<Utc>, bool) {
    (attempt.attempted_at, attempt.status != AttemptStatus::Pending)
}

/// Decides whether a recipient may be attempted again at `now`.
///
/// Attempts are scanned newest-first and a success closes the current failure
/// streak. Pending attempts followed by an outcome are resolved and skipped.
/// An unresolved pending attempt is in flight for `min_backoff` and counts as
/// a failure once that has passed. An empty streak never waits.
pub fn retry_decision(
    attempts: &[ReportEmailAttempt],
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> RetryDecision {
    let mut ordered: Vec<&ReportEmailAttempt> = attempts.iter().collect();
    ordered.sort_by_key(|attempt| attempt_order(attempt));
    ordered.reverse();

    let mut streak = 0_u32;
    let mut resolved = false;
    for attempt in &ordered {
        match attempt.status {
            AttemptStatus::Success => break,
            AttemptStatus::Failure => {
                streak += 1;
                resolved = true;
            }
            AttemptStatus::Pending if resolved => {}
            AttemptStatus::Pending => {
                let expires_at = pending_expiry(attempt, policy);
                if now < expires_at {
                    return RetryDecision::InFlight { expires_at };
                }
                streak += 1;
            }
        }
    }

    if streak >= policy.max_attempts {
        return RetryDecision::Exhausted { failures: streak };
    }
    let Some(last) = ordered.first() else {
        return RetryDecision::Ready;
    };
    if streak == 0 {
        return RetryDecision::Ready;
    }
    let retry_at = last
        .attempted_at
        .checked_add_signed(policy.backoff(streak))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if now >= retry_at {
        RetryDecision::Ready
    } else {
        RetryDecision::Backoff { retry_at }
    }
}

fn pending_expiry(attempt: &ReportEmailAttempt, policy: &RetryPolicy) -> DateTime<Utc> {
    attempt
        .attempted_at
        .checked_add_signed(policy.backoff(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Trims and lower-cases an address after checking its shape.
pub fn normalize_email(raw: &str) -> BillingResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.validate_email() {
        return Err(BillingError::Validation(format!(
            "'{}' is not a valid email address.",
            raw.trim()
        )));
    }
    Ok(email)
}

fn truncate_error_message(message: Option<String>) -> Option<String> {
    message
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
        .map(|message| message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect())
}

/// Idempotent per report and normalized address.
pub async fn register_recipient(
    store: &dyn BillingStore,
    report_id: ReportId,
    email: &str,
    now: DateTime<Utc>,
) -> BillingResult<ReportEmail> {
    let email = normalize_email(email)?;
    let (recipient, created) = store.upsert_report_email(report_id, &email, now).await?;
    if created {
        info!(report_id = %report_id, report_email_id = %recipient.id, "Report recipient registered");
    }
    Ok(recipient)
}

pub async fn record_attempt(
    store: &dyn BillingStore,
    report_email_id: ReportEmailId,
    status: AttemptStatus,
    error_message: Option<String>,
    now: DateTime<Utc>,
) -> BillingResult<ReportEmailAttempt> {
    let attempt = store
        .append_attempt(NewAttempt {
            report_email_id,
            attempted_at: now,
            status,
            error_message: truncate_error_message(error_message),
        })
        .await?;
    match attempt.status {
        AttemptStatus::Failure => warn!(
            report_email_id = %report_email_id,
            error = attempt.error_message.as_deref().unwrap_or_default(),
            "Report email delivery failed"
        ),
        status => info!(report_email_id = %report_email_id, status = %status, "Report email attempt recorded"),
    }
    Ok(attempt)
}

/// Retry eligibility of one recipient; `is_ready()` on the result answers
/// whether it may be attempted now.
pub async fn retry_eligibility(
    store: &dyn BillingStore,
    report_email_id: ReportEmailId,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> BillingResult<RetryDecision> {
    policy.validate()?;
    let attempts = store.list_attempts(report_email_id).await?;
    Ok(retry_decision(&attempts, policy, now))
}
