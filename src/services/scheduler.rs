use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::services::dispatcher::process_pending_deliveries;
use crate::state::AppState;

/// Spawn the background scheduler that drives report delivery.
///
/// Each run happens in its own `tokio::spawn` so a failing run never stops
/// the loop. Runs do not overlap.
pub async fn run_background_scheduler(state: AppState) {
    let Some(mailer) = state.mailer.clone() else {
        tracing::warn!("Scheduler: no mail transport configured (RESEND_API_KEY), exiting");
        return;
    };
    let policy = state.config.retry_policy();
    if let Err(error) = policy.validate() {
        tracing::error!(error = %error, "Scheduler: invalid report email retry policy, exiting");
        return;
    }

    let interval = Duration::from_secs(state.config.delivery_poll_interval_seconds.max(5));
    let batch_size = state.config.delivery_batch_size.max(1);
    let running = Arc::new(tokio::sync::Mutex::new(()));
    tracing::info!(
        interval_seconds = interval.as_secs(),
        batch_size,
        "Background scheduler started"
    );

    loop {
        sleep(interval).await;

        let Ok(guard) = Arc::clone(&running).try_lock_owned() else {
            tracing::debug!("Scheduler: previous delivery run still in progress");
            continue;
        };
        let store = Arc::clone(&state.store);
        let mailer = Arc::clone(&mailer);
        tokio::spawn(async move {
            let _guard = guard;
            let result = process_pending_deliveries(
                store.as_ref(),
                mailer.as_ref(),
                &policy,
                batch_size,
                Utc::now(),
            )
            .await;
            if let Err(error) = result {
                tracing::error!(error = %error, "Scheduler: report delivery run failed");
            }
        });
    }
}
