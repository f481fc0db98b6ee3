use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    error::AppResult,
    models::{ReportEmailId, ReportId},
    schemas::{
        parse_path, validate_input, RecordAttemptInput, RegisterRecipientInput, ReportEmailPath,
        ReportPath,
    },
    services::delivery,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/reports/{report_id}/emails",
            axum::routing::get(list_recipients).post(register_recipient),
        )
        .route(
            "/report-emails/{report_email_id}/attempts",
            axum::routing::get(list_attempts).post(record_attempt),
        )
        .route(
            "/report-emails/{report_email_id}/retry-eligibility",
            axum::routing::get(retry_eligibility),
        )
}

async fn list_recipients(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
) -> AppResult<Json<Value>> {
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    state.store.get_report(report_id).await?;
    let recipients = state.store.list_report_emails(report_id).await?;
    Ok(Json(json!({ "data": recipients })))
}

async fn register_recipient(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
    Json(payload): Json<RegisterRecipientInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    let recipient =
        delivery::register_recipient(state.store.as_ref(), report_id, &payload.email, Utc::now())
            .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": recipient }))))
}

async fn record_attempt(
    State(state): State<AppState>,
    Path(path): Path<ReportEmailPath>,
    Json(payload): Json<RecordAttemptInput>,
) -> AppResult<impl IntoResponse> {
    let report_email_id: ReportEmailId = parse_path(&path.report_email_id, "report_email_id")?;
    let attempt = delivery::record_attempt(
        state.store.as_ref(),
        report_email_id,
        payload.status,
        payload.error_message,
        Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": attempt }))))
}

async fn list_attempts(
    State(state): State<AppState>,
    Path(path): Path<ReportEmailPath>,
) -> AppResult<Json<Value>> {
    let report_email_id: ReportEmailId = parse_path(&path.report_email_id, "report_email_id")?;
    let attempts = state.store.list_attempts(report_email_id).await?;
    Ok(Json(json!({ "data": attempts })))
}

async fn retry_eligibility(
    State(state): State<AppState>,
    Path(path): Path<ReportEmailPath>,
) -> AppResult<Json<Value>> {
    let report_email_id: ReportEmailId = parse_path(&path.report_email_id, "report_email_id")?;
    let policy = state.config.retry_policy();
    let decision =
        delivery::retry_eligibility(state.store.as_ref(), report_email_id, &policy, Utc::now())
            .await?;
    Ok(Json(json!({
        "data": {
            "report_email_id": report_email_id,
            "eligible": decision.is_ready(),
            "decision": decision,
        }
    })))
}
