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
    models::{ContractId, ReportId},
    schemas::{parse_path, ContractPath, GenerateReportInput, ReportPath},
    services::{
        report_generation::generate_report,
        report_lifecycle::{self, ReportPatch},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/reports/generate", axum::routing::post(generate))
        .route(
            "/contracts/{contract_id}/reports",
            axum::routing::get(list_reports),
        )
        .route(
            "/reports/{report_id}",
            axum::routing::get(get_report).patch(update_report),
        )
        .route("/reports/{report_id}/realize", axum::routing::post(realize))
        .route("/reports/{report_id}/discard", axum::routing::post(discard))
}

async fn generate(
    State(state): State<AppState>,
    Json(payload): Json<GenerateReportInput>,
) -> AppResult<impl IntoResponse> {
    let generated = generate_report(
        state.store.as_ref(),
        &state.generation_locks,
        payload.into(),
        state.config.billing_timezone,
        Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": generated }))))
}

async fn list_reports(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let contract_id: ContractId = parse_path(&path.contract_id, "contract_id")?;
    state.store.get_contract(contract_id).await?;
    let reports = state.store.list_reports(contract_id).await?;
    Ok(Json(json!({ "data": reports })))
}

async fn get_report(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
) -> AppResult<Json<Value>> {
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    let report = state.store.get_report(report_id).await?;
    Ok(Json(json!({ "data": report })))
}

async fn update_report(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
    Json(patch): Json<ReportPatch>,
) -> AppResult<Json<Value>> {
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    let report =
        report_lifecycle::update_report(state.store.as_ref(), report_id, patch, Utc::now()).await?;
    Ok(Json(json!({ "data": report })))
}

async fn realize(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
) -> AppResult<Json<Value>> {
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    let report = report_lifecycle::realize_report(state.store.as_ref(), report_id, Utc::now()).await?;
    Ok(Json(json!({ "data": report })))
}

async fn discard(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
) -> AppResult<Json<Value>> {
    let report_id: ReportId = parse_path(&path.report_id, "report_id")?;
    let report = report_lifecycle::discard_draft(state.store.as_ref(), report_id).await?;
    Ok(Json(json!({ "data": report })))
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::{
        http::{Method, StatusCode},
        Router,
    };
    use serde_json::{json, Value};

    use crate::routes::testing::{app, id_of, send};

    /// Seeds one billable January and returns the contract id.
    pub(crate) async fn seed_january(app: &Router) -> String {
        let (_, property) = send(
            app,
            Method::POST,
            "/v1/properties",
            Some(json!({ "label": "Flat 4B", "start_month": "2024-01" })),
        )
        .await;
        let property_id = id_of(&property);
        let (_, contract) = send(
            app,
            Method::POST,
            "/v1/contracts",
            Some(json!({
                "property_id": property_id,
                "tenant_user_id": "7d3c1d9e-4c5a-4f6e-9a44-0b8f3cc1d003",
                "start_date": "2024-01-01"
            })),
        )
        .await;
        send(
            app,
            Method::POST,
            "/v1/monthly-conditions",
            Some(json!({
                "property_id": property_id,
                "month": "2024-01",
                "price_cold": 50,
                "price_hot_heating": 120,
                "price_heating": 400,
                "advance_payment": 2000,
                "manager_fee": 300
            })),
        )
        .await;
        for (reading_type, at, month, cold) in [
            ("initial", "2024-01-01T08:00:00Z", "2024-01", 100),
            ("periodic", "2024-02-01T08:00:00Z", "2024-02", 115),
        ] {
            let (status, _) = send(
                app,
                Method::POST,
                "/v1/readings",
                Some(json!({
                    "property_id": property_id,
                    "reading_type": reading_type,
                    "reading_at": at,
                    "effective_month": month,
                    "cold_m3": cold,
                    "hot_m3": 10,
                    "heating_gj": 1
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        id_of(&contract)
    }

    pub(crate) async fn generate_january(app: &Router, contract_id: &str) -> Value {
        let (status, generated) = send(
            app,
            Method::POST,
            "/v1/reports/generate",
            Some(json!({ "contract_id": contract_id, "month": "2024-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        generated
    }

    #[tokio::test]
    async fn generate_patch_realize_then_freeze() {
        let app = app();
        let contract_id = seed_january(&app).await;
        let generated = generate_january(&app, &contract_id).await;
        let report = &generated["data"]["report"];
        assert_eq!(report["meter_cost_cold_raw"], 750);
        assert_eq!(report["actual_rent_raw"], 1050);
        assert_eq!(report["balance_raw"], 950);
        assert_eq!(report["status"], "draft");
        assert_eq!(generated["data"]["consumption"]["cold"]["cost_raw"], 750);
        let report_id = report["id"].as_str().expect("report id").to_string();
        let uri = format!("/v1/reports/{report_id}");

        let (status, patched) =
            send(&app, Method::PATCH, &uri, Some(json!({ "fixed_cost_raw": 400 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["data"]["actual_rent_raw"], 1150);
        assert_eq!(patched["data"]["balance_raw"], 850);

        let (status, realized) = send(&app, Method::POST, &format!("{uri}/realize"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(realized["data"]["status"], "realized");
        assert!(realized["data"]["realized_at"].is_string());

        let (status, body) = send(&app, Method::POST, &format!("{uri}/realize"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "already_realized");

        let (status, body) =
            send(&app, Method::PATCH, &uri, Some(json!({ "fixed_cost_raw": 1 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "immutable_report");

        let (status, body) = send(&app, Method::POST, &format!("{uri}/discard"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "immutable_report");
    }

    #[tokio::test]
    async fn discarded_drafts_disappear() {
        let app = app();
        let contract_id = seed_january(&app).await;
        let generated = generate_january(&app, &contract_id).await;
        let report_id = generated["data"]["report"]["id"]
            .as_str()
            .expect("report id")
            .to_string();

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/v1/reports/{report_id}/discard"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::GET, &format!("/v1/reports/{report_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, listed) = send(
            &app,
            Method::GET,
            &format!("/v1/contracts/{contract_id}/reports"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn generation_without_conditions_is_not_found() {
        let app = app();
        let contract_id = seed_january(&app).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/reports/generate",
            Some(json!({ "contract_id": contract_id, "month": "2024-02" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }
}
