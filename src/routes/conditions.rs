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
    models::{ConditionsId, MonthlyConditions, PropertyId},
    schemas::{
        parse_path, validate_input, ConditionsPath, CreateConditionsInput, PropertyMonthPath,
        UpdateConditionsInput,
    },
    services::{reconciliation::project_forecast, registry},
    state::AppState,
    units::Month,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/monthly-conditions", axum::routing::post(create_conditions))
        .route(
            "/monthly-conditions/{conditions_id}",
            axum::routing::get(get_conditions_by_id),
        )
        .route(
            "/properties/{property_id}/monthly-conditions/{month}",
            axum::routing::get(get_conditions).patch(update_conditions),
        )
        .route(
            "/properties/{property_id}/monthly-conditions/{month}/forecast",
            axum::routing::get(get_forecast),
        )
}

async fn load_conditions(state: &AppState, path: &PropertyMonthPath) -> AppResult<MonthlyConditions> {
    let property_id: PropertyId = parse_path(&path.property_id, "property_id")?;
    let month: Month = parse_path(&path.month, "month")?;
    Ok(registry::conditions_for_month(state.store.as_ref(), property_id, month).await?)
}

async fn create_conditions(
    State(state): State<AppState>,
    Json(payload): Json<CreateConditionsInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let conditions =
        registry::create_conditions(state.store.as_ref(), payload.into(), Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": conditions }))))
}

async fn get_conditions(
    State(state): State<AppState>,
    Path(path): Path<PropertyMonthPath>,
) -> AppResult<Json<Value>> {
    let conditions = load_conditions(&state, &path).await?;
    Ok(Json(json!({ "data": conditions })))
}

async fn get_conditions_by_id(
    State(state): State<AppState>,
    Path(path): Path<ConditionsPath>,
) -> AppResult<Json<Value>> {
    let conditions_id: ConditionsId = parse_path(&path.conditions_id, "conditions_id")?;
    let conditions = state.store.get_conditions(conditions_id).await?;
    Ok(Json(json!({ "data": conditions })))
}

async fn update_conditions(
    State(state): State<AppState>,
    Path(path): Path<PropertyMonthPath>,
    Json(payload): Json<UpdateConditionsInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let current = load_conditions(&state, &path).await?;
    let terms = payload.merge_into(current.terms());
    let conditions =
        registry::update_conditions(state.store.as_ref(), current.id, terms, Utc::now()).await?;
    Ok(Json(json!({ "data": conditions })))
}

async fn get_forecast(
    State(state): State<AppState>,
    Path(path): Path<PropertyMonthPath>,
) -> AppResult<Json<Value>> {
    let conditions = load_conditions(&state, &path).await?;
    let forecast = project_forecast(&conditions)?;
    Ok(Json(json!({ "data": forecast })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::routes::testing::{app, id_of, send};

    #[tokio::test]
    async fn conditions_round_trip_with_forecast() {
        let app = app();
        let (_, property) = send(
            &app,
            Method::POST,
            "/v1/properties",
            Some(json!({ "label": "Flat 4B", "start_month": "2024-01" })),
        )
        .await;
        let property_id = id_of(&property);

        let (status, created) = send(
            &app,
            Method::POST,
            "/v1/monthly-conditions",
            Some(json!({
                "property_id": property_id,
                "month": "2024-01",
                "forecast_cold": 12,
                "forecast_hot": 4,
                "forecast_heating": 1,
                "price_cold": 50,
                "price_hot_heating": 120,
                "price_heating": 400,
                "advance_payment": 2000,
                "manager_fee": 300
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["month"], "2024-01");
        let (status, by_id) = send(
            &app,
            Method::GET,
            &format!("/v1/monthly-conditions/{}", id_of(&created)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_id["data"]["advance_payment"], 2000);

        let base = format!("/v1/properties/{property_id}/monthly-conditions/2024-01");
        let (status, forecast) = send(&app, Method::GET, &format!("{base}/forecast"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(forecast["data"]["meter_cost_cold_raw"], 600);
        assert_eq!(forecast["data"]["projected_rent_raw"], 1780);
        assert_eq!(forecast["data"]["projected_balance_raw"], 220);

        let (status, updated) =
            send(&app, Method::PATCH, &base, Some(json!({ "manager_fee": 350 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["manager_fee"], 350);
        assert_eq!(updated["data"]["price_cold"], 50);

        let (status, _) = send(
            &app,
            Method::GET,
            &format!("/v1/properties/{property_id}/monthly-conditions/2024-02"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Method::GET,
            &format!("/v1/properties/{property_id}/monthly-conditions/2024-13"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
