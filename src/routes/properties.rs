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
    models::PropertyId,
    schemas::{parse_path, validate_input, CreatePropertyInput, PropertyPath, UpdatePropertyInput},
    services::registry,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/properties", axum::routing::post(create_property))
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property).patch(update_property),
        )
}

async fn create_property(
    State(state): State<AppState>,
    Json(payload): Json<CreatePropertyInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let property =
        registry::create_property(state.store.as_ref(), payload.into(), Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": property }))))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
) -> AppResult<Json<Value>> {
    let property_id: PropertyId = parse_path(&path.property_id, "property_id")?;
    let property = state.store.get_property(property_id).await?;
    Ok(Json(json!({ "data": property })))
}

async fn update_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    Json(payload): Json<UpdatePropertyInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let property_id: PropertyId = parse_path(&path.property_id, "property_id")?;
    let property =
        registry::update_property(state.store.as_ref(), property_id, payload.into(), Utc::now())
            .await?;
    Ok(Json(json!({ "data": property })))
}
