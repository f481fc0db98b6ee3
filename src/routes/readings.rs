use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    error::AppResult,
    models::{PropertyId, ReadingId},
    schemas::{
        parse_path, validate_input, CreateReadingInput, ListReadingsQuery, PropertyPath,
        ReadingPath, ReadingValuesInput,
    },
    services::registry,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/readings", axum::routing::post(create_reading))
        .route(
            "/properties/{property_id}/readings",
            axum::routing::get(list_readings),
        )
        .route(
            "/readings/{reading_id}/delete",
            axum::routing::post(delete_reading),
        )
        .route(
            "/readings/{reading_id}/correct",
            axum::routing::post(correct_reading),
        )
}

async fn create_reading(
    State(state): State<AppState>,
    Json(payload): Json<CreateReadingInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let reading = payload.values.into_new_reading(payload.property_id);
    let reading = registry::record_reading(state.store.as_ref(), reading, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": reading }))))
}

async fn list_readings(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    Query(query): Query<ListReadingsQuery>,
) -> AppResult<Json<Value>> {
    let property_id: PropertyId = parse_path(&path.property_id, "property_id")?;
    state.store.get_property(property_id).await?;
    let readings = state
        .store
        .list_readings(property_id, query.include_deleted)
        .await?;
    Ok(Json(json!({ "data": readings })))
}

async fn delete_reading(
    State(state): State<AppState>,
    Path(path): Path<ReadingPath>,
) -> AppResult<Json<Value>> {
    let reading_id: ReadingId = parse_path(&path.reading_id, "reading_id")?;
    let reading = registry::delete_reading(state.store.as_ref(), reading_id, Utc::now()).await?;
    Ok(Json(json!({ "data": reading })))
}

async fn correct_reading(
    State(state): State<AppState>,
    Path(path): Path<ReadingPath>,
    Json(payload): Json<ReadingValuesInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let reading_id: ReadingId = parse_path(&path.reading_id, "reading_id")?;
    let original = state.store.get_reading(reading_id).await?;
    let replacement = payload.into_new_reading(original.property_id);
    let reading =
        registry::correct_reading(state.store.as_ref(), reading_id, replacement, Utc::now())
            .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": reading }))))
}
