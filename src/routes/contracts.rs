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
    schemas::{parse_path, CreateContractInput, PropertyPath},
    services::registry,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/contracts", axum::routing::post(create_contract))
        .route(
            "/properties/{property_id}/contracts",
            axum::routing::get(list_contracts),
        )
}

async fn create_contract(
    State(state): State<AppState>,
    Json(payload): Json<CreateContractInput>,
) -> AppResult<impl IntoResponse> {
    let contract = payload.into_new_contract()?;
    let contract = registry::register_contract(state.store.as_ref(), contract, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": contract }))))
}

async fn list_contracts(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
) -> AppResult<Json<Value>> {
    let property_id: PropertyId = parse_path(&path.property_id, "property_id")?;
    state.store.get_property(property_id).await?;
    let contracts = state.store.list_contracts(property_id).await?;
    Ok(Json(json!({ "data": contracts })))
}
