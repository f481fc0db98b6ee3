use axum::{routing::get, Router};

use crate::{error::AppError, state::AppState};

pub mod conditions;
pub mod contracts;
pub mod health;
pub mod properties;
pub mod readings;
pub mod report_emails;
pub mod reports;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(properties::router())
        .merge(contracts::router())
        .merge(readings::router())
        .merge(conditions::router())
        .merge(reports::router())
        .merge(report_emails::router())
        .fallback(route_not_found)
}

async fn route_not_found() -> AppError {
    AppError::NotFound("Route not found.".to_string())
}


#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::testing::{app, send};

    #[tokio::test]
    async fn unknown_routes_answer_404_json() {
        let app = app();
        let (status, body) = send(&app, Method::GET, "/v1/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn health_reports_in_memory_store() {
        let app = app();
        let (status, body) = send(&app, Method::GET, "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
    }
}
