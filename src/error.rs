use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{ConditionsId, ContractId, ReadingId, ReportId};
use crate::units::Month;

/// Failures of the billing core. Every variant names the entities involved so
/// the caller can retry or report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Reconciliation failed for contract {contract_id} in {month}: {reason}")]
    Reconciliation {
        contract_id: ContractId,
        month: Month,
        reason: String,
    },
    #[error("Report {report_id} references anchor reading {reading_id} which is missing or deleted.")]
    StaleAnchor {
        report_id: ReportId,
        reading_id: ReadingId,
    },
    #[error("Monthly conditions {conditions_id} changed after the report figures were computed; regenerate the report.")]
    StaleConditions { conditions_id: ConditionsId },
    #[error("Report {report_id} is already realized.")]
    AlreadyRealized { report_id: ReportId },
    #[error("Report {report_id} is realized; its computed fields are immutable.")]
    ImmutableReport { report_id: ReportId },
    #[error("{entity} {id} not found.")]
    NotFound { entity: &'static str, id: String },
    #[error("Store operation failed: {0}")]
    Store(String),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Reconciliation { .. } => "reconciliation_error",
            Self::StaleAnchor { .. } => "stale_anchor",
            Self::StaleConditions { .. } => "stale_conditions",
            Self::AlreadyRealized { .. } => "already_realized",
            Self::ImmutableReport { .. } => "immutable_report",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Reconciliation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StaleAnchor { .. }
            | Self::StaleConditions { .. }
            | Self::AlreadyRealized { .. }
            | Self::ImmutableReport { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::UnprocessableEntity(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error")
            }
            Self::Billing(error) => (error.status_code(), error.kind()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "Request failed");
        } else {
            tracing::debug!(error = %self, kind, "Request rejected");
        }
        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReportId;

    #[test]
    fn lifecycle_conflicts_map_to_409() {
        let report_id = ReportId::generate();
        for error in [
            BillingError::AlreadyRealized { report_id },
            BillingError::ImmutableReport { report_id },
            BillingError::StaleAnchor {
                report_id,
                reading_id: crate::models::ReadingId::generate(),
            },
            BillingError::StaleConditions {
                conditions_id: crate::models::ConditionsId::generate(),
            },
        ] {
            let (status, _) = AppError::from(error).status_and_kind();
            assert_eq!(status, StatusCode::CONFLICT);
        }
    }

    #[test]
    fn messages_carry_entity_ids() {
        let report_id = ReportId::generate();
        let message = BillingError::AlreadyRealized { report_id }.to_string();
        assert!(message.contains(&report_id.to_string()));
        assert_eq!(
            BillingError::not_found("reading", "abc").to_string(),
            "reading abc not found."
        );
    }
}
