use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        AttemptStatus, ConditionsTerms, ContractId, ContractPeriod, NewContract,
        NewMonthlyConditions, NewProperty, NewReading, PropertyId, PropertyUpdate, ReadingId,
        ReadingOrigin, ReadingType, UserId,
    },
    services::{reconciliation::ReplacementBaselines, report_generation::GenerationRequest},
    units::{MeterValue, Month},
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

/// Parses a path segment, answering 400 when it is malformed.
pub fn parse_path<T: FromStr>(raw: &str, field: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid {field} '{}'.", raw.trim())))
}

fn default_origin_manual() -> ReadingOrigin {
    ReadingOrigin::Manual
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePropertyInput {
    #[validate(length(min = 1, max = 255))]
    pub label: String,
    pub start_month: Month,
}

impl From<CreatePropertyInput> for NewProperty {
    fn from(input: CreatePropertyInput) -> Self {
        Self {
            label: input.label,
            start_month: input.start_month,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdatePropertyInput {
    #[validate(length(min = 1, max = 255))]
    pub label: Option<String>,
    pub start_month: Option<Month>,
}

impl From<UpdatePropertyInput> for PropertyUpdate {
    fn from(input: UpdatePropertyInput) -> Self {
        Self {
            label: input.label,
            start_month: input.start_month,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateContractInput {
    pub property_id: PropertyId,
    pub tenant_user_id: UserId,
    pub start_date: NaiveDate,
    /// Exclusive. Omitted for open-ended contracts.
    pub end_date: Option<NaiveDate>,
}

impl CreateContractInput {
    pub fn into_new_contract(self) -> Result<NewContract, AppError> {
        let period =
            ContractPeriod::new(self.start_date, self.end_date).map_err(AppError::UnprocessableEntity)?;
        Ok(NewContract {
            property_id: self.property_id,
            tenant_user_id: self.tenant_user_id,
            period,
        })
    }
}

/// Meter values and metadata of a reading, shared by create and correct.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReadingValuesInput {
    pub reading_type: ReadingType,
    pub reading_at: DateTime<Utc>,
    pub effective_month: Option<Month>,
    pub cold_m3: MeterValue,
    pub hot_m3: MeterValue,
    pub heating_gj: MeterValue,
    #[serde(default)]
    pub cold_replaced: bool,
    #[serde(default)]
    pub hot_replaced: bool,
    #[serde(default)]
    pub heating_replaced: bool,
    #[serde(default = "default_origin_manual")]
    pub origin: ReadingOrigin,
    #[validate(length(max = 2000))]
    pub comment_text: Option<String>,
    #[serde(default)]
    pub comment_visible_to_tenant: bool,
}

impl ReadingValuesInput {
    pub fn into_new_reading(self, property_id: PropertyId) -> NewReading {
        NewReading {
            property_id,
            reading_type: self.reading_type,
            reading_at: self.reading_at,
            effective_month: self.effective_month,
            cold_m3: self.cold_m3,
            hot_m3: self.hot_m3,
            heating_gj: self.heating_gj,
            cold_replaced: self.cold_replaced,
            hot_replaced: self.hot_replaced,
            heating_replaced: self.heating_replaced,
            origin: self.origin,
            comment_text: self
                .comment_text
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
            comment_visible_to_tenant: self.comment_visible_to_tenant,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateReadingInput {
    pub property_id: PropertyId,
    #[serde(flatten)]
    #[validate(nested)]
    pub values: ReadingValuesInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListReadingsQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConditionsTermsInput {
    #[serde(default)]
    pub forecast_cold: MeterValue,
    #[serde(default)]
    pub forecast_hot: MeterValue,
    #[serde(default)]
    pub forecast_heating: MeterValue,
    #[validate(range(min = 0))]
    pub price_cold: i64,
    #[validate(range(min = 0))]
    pub price_hot_heating: i64,
    #[validate(range(min = 0))]
    pub price_heating: i64,
    #[validate(range(min = 0))]
    pub advance_payment: i64,
    #[validate(range(min = 0))]
    pub manager_fee: i64,
}

impl From<ConditionsTermsInput> for ConditionsTerms {
    fn from(input: ConditionsTermsInput) -> Self {
        Self {
            forecast_cold: input.forecast_cold,
            forecast_hot: input.forecast_hot,
            forecast_heating: input.forecast_heating,
            price_cold: input.price_cold,
            price_hot_heating: input.price_hot_heating,
            price_heating: input.price_heating,
            advance_payment: input.advance_payment,
            manager_fee: input.manager_fee,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateConditionsInput {
    pub property_id: PropertyId,
    pub month: Month,
    #[serde(flatten)]
    #[validate(nested)]
    pub terms: ConditionsTermsInput,
}

impl From<CreateConditionsInput> for NewMonthlyConditions {
    fn from(input: CreateConditionsInput) -> Self {
        Self {
            property_id: input.property_id,
            month: input.month,
            terms: input.terms.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateConditionsInput {
    pub forecast_cold: Option<MeterValue>,
    pub forecast_hot: Option<MeterValue>,
    pub forecast_heating: Option<MeterValue>,
    #[validate(range(min = 0))]
    pub price_cold: Option<i64>,
    #[validate(range(min = 0))]
    pub price_hot_heating: Option<i64>,
    #[validate(range(min = 0))]
    pub price_heating: Option<i64>,
    #[validate(range(min = 0))]
    pub advance_payment: Option<i64>,
    #[validate(range(min = 0))]
    pub manager_fee: Option<i64>,
}

impl UpdateConditionsInput {
    pub fn merge_into(self, current: ConditionsTerms) -> ConditionsTerms {
        ConditionsTerms {
            forecast_cold: self.forecast_cold.unwrap_or(current.forecast_cold),
            forecast_hot: self.forecast_hot.unwrap_or(current.forecast_hot),
            forecast_heating: self.forecast_heating.unwrap_or(current.forecast_heating),
            price_cold: self.price_cold.unwrap_or(current.price_cold),
            price_hot_heating: self.price_hot_heating.unwrap_or(current.price_hot_heating),
            price_heating: self.price_heating.unwrap_or(current.price_heating),
            advance_payment: self.advance_payment.unwrap_or(current.advance_payment),
            manager_fee: self.manager_fee.unwrap_or(current.manager_fee),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateReportInput {
    pub contract_id: ContractId,
    pub month: Month,
    pub anchor_reading_id: Option<ReadingId>,
    pub anchor_reading_next_id: Option<ReadingId>,
    #[serde(default)]
    pub baselines: ReplacementBaselines,
}

impl From<GenerateReportInput> for GenerationRequest {
    fn from(input: GenerateReportInput) -> Self {
        Self {
            contract_id: input.contract_id,
            month: input.month,
            anchor_reading_id: input.anchor_reading_id,
            anchor_reading_next_id: input.anchor_reading_next_id,
            baselines: input.baselines,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterRecipientInput {
    #[validate(length(min = 3, max = 320))]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordAttemptInput {
    pub status: AttemptStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionsPath {
    pub conditions_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyMonthPath {
    pub property_id: String,
    pub month: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadingPath {
    pub reading_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportPath {
    pub report_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportEmailPath {
    pub report_email_id: String,
}
