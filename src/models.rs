use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::units::{MeterValue, Month};

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(raw.trim()).map(Self)
            }
        }
    };
}

entity_id!(PropertyId);
entity_id!(ContractId);
entity_id!(ReadingId);
entity_id!(ConditionsId);
entity_id!(ReportId);
entity_id!(ReportEmailId);
entity_id!(AttemptId);
entity_id!(UserId);

macro_rules! closed_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "Unknown {} '{other}'.",
                        stringify!($name)
                    )),
                }
            }
        }
    };
}

closed_enum!(ReadingType {
    Initial => "initial",
    Periodic => "periodic",
    Final => "final",
});

closed_enum!(ReadingOrigin {
    Manual => "manual",
    Import => "import",
});

closed_enum!(ReportStatus {
    Draft => "draft",
    Realized => "realized",
});

closed_enum!(AttemptStatus {
    Success => "success",
    Failure => "failure",
    Pending => "pending",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Utility {
    Cold,
    Hot,
    Heating,
}

impl Utility {
    pub const ALL: [Utility; 3] = [Utility::Cold, Utility::Hot, Utility::Heating];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Hot => "hot",
            Self::Heating => "heating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub label: String,
    pub start_month: Month,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Half-open validity range `[start, end)`. An open end runs indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PeriodRepr")]
pub struct ContractPeriod {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeriodRepr {
    Range(String),
    Bounds {
        start: NaiveDate,
        #[serde(default)]
        end: Option<NaiveDate>,
    },
}

impl TryFrom<PeriodRepr> for ContractPeriod {
    type Error = String;

    fn try_from(repr: PeriodRepr) -> Result<Self, Self::Error> {
        match repr {
            PeriodRepr::Range(literal) => Self::parse_range(&literal),
            PeriodRepr::Bounds { start, end } => Self::new(start, end),
        }
    }
}

impl ContractPeriod {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Result<Self, String> {
        if let Some(end) = end {
            if end <= start {
                return Err(format!(
                    "Contract period end {end} must be after its start {start}."
                ));
            }
        }
        Ok(Self { start, end })
    }

    /// Parses the Postgres `daterange` text form, e.g. `[2024-01-01,2025-01-01)`.
    /// Inclusive upper bounds are normalized to the exclusive form.
    pub fn parse_range(literal: &str) -> Result<Self, String> {
        let trimmed = literal.trim();
        let invalid = || format!("Invalid date range '{trimmed}'.");
        let mut chars = trimmed.chars();
        let lower_bracket = chars.next().ok_or_else(invalid)?;
        let upper_bracket = chars.next_back().ok_or_else(invalid)?;
        let (lower, upper) = chars.as_str().split_once(',').ok_or_else(invalid)?;
        let parse = |raw: &str| -> Result<Option<NaiveDate>, String> {
            let raw = raw.trim().trim_matches('"');
            if raw.is_empty() {
                return Ok(None);
            }
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| invalid())
        };
        let mut start = parse(lower)?.ok_or_else(invalid)?;
        if lower_bracket == '(' {
            start = start.succ_opt().ok_or_else(invalid)?;
        }
        let mut end = parse(upper)?;
        if upper_bracket == ']' {
            end = end.and_then(|value| value.succ_opt());
        }
        Self::new(start, end)
    }

    pub fn to_range_literal(&self) -> String {
        match self.end {
            Some(end) => format!("[{},{})", self.start, end),
            None => format!("[{},)", self.start),
        }
    }

    pub fn overlaps(&self, other: &ContractPeriod) -> bool {
        let self_before_other = self.end.is_some_and(|end| end <= other.start);
        let other_before_self = other.end.is_some_and(|end| end <= self.start);
        !(self_before_other || other_before_self)
    }

    /// Whether any day of `month` falls inside the period.
    pub fn covers_month(&self, month: Month) -> bool {
        let month_period = ContractPeriod {
            start: month.first_day(),
            end: Some(month.next().first_day()),
        };
        self.overlaps(&month_period)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub property_id: PropertyId,
    pub tenant_user_id: UserId,
    pub period: ContractPeriod,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub property_id: PropertyId,
    pub reading_type: ReadingType,
    pub reading_at: DateTime<Utc>,
    pub effective_month: Option<Month>,
    pub cold_m3: MeterValue,
    pub hot_m3: MeterValue,
    pub heating_gj: MeterValue,
    pub cold_replaced: bool,
    pub hot_replaced: bool,
    pub heating_replaced: bool,
    pub origin: ReadingOrigin,
    pub comment_text: Option<String>,
    pub comment_visible_to_tenant: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reading {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn value(&self, utility: Utility) -> MeterValue {
        match utility {
            Utility::Cold => self.cold_m3,
            Utility::Hot => self.hot_m3,
            Utility::Heating => self.heating_gj,
        }
    }

    pub fn replaced(&self, utility: Utility) -> bool {
        match utility {
            Utility::Cold => self.cold_replaced,
            Utility::Hot => self.hot_replaced,
            Utility::Heating => self.heating_replaced,
        }
    }

    /// `effective_month` when assigned, otherwise the month of `reading_at`.
    pub fn billing_month(&self, timezone: Tz) -> Month {
        self.effective_month
            .unwrap_or_else(|| Month::containing(self.reading_at, timezone))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyConditions {
    pub id: ConditionsId,
    pub property_id: PropertyId,
    pub month: Month,
    pub forecast_cold: MeterValue,
    pub forecast_hot: MeterValue,
    pub forecast_heating: MeterValue,
    pub price_cold: i64,
    pub price_hot_heating: i64,
    pub price_heating: i64,
    pub advance_payment: i64,
    pub manager_fee: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonthlyConditions {
    /// Unit price in minor units. Hot water is billed at `price_hot_heating`.
    pub fn price(&self, utility: Utility) -> i64 {
        match utility {
            Utility::Cold => self.price_cold,
            Utility::Hot => self.price_hot_heating,
            Utility::Heating => self.price_heating,
        }
    }

    pub fn forecast(&self, utility: Utility) -> MeterValue {
        match utility {
            Utility::Cold => self.forecast_cold,
            Utility::Hot => self.forecast_hot,
            Utility::Heating => self.forecast_heating,
        }
    }
}

/// Computed monetary fields of a report, all in minor currency units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFigures {
    pub meter_cost_cold_raw: i64,
    pub meter_cost_hot_raw: i64,
    pub meter_cost_heating_raw: i64,
    pub fixed_cost_raw: i64,
    pub actual_rent_raw: i64,
    pub balance_raw: i64,
}

impl ReportFigures {
    pub fn meter_cost(&self, utility: Utility) -> i64 {
        match utility {
            Utility::Cold => self.meter_cost_cold_raw,
            Utility::Hot => self.meter_cost_hot_raw,
            Utility::Heating => self.meter_cost_heating_raw,
        }
    }

    /// The advance payment implied by `balance = advance - actual_rent`.
    pub fn advance_payment(&self) -> i64 {
        self.balance_raw.saturating_add(self.actual_rent_raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub contract_id: ContractId,
    pub month: Month,
    pub anchor_reading_id: ReadingId,
    pub anchor_reading_next_id: ReadingId,
    pub monthly_conditions_id: ConditionsId,
    #[serde(flatten)]
    pub figures: ReportFigures,
    pub status: ReportStatus,
    pub realized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn anchor_ids(&self) -> [ReadingId; 2] {
        [self.anchor_reading_id, self.anchor_reading_next_id]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEmail {
    pub id: ReportEmailId,
    pub report_id: ReportId,
    pub recipient_email: String,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEmailAttempt {
    pub id: AttemptId,
    pub report_email_id: ReportEmailId,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
}

// Store inputs. Ids and timestamps are assigned on insert.

#[derive(Debug, Clone)]
pub struct NewProperty {
    pub label: String,
    pub start_month: Month,
}

#[derive(Debug, Clone, Default)]
pub struct PropertyUpdate {
    pub label: Option<String>,
    pub start_month: Option<Month>,
}

#[derive(Debug, Clone)]
pub struct NewContract {
    pub property_id: PropertyId,
    pub tenant_user_id: UserId,
    pub period: ContractPeriod,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub property_id: PropertyId,
    pub reading_type: ReadingType,
    pub reading_at: DateTime<Utc>,
    pub effective_month: Option<Month>,
    pub cold_m3: MeterValue,
    pub hot_m3: MeterValue,
    pub heating_gj: MeterValue,
    pub cold_replaced: bool,
    pub hot_replaced: bool,
    pub heating_replaced: bool,
    pub origin: ReadingOrigin,
    pub comment_text: Option<String>,
    pub comment_visible_to_tenant: bool,
}

impl NewReading {
    pub fn value(&self, utility: Utility) -> MeterValue {
        match utility {
            Utility::Cold => self.cold_m3,
            Utility::Hot => self.hot_m3,
            Utility::Heating => self.heating_gj,
        }
    }

    pub fn replaced(&self, utility: Utility) -> bool {
        match utility {
            Utility::Cold => self.cold_replaced,
            Utility::Hot => self.hot_replaced,
            Utility::Heating => self.heating_replaced,
        }
    }

    pub fn into_reading(self, id: ReadingId, now: DateTime<Utc>) -> Reading {
        Reading {
            id,
            property_id: self.property_id,
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
            comment_text: self.comment_text,
            comment_visible_to_tenant: self.comment_visible_to_tenant,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMonthlyConditions {
    pub property_id: PropertyId,
    pub month: Month,
    pub terms: ConditionsTerms,
}

/// The editable body of a monthly conditions row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionsTerms {
    pub forecast_cold: MeterValue,
    pub forecast_hot: MeterValue,
    pub forecast_heating: MeterValue,
    pub price_cold: i64,
    pub price_hot_heating: i64,
    pub price_heating: i64,
    pub advance_payment: i64,
    pub manager_fee: i64,
}

impl MonthlyConditions {
    pub fn terms(&self) -> ConditionsTerms {
        ConditionsTerms {
            forecast_cold: self.forecast_cold,
            forecast_hot: self.forecast_hot,
            forecast_heating: self.forecast_heating,
            price_cold: self.price_cold,
            price_hot_heating: self.price_hot_heating,
            price_heating: self.price_heating,
            advance_payment: self.advance_payment,
            manager_fee: self.manager_fee,
        }
    }

    pub fn apply_terms(&mut self, terms: ConditionsTerms) {
        self.forecast_cold = terms.forecast_cold;
        self.forecast_hot = terms.forecast_hot;
        self.forecast_heating = terms.forecast_heating;
        self.price_cold = terms.price_cold;
        self.price_hot_heating = terms.price_hot_heating;
        self.price_heating = terms.price_heating;
        self.advance_payment = terms.advance_payment;
        self.manager_fee = terms.manager_fee;
    }
}

/// Engine output awaiting persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftReport {
    pub contract_id: ContractId,
    pub month: Month,
    pub anchor_reading_id: ReadingId,
    pub anchor_reading_next_id: ReadingId,
    pub monthly_conditions_id: ConditionsId,
    /// `updated_at` of the conditions row the figures were computed from.
    pub conditions_updated_at: DateTime<Utc>,
    pub figures: ReportFigures,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub report_email_id: ReportEmailId,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
}
