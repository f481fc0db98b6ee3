use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct UnitParseError(String);

/// A billing month. Always normalized to the first day of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(NaiveDate);

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self, UnitParseError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| UnitParseError(format!("Invalid month {year:04}-{month:02}.")))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    /// Month of `instant` as observed on a wall clock in `timezone`.
    pub fn containing(instant: DateTime<Utc>, timezone: Tz) -> Self {
        Self::from_date(instant.with_timezone(&timezone).date_naive())
    }

    pub fn first_day(self) -> NaiveDate {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + Months::new(1))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

impl FromStr for Month {
    type Err = UnitParseError;

    /// Accepts `YYYY-MM` and full `YYYY-MM-DD` dates.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        let invalid = || UnitParseError(format!("Invalid month '{trimmed}', expected YYYY-MM."));
        let (year, month) = trimmed.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

const METER_SCALE: i64 = 1000;

/// Cumulative meter value (m³ or GJ) with three fractional digits, kept as
/// integer thousandths so consumption arithmetic is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeterValue(i64);

impl MeterValue {
    pub const ZERO: Self = Self(0);

    pub fn from_thousandths(thousandths: i64) -> Self {
        Self(thousandths)
    }

    pub fn from_whole(units: i64) -> Self {
        Self(units.saturating_mul(METER_SCALE))
    }

    pub fn thousandths(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / METER_SCALE as f64
    }
}

impl fmt::Display for MeterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let scale = METER_SCALE as u64;
        write!(f, "{sign}{}.{:03}", magnitude / scale, magnitude % scale)
    }
}

impl FromStr for MeterValue {
    type Err = UnitParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let invalid = || UnitParseError(format!("Invalid meter value '{trimmed}'."));
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let significant = fraction.trim_end_matches('0');
        if significant.len() > 3 {
            return Err(UnitParseError(format!(
                "Meter value '{trimmed}' has more than three fractional digits."
            )));
        }
        let whole = whole.parse::<i64>().map_err(|_| invalid())?;
        let fraction = format!("{significant:0<3}").parse::<i64>().map_err(|_| invalid())?;
        let magnitude = whole
            .checked_mul(METER_SCALE)
            .and_then(|value| value.checked_add(fraction))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -magnitude } else { magnitude }))
    }
}

impl Serialize for MeterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for MeterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MeterValueVisitor;

        impl de::Visitor<'_> for MeterValueVisitor {
            type Value = MeterValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal meter value")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<MeterValue, E> {
                value
                    .checked_mul(METER_SCALE)
                    .map(MeterValue)
                    .ok_or_else(|| E::custom("meter value out of range"))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<MeterValue, E> {
                i64::try_from(value)
                    .map_err(|_| E::custom("meter value out of range"))
                    .and_then(|value| self.visit_i64(value))
            }

            // Shortest round-trip formatting recovers the decimal the caller wrote.
            fn visit_f64<E: de::Error>(self, value: f64) -> Result<MeterValue, E> {
                if !value.is_finite() {
                    return Err(E::custom("meter value must be finite"));
                }
                value.to_string().parse().map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<MeterValue, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MeterValueVisitor)
    }
}

/// `quantity × unit_price` in minor currency units, rounded half away from
/// zero. `None` on overflow.
pub fn metered_cost(quantity: MeterValue, unit_price: i64) -> Option<i64> {
    let product = i128::from(quantity.thousandths()).checked_mul(i128::from(unit_price))?;
    let scale = i128::from(METER_SCALE);
    let half = scale / 2;
    let rounded = if product >= 0 {
        (product + half) / scale
    } else {
        -((-product + half) / scale)
    };
    i64::try_from(rounded).ok()
}
