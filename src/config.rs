use std::{env, time::Duration};

use chrono_tz::Tz;

use crate::services::delivery::RetryPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub run_migrations: bool,
    pub billing_timezone: Tz,
    pub resend_api_key: Option<String>,
    pub email_from_address: String,
    pub report_email_max_attempts: u32,
    pub report_email_min_backoff_seconds: u64,
    pub report_email_backoff_multiplier: f64,
    pub delivery_poll_interval_seconds: u64,
    pub delivery_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Utility Billing API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            run_migrations: env_parse_bool_or("RUN_MIGRATIONS", false),
            billing_timezone: parse_timezone(&env_or("BILLING_TIMEZONE", "UTC")),
            resend_api_key: env_opt("RESEND_API_KEY"),
            email_from_address: env_or("EMAIL_FROM_ADDRESS", "billing@localhost"),
            report_email_max_attempts: env_parse_or("REPORT_EMAIL_MAX_ATTEMPTS", 5),
            report_email_min_backoff_seconds: env_parse_or("REPORT_EMAIL_MIN_BACKOFF_SECONDS", 60),
            report_email_backoff_multiplier: env_parse_or("REPORT_EMAIL_BACKOFF_MULTIPLIER", 2.0),
            delivery_poll_interval_seconds: env_parse_or("DELIVERY_POLL_INTERVAL_SECONDS", 60),
            delivery_batch_size: env_parse_or("DELIVERY_BATCH_SIZE", 50),
        }
    }

    /// Defaults used by tests and database-less local runs.
    pub fn local_defaults() -> Self {
        Self {
            app_name: "Utility Billing API".to_string(),
            environment: "test".to_string(),
            api_prefix: "/v1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            rate_limit_per_second: 10,
            rate_limit_burst_size: 100,
            database_url: None,
            db_pool_max_connections: 5,
            db_pool_min_connections: 1,
            db_pool_acquire_timeout_seconds: 5,
            db_pool_idle_timeout_seconds: 600,
            run_migrations: false,
            billing_timezone: Tz::UTC,
            resend_api_key: None,
            email_from_address: "billing@localhost".to_string(),
            report_email_max_attempts: 5,
            report_email_min_backoff_seconds: 60,
            report_email_backoff_multiplier: 2.0,
            delivery_poll_interval_seconds: 60,
            delivery_batch_size: 50,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.report_email_max_attempts,
            min_backoff: Duration::from_secs(self.report_email_min_backoff_seconds),
            backoff_multiplier: self.report_email_backoff_multiplier,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

fn parse_timezone(raw: &str) -> Tz {
    raw.trim().parse::<Tz>().unwrap_or(Tz::UTC)
}
