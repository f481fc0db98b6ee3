use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    db::build_pool,
    repository::{memory::MemoryStore, postgres::PgStore, store::BillingStore},
    services::{
        mailer::{ReportMailer, ResendMailer},
        report_generation::GenerationLocks,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub store: Arc<dyn BillingStore>,
    pub generation_locks: GenerationLocks,
    pub mailer: Option<Arc<dyn ReportMailer>>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http_client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        let db_pool = build_pool(&config)?;
        let store: Arc<dyn BillingStore> = match &db_pool {
            Some(pool) => Arc::new(PgStore::new(pool.clone())),
            None => {
                tracing::warn!("DATABASE_URL is not set; using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        let mailer = config.resend_api_key.clone().map(|api_key| {
            Arc::new(ResendMailer::new(
                http_client.clone(),
                api_key,
                config.email_from_address.clone(),
            )) as Arc<dyn ReportMailer>
        });

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            store,
            generation_locks: GenerationLocks::new(),
            mailer,
        })
    }

    /// State over a fresh in-memory store, without database or mail transport.
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            db_pool: None,
            store: Arc::new(MemoryStore::new()),
            generation_locks: GenerationLocks::new(),
            mailer: None,
        }
    }
}
