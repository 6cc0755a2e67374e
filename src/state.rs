use std::{sync::Arc, time::Duration};

use crate::{
    auth::jwt::JwtService,
    automation::{
        backoff::RetryPolicy, engine::EngineSettings, issuers::ScriptOptions, AutomationServices,
    },
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    error::{AppError, AppResult},
    storage::ObjectStorage,
};

/// Everything a request handler or job needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub jwt: JwtService,
    pub automation: AutomationServices,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        jwt: JwtService,
        automation: AutomationServices,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            jwt,
            automation,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    /// Step retry policy for portal runs.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy::new(
                self.config.step_max_attempts,
                Duration::from_millis(self.config.step_retry_backoff_ms),
            ),
            ..EngineSettings::default()
        }
    }

    /// Bounds for the built-in scripts' waits on portal-side processing.
    pub fn script_options(&self) -> ScriptOptions {
        ScriptOptions {
            settle_timeout: self.config.portal_settle_timeout(),
        }
    }
}
