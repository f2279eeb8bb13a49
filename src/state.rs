use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::{
    auth::{
        cookie::SessionCookies,
        jwt::TokenService,
        oauth::{ForwardedHeaderProfile, OAuthDisabled, ProfileResolver},
        service::AuthService,
    },
    config::AppConfig,
    users::{InMemoryUserDirectory, PgUserDirectory, UserDirectory},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
    pub cookies: SessionCookies,
    pub profiles: Arc<dyn ProfileResolver>,
}

impl AppState {
    /// Build the state from the environment. Also returns the Postgres pool
    /// when one is configured, so the caller can run migrations on it.
    pub async fn init() -> anyhow::Result<(Self, Option<PgPool>)> {
        let config = AppConfig::from_env()?;

        let (directory, pool): (Arc<dyn UserDirectory>, Option<PgPool>) = match &config.database
        {
            Some(db) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(db.max_connections)
                    .connect(&db.url)
                    .await?;
                info!(max_connections = db.max_connections, "connected to postgres");
                (Arc::new(PgUserDirectory::new(pool.clone())), Some(pool))
            }
            None => {
                warn!("DATABASE_URL not set; accounts live in memory and vanish on restart");
                (Arc::new(InMemoryUserDirectory::new()), None)
            }
        };

        let profiles: Arc<dyn ProfileResolver> = if config.oauth_trust_proxy_headers {
            Arc::new(ForwardedHeaderProfile)
        } else {
            info!("oauth profile source not configured; google callback will redirect to failure");
            Arc::new(OAuthDisabled)
        };

        Ok((Self::from_parts(config, directory, profiles), pool))
    }

    pub fn from_parts(
        config: AppConfig,
        directory: Arc<dyn UserDirectory>,
        profiles: Arc<dyn ProfileResolver>,
    ) -> Self {
        let auth = AuthService::new(
            directory,
            TokenService::from_config(&config.jwt),
            config.directory_timeout(),
        );
        Self {
            cookies: SessionCookies::new(config.production),
            config: Arc::new(config),
            auth: Arc::new(auth),
            profiles,
        }
    }

    /// In-memory state for handler tests. OAuth profiles come from forwarded headers.
    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::config::JwtConfig;

        let config = AppConfig {
            jwt: JwtConfig {
                secret: "test".into(),
            },
            client_url: "http://localhost:3000".into(),
            production: false,
            database: None,
            directory_timeout_secs: 5,
            oauth_trust_proxy_headers: true,
        };
        Self::from_parts(
            config,
            Arc::new(InMemoryUserDirectory::new()),
            Arc::new(ForwardedHeaderProfile),
        )
    }
}
