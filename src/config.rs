use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub jwt: JwtConfig,
    /// Base URL of the browser client; OAuth redirects and CORS hang off it.
    pub client_url: String,
    /// Controls the `Secure` attribute of the session cookie.
    pub production: bool,
    /// `None` falls back to the in-memory user directory.
    pub database: Option<DatabaseConfig>,
    pub directory_timeout_secs: u64,
    pub oauth_trust_proxy_headers: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
        };
        if jwt.secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let client_url = std::env::var("CLIENT_URL")
            .unwrap_or_else(|_| "http://localhost:3000".into())
            .trim_end_matches('/')
            .to_string();

        let production = std::env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let database = std::env::var("DATABASE_URL").ok().map(|url| DatabaseConfig {
            url,
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(10),
        });

        let directory_timeout_secs = std::env::var("DIRECTORY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5);

        let oauth_trust_proxy_headers = std::env::var("OAUTH_TRUST_PROXY_HEADERS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            jwt,
            client_url,
            production,
            database,
            directory_timeout_secs,
            oauth_trust_proxy_headers,
        })
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    /// Where the browser lands after a successful OAuth callback.
    pub fn dashboard_url(&self) -> String {
        format!("{}/dashboard", self.client_url)
    }

    /// Where the browser lands after a failed OAuth callback.
    pub fn oauth_failure_url(&self) -> String {
        format!("{}/auth/login?error=oauth_failed", self.client_url)
    }
}
