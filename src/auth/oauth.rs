//! Source of the external profile consumed by the OAuth callback.
//!
//! The provider handshake (authorization redirect, code exchange) happens
//! outside this service. By the time the callback runs, something upstream has
//! already established who the user is; a [`ProfileResolver`] turns that into an
//! [`ExternalProfile`].

use anyhow::Context;
use async_trait::async_trait;
use axum::http::HeaderMap;

use super::dto::ExternalProfile;

pub const PROVIDER_ID_HEADER: &str = "x-auth-request-user";
pub const EMAIL_HEADER: &str = "x-auth-request-email";
pub const NAME_HEADER: &str = "x-auth-request-preferred-username";
pub const PICTURE_HEADER: &str = "x-auth-request-picture";

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> anyhow::Result<ExternalProfile>;
}

/// Reads the profile forwarded by an authenticating reverse proxy.
///
/// Only sound when the proxy strips these headers from client traffic.
#[derive(Debug, Default, Clone)]
pub struct ForwardedHeaderProfile;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl ProfileResolver for ForwardedHeaderProfile {
    async fn resolve(&self, headers: &HeaderMap) -> anyhow::Result<ExternalProfile> {
        let provider_id = header(headers, PROVIDER_ID_HEADER)
            .with_context(|| format!("missing {PROVIDER_ID_HEADER}"))?;
        let email = header(headers, EMAIL_HEADER)
            .with_context(|| format!("missing {EMAIL_HEADER}"))?;
        Ok(ExternalProfile {
            provider_id: provider_id.to_string(),
            email: email.to_string(),
            name: header(headers, NAME_HEADER).map(str::to_string),
            picture: header(headers, PICTURE_HEADER).map(str::to_string),
        })
    }
}

/// Used when no trusted profile source is configured; every callback fails.
#[derive(Debug, Default, Clone)]
pub struct OAuthDisabled;

#[async_trait]
impl ProfileResolver for OAuthDisabled {
    async fn resolve(&self, _headers: &HeaderMap) -> anyhow::Result<ExternalProfile> {
        anyhow::bail!("oauth login is not configured")
    }
}
