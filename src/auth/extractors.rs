use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::{cookie::read_token, jwt::SessionClaims};
use crate::{error::AuthError, state::AppState};

/// Session claims from the `authToken` cookie. Rejects with 401 when the
/// cookie is missing or its token does not verify.
pub struct AuthUser(pub SessionClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = read_token(&parts.headers);
        let claims = state.auth.authenticate(token.as_deref())?;
        Ok(AuthUser(claims))
    }
}
