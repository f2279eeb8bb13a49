//! Session cookie lifecycle.
//!
//! The cookie set at login and the one that clears it at logout are built from
//! the same base, so name, path, `SameSite`, `HttpOnly` and `Secure` always
//! match; browsers ignore a removal whose attributes differ.

use axum::http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use cookie::{Cookie, SameSite};

use super::jwt::SESSION_TTL;

pub const SESSION_COOKIE_NAME: &str = "authToken";

#[derive(Debug, Clone, Copy)]
pub struct SessionCookies {
    secure: bool,
}

impl SessionCookies {
    /// `secure` should be true in production deployments.
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }

    fn base(&self, value: String) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE_NAME, value))
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(self.secure)
            .path("/")
            .build()
    }

    pub fn session(&self, token: &str) -> Cookie<'static> {
        let mut cookie = self.base(token.to_string());
        cookie.set_max_age(SESSION_TTL);
        cookie
    }

    pub fn removal(&self) -> Cookie<'static> {
        let mut cookie = self.base(String::new());
        cookie.make_removal();
        cookie
    }

    /// Append a `Set-Cookie` carrying `token` to `headers`.
    pub fn attach(&self, headers: &mut HeaderMap, token: &str) -> anyhow::Result<()> {
        append(headers, &self.session(token))
    }

    /// Append a `Set-Cookie` that removes the session cookie.
    pub fn clear(&self, headers: &mut HeaderMap) -> anyhow::Result<()> {
        append(headers, &self.removal())
    }
}

fn append(headers: &mut HeaderMap, cookie: &Cookie<'_>) -> anyhow::Result<()> {
    let value = HeaderValue::from_str(&cookie.to_string())?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

/// Session token from the request's `Cookie` headers, if any.
pub fn read_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == SESSION_COOKIE_NAME)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}
