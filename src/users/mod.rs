//! User directory: the account store behind authentication.
//!
//! The directory is keyed by a unique email and supports lookup by email or id,
//! creation and update-by-email. Uniqueness is enforced by the store itself, so a
//! create that races another create for the same email fails with
//! [`DirectoryError::EmailTaken`] instead of producing a duplicate.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryUserDirectory;
pub use postgres::PgUserDirectory;

/// User record in the directory.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // absent for OAuth-only accounts
    pub google_id: Option<String>,
    pub avatar: Option<String>,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn has_password(&self) -> bool {
        self.password_hash.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Fields supplied when creating an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub avatar: Option<String>,
}

/// External identity fields to attach to an existing account.
///
/// Applied with fill-if-unset semantics: a stored `google_id` or non-empty
/// `avatar` is never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountLink {
    pub google_id: Option<String>,
    pub avatar: Option<String>,
}

impl AccountLink {
    /// Merge this link into `user` without overwriting what is already set.
    pub fn apply_to(&self, user: &mut User) {
        if user.google_id.is_none() {
            user.google_id = self.google_id.clone();
        }
        if user.avatar.as_deref().map_or(true, str::is_empty) {
            if let Some(avatar) = self.avatar.as_deref().filter(|a| !a.is_empty()) {
                user.avatar = Some(avatar.to_string());
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("email already exists")]
    EmailTaken,

    #[error("user not found")]
    NotFound,

    #[error("directory call timed out")]
    Timeout,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DirectoryError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Backend(_))
    }
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::EmailTaken,
            sqlx::Error::RowNotFound => Self::NotFound,
            _ => Self::Backend(anyhow::Error::new(err).context("postgres")),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, DirectoryError>;

    /// Insert a new account. Fails with [`DirectoryError::EmailTaken`] when the
    /// email is already in use.
    async fn create(&self, user: NewUser) -> Result<User, DirectoryError>;

    /// Attach `link` to the account owning `email`.
    async fn update_by_email(&self, email: &str, link: AccountLink)
        -> Result<User, DirectoryError>;
}
