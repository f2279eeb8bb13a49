use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{AccountLink, DirectoryError, NewUser, User, UserDirectory};

#[derive(Clone)]
pub struct PgUserDirectory {
    db: PgPool,
}

impl PgUserDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    /// Find a user by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, google_id, avatar, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, DirectoryError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, google_id, avatar, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    /// Create a new user; the unique index on `email` is the final arbiter.
    async fn create(&self, user: NewUser) -> Result<User, DirectoryError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, email, password_hash, google_id, avatar)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, email, password_hash, google_id, avatar, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.google_id)
        .bind(&user.avatar)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update_by_email(
        &self,
        email: &str,
        link: AccountLink,
    ) -> Result<User, DirectoryError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET google_id = COALESCE(google_id, $2),
                avatar = COALESCE(NULLIF(avatar, ''), $3)
            WHERE email = $1
            RETURNING id, name, email, password_hash, google_id, avatar, created_at
            "#,
        )
        .bind(email)
        .bind(&link.google_id)
        .bind(&link.avatar)
        .fetch_optional(&self.db)
        .await?
        .ok_or(DirectoryError::NotFound)?;
        Ok(user)
    }
}
