use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AccountLink, DirectoryError, NewUser, User, UserDirectory};

/// Process-local directory keyed by email.
///
/// Used when no database is configured and as the test double for the
/// auth service. The write lock makes check-and-insert atomic, so the email
/// uniqueness guarantee matches the Postgres unique index.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Drop the account owning `email`, as an out-of-band deletion would.
    #[cfg(test)]
    pub async fn remove(&self, email: &str) -> Option<User> {
        self.users.write().await.remove(email)
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError> {
        Ok(self.users.read().await.get(email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, DirectoryError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn create(&self, new_user: NewUser) -> Result<User, DirectoryError> {
        let mut users = self.users.write().await;
        if users.contains_key(&new_user.email) {
            return Err(DirectoryError::EmailTaken);
        }

        let user = User {
            id: Uuid::new_v4(),
            name: new_user.name,
            email: new_user.email,
            password_hash: new_user.password_hash,
            google_id: new_user.google_id,
            avatar: new_user.avatar,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.email.clone(), user.clone());
        Ok(user)
    }

    async fn update_by_email(
        &self,
        email: &str,
        link: AccountLink,
    ) -> Result<User, DirectoryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(email).ok_or(DirectoryError::NotFound)?;
        link.apply_to(user);
        Ok(user.clone())
    }
}
