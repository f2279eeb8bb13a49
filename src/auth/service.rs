use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::{
    dto::{ExternalProfile, LoginRequest, PublicUser, SignupRequest},
    jwt::{SessionClaims, TokenService},
    password,
};
use crate::{
    error::{AuthError, AuthFailure},
    users::{AccountLink, DirectoryError, NewUser, User, UserDirectory},
};

/// Lookups are idempotent and get one retry on a transient failure.
/// Writes are never retried.
const LOOKUP_ATTEMPTS: u32 = 2;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trimmed value, or `None` when absent or blank.
fn present(field: Option<String>) -> Option<String> {
    field
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A freshly issued token together with the user it was issued for.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub user: PublicUser,
}

/// Signup, login, OAuth linking and session lookup over an injected
/// [`UserDirectory`].
pub struct AuthService {
    directory: Arc<dyn UserDirectory>,
    tokens: TokenService,
    directory_timeout: Duration,
}

impl AuthService {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        tokens: TokenService,
        directory_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            tokens,
            directory_timeout,
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, DirectoryError>>,
    ) -> Result<T, DirectoryError> {
        tokio::time::timeout(self.directory_timeout, call)
            .await
            .unwrap_or(Err(DirectoryError::Timeout))
    }

    async fn lookup<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, DirectoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let mut attempt = 1;
        loop {
            match self.timed(call()).await {
                Err(e) if e.is_transient() && attempt < LOOKUP_ATTEMPTS => {
                    warn!(op, attempt, error = %e, "directory lookup failed, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError> {
        self.lookup("find_by_email", || self.directory.find_by_email(email))
            .await
    }

    fn open_session(&self, user: User) -> Result<Session, AuthError> {
        let token = self
            .tokens
            .issue(user.id, &user.email)
            .context("issue session token")?;
        Ok(Session {
            token,
            user: user.into(),
        })
    }

    #[instrument(skip_all)]
    pub async fn signup(&self, req: SignupRequest) -> Result<Session, AuthError> {
        let (Some(name), Some(email), Some(plain)) = (
            present(req.name),
            present(req.email),
            req.password.filter(|p| !p.is_empty()),
        ) else {
            warn!("signup with missing fields");
            return Err(AuthError::validation("Name, email and password are required"));
        };

        let email = normalize_email(&email);
        if !is_valid_email(&email) {
            warn!(email = %email, "invalid email");
            return Err(AuthError::validation("Invalid email format"));
        }

        if self.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AuthError::Conflict("Email already exists".into()));
        }

        let password_hash = password::hash_password_blocking(plain).await?;

        // a concurrent signup may win between the check above and this insert;
        // the directory reports it as EmailTaken, which surfaces as a conflict
        let user = self
            .timed(self.directory.create(NewUser {
                name,
                email,
                password_hash: Some(password_hash),
                google_id: None,
                avatar: None,
            }))
            .await?;

        info!(user_id = %user.id, email = %user.email, "user signed up");
        self.open_session(user)
    }

    #[instrument(skip_all)]
    pub async fn login(&self, req: LoginRequest) -> Result<Session, AuthError> {
        let (Some(email), Some(plain)) = (present(req.email), req.password.filter(|p| !p.is_empty()))
        else {
            warn!("login with missing fields");
            return Err(AuthError::validation("Email and password are required"));
        };
        let email = normalize_email(&email);

        let Some(user) = self.find_by_email(&email).await? else {
            warn!(email = %email, "login unknown email");
            // same hashing cost as a wrong password
            password::verify_password_blocking(plain, password::PLACEHOLDER_HASH.to_string())
                .await?;
            return Err(AuthFailure::InvalidCredentials.into());
        };

        if !user.has_password() {
            warn!(user_id = %user.id, "password login on social-only account");
            return Err(AuthFailure::SocialLoginOnly.into());
        }
        let hash = user.password_hash.clone().unwrap_or_default();

        if !password::verify_password_blocking(plain, hash).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthFailure::InvalidCredentials.into());
        }

        info!(user_id = %user.id, email = %user.email, "user logged in");
        self.open_session(user)
    }

    /// Create the account on first sight of `profile`, otherwise link the
    /// external identity to the existing account without overwriting it.
    #[instrument(skip_all, fields(provider_id = %profile.provider_id))]
    pub async fn oauth_callback(&self, profile: ExternalProfile) -> Result<Session, AuthError> {
        let email = normalize_email(&profile.email);
        let provider_id = profile.provider_id.trim().to_string();
        if provider_id.is_empty() || !is_valid_email(&email) {
            warn!(email = %email, "incomplete oauth profile");
            return Err(AuthError::validation("OAuth profile is incomplete"));
        }
        let picture = present(profile.picture);
        let link = AccountLink {
            google_id: Some(provider_id),
            avatar: picture.clone(),
        };

        let user = match self.find_by_email(&email).await? {
            Some(existing) => {
                let user = self
                    .timed(self.directory.update_by_email(&existing.email, link))
                    .await?;
                info!(user_id = %user.id, "oauth identity linked");
                user
            }
            None => {
                let name = present(profile.name)
                    .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
                let created = self
                    .timed(self.directory.create(NewUser {
                        name,
                        email: email.clone(),
                        password_hash: None,
                        google_id: link.google_id.clone(),
                        avatar: picture,
                    }))
                    .await;
                match created {
                    Ok(user) => {
                        info!(user_id = %user.id, "account created from oauth profile");
                        user
                    }
                    Err(DirectoryError::EmailTaken) => {
                        warn!(email = %email, "oauth create lost a race, linking instead");
                        self.timed(self.directory.update_by_email(&email, link))
                            .await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.open_session(user)
    }

    /// Claims carried by the session token, if it is present and valid.
    pub fn authenticate(&self, token: Option<&str>) -> Result<SessionClaims, AuthError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthFailure::NotAuthenticated)?;
        self.tokens.verify(token).map_err(|e| {
            warn!(expired = e.is_expired(), error = %e, "session token rejected");
            AuthError::from(AuthFailure::InvalidToken)
        })
    }

    /// The account behind an authenticated session.
    pub async fn user_for_session(&self, claims: &SessionClaims) -> Result<PublicUser, AuthError> {
        let user_id = claims.user_id;
        let user = self
            .lookup("find_by_id", || self.directory.find_by_id(user_id))
            .await?;
        match user {
            Some(user) => Ok(user.into()),
            None => {
                warn!(user_id = %user_id, "session for missing user");
                Err(AuthFailure::UserNotFound.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;
    use crate::users::InMemoryUserDirectory;

    fn service_with(directory: Arc<dyn UserDirectory>) -> AuthService {
        AuthService::new(
            directory,
            TokenService::new(b"test-secret"),
            Duration::from_millis(200),
        )
    }

    fn service() -> (AuthService, Arc<InMemoryUserDirectory>) {
        let dir = Arc::new(InMemoryUserDirectory::new());
        (service_with(dir.clone()), dir)
    }

    fn signup_req(name: &str, email: &str, password: &str) -> SignupRequest {
        SignupRequest {
            name: Some(name.into()),
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    fn profile(id: &str, email: &str, picture: Option<&str>) -> ExternalProfile {
        ExternalProfile {
            provider_id: id.into(),
            email: email.into(),
            name: Some("Ada G".into()),
            picture: picture.map(Into::into),
        }
    }

    #[tokio::test]
    async fn signup_issues_a_token_for_the_new_user() {
        let (svc, _) = service();
        let session = svc
            .signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();
        assert_eq!(session.user.email, "ada@example.com");
        assert_eq!(session.user.name, "Ada");
        assert!(session.user.avatar.is_none());
        let claims = svc.authenticate(Some(&session.token)).unwrap();
        assert_eq!(claims.user_id, session.user.id);
        assert_eq!(claims.email, "ada@example.com");
    }

    #[tokio::test]
    async fn distinct_signups_get_distinct_ids() {
        let (svc, dir) = service();
        let mut ids = std::collections::HashSet::new();
        for i in 0..4 {
            let s = svc
                .signup(signup_req("U", &format!("user{i}@example.com"), "pw"))
                .await
                .unwrap();
            ids.insert(s.user.id);
        }
        assert_eq!(ids.len(), 4);
        assert_eq!(dir.len().await, 4);
    }

    #[tokio::test]
    async fn signup_requires_every_field() {
        let (svc, _) = service();
        for req in [
            SignupRequest::default(),
            signup_req("", "ada@example.com", "pw"),
            signup_req("Ada", "  ", "pw"),
            signup_req("Ada", "ada@example.com", ""),
        ] {
            let err = svc.signup(req).await.unwrap_err();
            assert!(matches!(err, AuthError::Validation(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn signup_rejects_malformed_email() {
        let (svc, _) = service();
        for email in ["ada", "ada@example", "ada @example.com", "@example.com"] {
            let err = svc.signup(signup_req("Ada", email, "pw")).await.unwrap_err();
            assert_eq!(err.client_message(), "Invalid email format");
        }
    }

    #[tokio::test]
    async fn duplicate_signup_is_a_conflict() {
        let (svc, dir) = service();
        svc.signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();
        let err = svc
            .signup(signup_req("Ada 2", "ADA@example.com", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn login_normalizes_email() {
        let (svc, _) = service();
        svc.signup(signup_req("Ada", " Ada@Example.com", "secret123"))
            .await
            .unwrap();
        let session = svc
            .login(login_req("ada@example.COM", "secret123"))
            .await
            .unwrap();
        assert_eq!(session.user.email, "ada@example.com");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let (svc, _) = service();
        svc.signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();
        let wrong = svc
            .login(login_req("ada@example.com", "wrongpass"))
            .await
            .unwrap_err();
        let unknown = svc
            .login(login_req("nobody@example.com", "secret123"))
            .await
            .unwrap_err();
        assert!(matches!(
            wrong,
            AuthError::Authentication(AuthFailure::InvalidCredentials)
        ));
        assert!(matches!(
            unknown,
            AuthError::Authentication(AuthFailure::InvalidCredentials)
        ));
        assert_eq!(wrong.client_message(), "Invalid credentials");
        assert_eq!(wrong.client_message(), unknown.client_message());
        assert_eq!(wrong.status_code(), unknown.status_code());
    }

    #[tokio::test]
    async fn login_requires_email_and_password() {
        let (svc, _) = service();
        let err = svc.login(LoginRequest::default()).await.unwrap_err();
        assert_eq!(err.client_message(), "Email and password are required");
    }

    #[tokio::test]
    async fn oauth_only_account_is_told_to_use_social_login() {
        let (svc, _) = service();
        svc.oauth_callback(profile("g-1", "ada@example.com", None))
            .await
            .unwrap();
        let err = svc
            .login(login_req("ada@example.com", "anything"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Authentication(AuthFailure::SocialLoginOnly)
        ));
        assert_ne!(err.client_message(), "Invalid credentials");
    }

    #[tokio::test]
    async fn repeated_oauth_callback_updates_the_same_user() {
        let (svc, dir) = service();
        let first = svc
            .oauth_callback(profile("g-1", "ada@example.com", Some("https://img/first.png")))
            .await
            .unwrap();
        let second = svc
            .oauth_callback(profile("g-1", "ada@example.com", Some("https://img/second.png")))
            .await
            .unwrap();
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(second.user.avatar.as_deref(), Some("https://img/first.png"));
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn oauth_links_existing_password_account() {
        let (svc, dir) = service();
        let signed_up = svc
            .signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();
        let linked = svc
            .oauth_callback(profile("g-7", "ada@example.com", Some("https://img/a.png")))
            .await
            .unwrap();
        assert_eq!(linked.user.id, signed_up.user.id);
        assert_eq!(linked.user.name, "Ada");
        assert_eq!(linked.user.avatar.as_deref(), Some("https://img/a.png"));

        let stored = dir.find_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(stored.google_id.as_deref(), Some("g-7"));
        // still dual-authenticated
        svc.login(login_req("ada@example.com", "secret123"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn oauth_keeps_a_previously_linked_external_id() {
        let (svc, dir) = service();
        svc.oauth_callback(profile("g-1", "ada@example.com", None))
            .await
            .unwrap();
        svc.oauth_callback(profile("g-2", "ada@example.com", None))
            .await
            .unwrap();
        let stored = dir.find_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(stored.google_id.as_deref(), Some("g-1"));
    }

    #[tokio::test]
    async fn oauth_with_changed_email_creates_a_new_account() {
        let (svc, dir) = service();
        let old = svc
            .oauth_callback(profile("g-1", "old@example.com", None))
            .await
            .unwrap();
        let new = svc
            .oauth_callback(profile("g-1", "new@example.com", None))
            .await
            .unwrap();
        assert_ne!(old.user.id, new.user.id);
        assert_eq!(new.user.email, "new@example.com");
        assert_eq!(dir.len().await, 2);
    }

    #[tokio::test]
    async fn oauth_name_falls_back_to_email_local_part() {
        let (svc, _) = service();
        let mut p = profile("g-1", "grace@example.com", None);
        p.name = None;
        let session = svc.oauth_callback(p).await.unwrap();
        assert_eq!(session.user.name, "grace");
    }

    #[tokio::test]
    async fn oauth_rejects_incomplete_profile() {
        let (svc, _) = service();
        let err = svc
            .oauth_callback(profile("", "ada@example.com", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn session_failures_are_distinct_but_all_unauthorized() {
        let (svc, dir) = service();
        let session = svc
            .signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();

        let missing = svc.authenticate(None).unwrap_err();
        let tampered = svc
            .authenticate(Some(&format!("{}x", session.token)))
            .unwrap_err();

        dir.remove("ada@example.com").await;
        let claims = svc.authenticate(Some(&session.token)).unwrap();
        let deleted = svc.user_for_session(&claims).await.unwrap_err();

        assert!(matches!(
            missing,
            AuthError::Authentication(AuthFailure::NotAuthenticated)
        ));
        assert!(matches!(
            tampered,
            AuthError::Authentication(AuthFailure::InvalidToken)
        ));
        assert!(matches!(
            deleted,
            AuthError::Authentication(AuthFailure::UserNotFound)
        ));
        for err in [&missing, &tampered, &deleted] {
            assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn session_lookup_returns_public_fields() {
        let (svc, _) = service();
        let session = svc
            .signup(signup_req("Ada", "ada@example.com", "secret123"))
            .await
            .unwrap();
        let claims = svc.authenticate(Some(&session.token)).unwrap();
        let me = svc.user_for_session(&claims).await.unwrap();
        assert_eq!(me, session.user);
    }

    /// Never sees an existing user on lookup, as if a concurrent writer raced it.
    struct RacingDirectory(InMemoryUserDirectory);

    #[async_trait]
    impl UserDirectory for RacingDirectory {
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, DirectoryError> {
            Ok(None)
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, DirectoryError> {
            self.0.find_by_id(id).await
        }
        async fn create(&self, user: NewUser) -> Result<User, DirectoryError> {
            self.0.create(user).await
        }
        async fn update_by_email(
            &self,
            email: &str,
            link: AccountLink,
        ) -> Result<User, DirectoryError> {
            self.0.update_by_email(email, link).await
        }
    }

    #[tokio::test]
    async fn signup_race_surfaces_as_conflict() {
        let svc = service_with(Arc::new(RacingDirectory(InMemoryUserDirectory::new())));
        svc.signup(signup_req("Ada", "ada@example.com", "pw"))
            .await
            .unwrap();
        let err = svc
            .signup(signup_req("Ada", "ada@example.com", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn oauth_race_falls_back_to_linking() {
        let svc = service_with(Arc::new(RacingDirectory(InMemoryUserDirectory::new())));
        let first = svc
            .oauth_callback(profile("g-1", "ada@example.com", Some("a.png")))
            .await
            .unwrap();
        let second = svc
            .oauth_callback(profile("g-1", "ada@example.com", Some("b.png")))
            .await
            .unwrap();
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(second.user.avatar.as_deref(), Some("a.png"));
    }

    /// Fails the first `failures` lookups, then serves a fixed user.
    struct FlakyDirectory {
        failures: usize,
        calls: AtomicUsize,
        user: User,
    }

    #[async_trait]
    impl UserDirectory for FlakyDirectory {
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, DirectoryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow::anyhow!("connection reset").into());
            }
            Ok(Some(self.user.clone()))
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<User>, DirectoryError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Some(self.user.clone()))
        }
        async fn create(&self, _user: NewUser) -> Result<User, DirectoryError> {
            unreachable!("create is not exercised")
        }
        async fn update_by_email(
            &self,
            _email: &str,
            _link: AccountLink,
        ) -> Result<User, DirectoryError> {
            unreachable!("update is not exercised")
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyDirectory> {
        Arc::new(FlakyDirectory {
            failures,
            calls: AtomicUsize::new(0),
            user: User {
                id: Uuid::new_v4(),
                name: "Ada".into(),
                email: "ada@example.com".into(),
                password_hash: Some(password::hash_password("secret123").unwrap()),
                google_id: None,
                avatar: None,
                created_at: OffsetDateTime::now_utc(),
            },
        })
    }

    #[tokio::test]
    async fn transient_lookup_failure_is_retried_once() {
        let dir = flaky(1);
        let svc = service_with(dir.clone());
        svc.login(login_req("ada@example.com", "secret123"))
            .await
            .unwrap();
        assert_eq!(dir.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_lookup_failure_is_internal() {
        let dir = flaky(5);
        let svc = service_with(dir.clone());
        let err = svc
            .login(login_req("ada@example.com", "secret123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
        assert_eq!(dir.calls.load(Ordering::SeqCst), LOOKUP_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn slow_directory_times_out() {
        let dir = flaky(0);
        let svc = service_with(dir.clone());
        let claims = SessionClaims {
            user_id: dir.user.id,
            email: dir.user.email.clone(),
            iat: 0,
            exp: 0,
        };
        let err = svc.user_for_session(&claims).await.unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
    }
}
