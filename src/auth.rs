//! Supabase (GoTrue) sessions.
//!
//! Admins sign in with a password grant and present their access token on admin routes.
//! A save checks that the presenting admin's own session outlives the upload, refreshing
//! it with the refresh token the client sent alongside when it is about to expire.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no active session")]
    NoSession,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session refresh failed: {0}")]
    RefreshFailed(String),
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_email: Option<String>,
}

impl Session {
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - margin <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_session(&self) -> Option<Session>;

    async fn refresh_session(&self) -> Result<Session, AuthError>;
}

/// Returns a session that is valid for at least `margin`, refreshing once if needed.
pub async fn ensure_fresh_session(
    provider: &dyn SessionProvider,
    margin: Duration,
) -> Result<Session, AuthError> {
    let session = provider.current_session().await.ok_or(AuthError::NoSession)?;
    if !session.expires_within(margin, Utc::now()) {
        return Ok(session);
    }

    info!(expires_at = %session.expires_at, "Session close to expiry, refreshing");
    match provider.refresh_session().await {
        Ok(fresh) if !fresh.expires_within(margin, Utc::now()) => Ok(fresh),
        Ok(fresh) => Err(AuthError::RefreshFailed(format!(
            "refreshed session already expires at {}",
            fresh.expires_at
        ))),
        Err(err) => {
            warn!(error = %err, "Session refresh failed");
            Err(match err {
                AuthError::RefreshFailed(_) => err,
                other => AuthError::RefreshFailed(other.to_string()),
            })
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Option<UserResponse>,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(|| now + Duration::seconds(self.expires_in.unwrap_or(3600)));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_email: self.user.and_then(|u| u.email),
        }
    }
}

/// Reads the `exp` claim of a JWT access token. The signature is not checked here;
/// GoTrue already accepted the token.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&raw).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}

/// Stateless GoTrue REST client.
pub struct SupabaseAuth {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseAuth {
    pub fn new(http: reqwest::Client, supabase_url: &str, anon_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("{}/auth/v1", supabase_url.trim_end_matches('/')),
            anon_key: anon_key.into(),
        }
    }

    /// Password grant.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let resp = self
            .http
            .post(format!("{}/token?grant_type=password", self.base_url))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        match resp.status().as_u16() {
            200 => {}
            400 | 401 | 422 => return Err(AuthError::InvalidCredentials),
            status => return Err(AuthError::Unavailable(format!("status {status}"))),
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(body.into_session(Utc::now()))
    }

    /// Resolves an access token to its user, or `InvalidCredentials`.
    pub async fn verify_access_token(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let resp = self
            .http
            .get(format!("{}/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        match resp.status().as_u16() {
            200 => {}
            401 | 403 => return Err(AuthError::InvalidCredentials),
            status => return Err(AuthError::Unavailable(format!("status {status}"))),
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(AuthenticatedUser {
            id: user.id,
            email: user.email,
        })
    }

    pub async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .http
            .post(format!("{}/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if resp.status().is_success() || resp.status().as_u16() == 401 {
            Ok(())
        } else {
            Err(AuthError::Unavailable(format!("status {}", resp.status())))
        }
    }

    /// Refresh-token grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let resp = self
            .http
            .post(format!("{}/token?grant_type=refresh_token", self.base_url))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AuthError::RefreshFailed(format!("status {}", resp.status())));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
        Ok(body.into_session(Utc::now()))
    }
}

/// The session of the admin behind one request.
pub struct RequestSession {
    auth: Arc<SupabaseAuth>,
    session: RwLock<Session>,
    refreshed: RwLock<bool>,
}

impl RequestSession {
    /// An empty `refresh_token` means the client sent none; such a session cannot be
    /// refreshed.
    pub fn new(auth: Arc<SupabaseAuth>, session: Session) -> Self {
        Self {
            auth,
            session: RwLock::new(session),
            refreshed: RwLock::new(false),
        }
    }

    /// The replacement session, if a refresh happened while serving the request.
    pub async fn refreshed(&self) -> Option<Session> {
        if *self.refreshed.read().await {
            Some(self.session.read().await.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl SessionProvider for RequestSession {
    async fn current_session(&self) -> Option<Session> {
        Some(self.session.read().await.clone())
    }

    async fn refresh_session(&self) -> Result<Session, AuthError> {
        let refresh_token = self.session.read().await.refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(AuthError::RefreshFailed("no refresh token presented".into()));
        }

        let mut session = self.auth.refresh(&refresh_token).await?;
        if session.user_email.is_none() {
            session.user_email = self.session.read().await.user_email.clone();
        }
        *self.session.write().await = session.clone();
        *self.refreshed.write().await = true;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticSessions;

    fn session_expiring_in(secs: i64) -> Session {
        Session {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::seconds(secs),
            user_email: Some("admin@example.com".into()),
        }
    }

    #[tokio::test]
    async fn fresh_session_is_used_as_is() {
        let provider = StaticSessions::new(Some(session_expiring_in(3600)));
        let session = ensure_fresh_session(&provider, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(session.access_token, "access");
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn session_inside_margin_is_refreshed() {
        let provider = StaticSessions::new(Some(session_expiring_in(30)))
            .refreshing_to(session_expiring_in(3600));
        ensure_fresh_session(&provider, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_is_an_auth_error() {
        let provider = StaticSessions::new(Some(session_expiring_in(10)));
        let err = ensure_fresh_session(&provider, Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn missing_session_is_reported() {
        let provider = StaticSessions::new(None);
        let err = ensure_fresh_session(&provider, Duration::seconds(60))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NoSession);
    }

    #[test]
    fn token_response_prefers_absolute_expiry() {
        let now = Utc::now();
        let body = TokenResponse {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: Some(3600),
            expires_at: Some(1_900_000_000),
            user: None,
        };
        let session = body.into_session(now);
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);

        let body = TokenResponse {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: Some(120),
            expires_at: None,
            user: Some(UserResponse {
                id: "u".into(),
                email: Some("a@b.c".into()),
            }),
        };
        let session = body.into_session(now);
        assert_eq!(session.expires_at, now + Duration::seconds(120));
        assert_eq!(session.user_email.as_deref(), Some("a@b.c"));
    }

    fn jwt_with(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn expiry_is_read_from_the_access_token() {
        let token = jwt_with(r#"{"sub":"admin-1","exp":1900000000,"role":"authenticated"}"#);
        assert_eq!(token_expiry(&token).map(|t| t.timestamp()), Some(1_900_000_000));

        assert_eq!(token_expiry("not-a-jwt"), None);
        assert_eq!(token_expiry(&jwt_with(r#"{"sub":"admin-1"}"#)), None);
    }

    fn offline_auth() -> Arc<SupabaseAuth> {
        Arc::new(SupabaseAuth::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "anon",
        ))
    }

    #[tokio::test]
    async fn admin_session_without_refresh_token_cannot_be_renewed() {
        let mut session = session_expiring_in(10);
        session.refresh_token = String::new();
        let request = RequestSession::new(offline_auth(), session);

        let err = ensure_fresh_session(&request, Duration::seconds(60))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(request.refreshed().await, None);
    }

    #[tokio::test]
    async fn fresh_admin_session_is_used_without_contacting_gotrue() {
        let request = RequestSession::new(offline_auth(), session_expiring_in(3600));

        let session = ensure_fresh_session(&request, Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(session.access_token, "access");
        assert_eq!(request.refreshed().await, None);
    }
}
