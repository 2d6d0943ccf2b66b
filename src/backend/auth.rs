//! Password authentication against the hosted auth service.
//!
//! Validation failures are reported before any request is sent. Credential
//! failures collapse into `SyncError::InvalidCredentials`; the backend's own
//! message is only logged.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use super::client::RestClient;
use crate::error::{Result, SyncError};

pub const MIN_PASSWORD_LEN: usize = 6;

/// Dashboard role, read from the user's metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  Agent,
  #[default]
  Owner,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserMetadata {
  #[serde(default)]
  role: Option<Role>,
  #[serde(default)]
  name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUser {
  id: String,
  #[serde(default)]
  email: Option<String>,
  #[serde(default)]
  user_metadata: UserMetadata,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiSession {
  access_token: String,
  #[serde(default)]
  refresh_token: Option<String>,
  #[serde(default)]
  expires_in: Option<u64>,
  user: ApiUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub email: String,
  pub name: Option<String>,
  pub role: Role,
}

impl User {
  pub fn is_admin(&self) -> bool {
    self.role == Role::Admin
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub expires_in: Option<u64>,
  pub user: User,
}

impl From<ApiSession> for Session {
  fn from(s: ApiSession) -> Self {
    Session {
      access_token: s.access_token,
      refresh_token: s.refresh_token,
      expires_in: s.expires_in,
      user: User {
        id: s.user.id,
        email: s.user.email.unwrap_or_default(),
        name: s.user.user_metadata.name,
        role: s.user.user_metadata.role.unwrap_or_default(),
      },
    }
  }
}

/// Checks applied before a sign-in request.
pub fn validate_login(email: &str, password: &str) -> Result<()> {
  if !email.contains('@') || email.trim().len() < 3 {
    return Err(SyncError::Validation("a valid email is required".into()));
  }
  if password.is_empty() {
    return Err(SyncError::Validation("password is required".into()));
  }
  Ok(())
}

/// Checks applied before a sign-up request.
pub fn validate_signup(email: &str, password: &str, confirm: &str) -> Result<()> {
  validate_login(email, password)?;
  if password.len() < MIN_PASSWORD_LEN {
    return Err(SyncError::Validation(format!(
      "password must be at least {} characters",
      MIN_PASSWORD_LEN
    )));
  }
  if password != confirm {
    return Err(SyncError::Validation("passwords do not match".into()));
  }
  Ok(())
}

/// Auth client holding the current session.
///
/// Session changes are published on a watch channel; signing in also points
/// the shared `RestClient` at the user's token.
#[derive(Clone)]
pub struct AuthClient {
  rest: RestClient,
  session: watch::Sender<Option<Session>>,
}

impl AuthClient {
  pub fn new(rest: RestClient) -> Self {
    let (session, _) = watch::channel(None);
    Self { rest, session }
  }

  /// Receive the current session and every change to it.
  pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
    self.session.subscribe()
  }

  pub fn current_session(&self) -> Option<Session> {
    self.session.borrow().clone()
  }

  fn set_session(&self, session: Option<Session>) {
    self
      .rest
      .set_access_token(session.as_ref().map(|s| s.access_token.clone()));
    self.session.send_replace(session);
  }

  pub async fn login(&self, email: &str, password: &str) -> Result<User> {
    validate_login(email, password)?;

    let mut url = self
      .rest
      .base_url()
      .join("auth/v1/token")
      .map_err(|e| SyncError::Config(e.to_string()))?;
    url.query_pairs_mut().append_pair("grant_type", "password");

    let response = self
      .rest
      .http()
      .post(url)
      .header("apikey", self.rest.api_key())
      .json(&json!({ "email": email, "password": password }))
      .send()
      .await
      .map_err(|e| {
        warn!(error = %e, "Sign-in request failed");
        SyncError::from(e)
      })?;

    let status = response.status();
    if status.is_client_error() {
      let body = response.text().await.unwrap_or_default();
      warn!(status = status.as_u16(), body = %body, "Sign-in rejected");
      return Err(SyncError::InvalidCredentials);
    }
    if !status.is_success() {
      warn!(status = status.as_u16(), "Sign-in service unavailable");
      return Err(SyncError::Backend {
        status: status.as_u16(),
        message: "sign-in service unavailable".into(),
      });
    }

    let session: Session = response
      .json::<ApiSession>()
      .await
      .map_err(|e| {
        warn!(error = %e, "Unreadable sign-in response");
        SyncError::InvalidCredentials
      })?
      .into();

    let user = session.user.clone();
    info!(user = %user.email, role = ?user.role, "Signed in");
    self.set_session(Some(session));
    Ok(user)
  }

  pub async fn signup(&self, email: &str, password: &str, confirm: &str) -> Result<User> {
    validate_signup(email, password, confirm)?;

    let url = self
      .rest
      .base_url()
      .join("auth/v1/signup")
      .map_err(|e| SyncError::Config(e.to_string()))?;

    let response = self
      .rest
      .http()
      .post(url)
      .header("apikey", self.rest.api_key())
      .json(&json!({ "email": email, "password": password }))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      warn!(status, body = %body, "Sign-up rejected");
      return Err(SyncError::Backend {
        status,
        message: "sign-up was rejected".into(),
      });
    }

    let body: serde_json::Value = response.json().await?;
    // With email confirmation enabled the service returns a bare user, no session.
    if body.get("access_token").is_some() {
      let session: Session = serde_json::from_value::<ApiSession>(body)?.into();
      let user = session.user.clone();
      self.set_session(Some(session));
      Ok(user)
    } else {
      let user = serde_json::from_value::<ApiUser>(body)?;
      Ok(User {
        id: user.id,
        email: user.email.unwrap_or_default(),
        name: user.user_metadata.name,
        role: user.user_metadata.role.unwrap_or_default(),
      })
    }
  }

  pub async fn logout(&self) -> Result<()> {
    let Some(session) = self.current_session() else {
      return Ok(());
    };

    let url = self
      .rest
      .base_url()
      .join("auth/v1/logout")
      .map_err(|e| SyncError::Config(e.to_string()))?;

    let result = self
      .rest
      .http()
      .post(url)
      .header("apikey", self.rest.api_key())
      .bearer_auth(&session.access_token)
      .send()
      .await;

    // The local session is dropped even if the server call fails.
    self.set_session(None);
    if let Err(e) = result {
      warn!(error = %e, "Sign-out request failed");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_signup_rejects_mismatched_passwords() {
    assert_eq!(
      validate_signup("ana@example.com", "secreto1", "secreto2"),
      Err(SyncError::Validation("passwords do not match".into()))
    );
  }

  #[test]
  fn test_signup_rejects_short_passwords() {
    assert!(matches!(
      validate_signup("ana@example.com", "abc", "abc"),
      Err(SyncError::Validation(_))
    ));
  }

  #[test]
  fn test_login_requires_email() {
    assert!(validate_login("ana", "secreto1").is_err());
    assert!(validate_login("ana@example.com", "").is_err());
    assert!(validate_login("ana@example.com", "secreto1").is_ok());
  }

  #[test]
  fn test_session_maps_role_from_metadata() {
    let raw = serde_json::json!({
      "access_token": "tok",
      "refresh_token": "ref",
      "expires_in": 3600,
      "user": {
        "id": "u1",
        "email": "admin@example.com",
        "user_metadata": {"role": "admin", "name": "Admin"}
      }
    });
    let session: Session = serde_json::from_value::<ApiSession>(raw).unwrap().into();
    assert!(session.user.is_admin());
    assert_eq!(session.user.name.as_deref(), Some("Admin"));
  }

  #[test]
  fn test_role_defaults_to_owner() {
    let raw = serde_json::json!({
      "access_token": "tok",
      "user": {"id": "u2", "email": "x@example.com"}
    });
    let session: Session = serde_json::from_value::<ApiSession>(raw).unwrap().into();
    assert_eq!(session.user.role, Role::Owner);
  }

  #[tokio::test]
  async fn test_validation_fails_before_network_and_session_stays_empty() {
    // Unroutable base url: any request would fail, validation must come first
    let rest = RestClient::new("http://127.0.0.1:9/", "anon".into()).unwrap();
    let auth = AuthClient::new(rest);
    let sessions = auth.subscribe();

    let err = auth.signup("ana@example.com", "secreto1", "otro").await;
    assert_eq!(err, Err(SyncError::Validation("passwords do not match".into())));
    assert!(auth.current_session().is_none());
    assert!(!sessions.has_changed().unwrap());
  }

  #[tokio::test]
  async fn test_unreachable_auth_is_a_network_error() {
    let rest = RestClient::new("http://127.0.0.1:9/", "anon".into()).unwrap();
    let auth = AuthClient::new(rest);

    let err = auth.login("ana@example.com", "secreto1").await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)), "got {:?}", err);
    assert!(err.is_transient());
    assert!(auth.current_session().is_none());
  }
}
