//! REST handshake that obtains a session id

use crate::identity::UserProfile;
use crate::{BriefError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Response body of `POST /api/session/create`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Backend endpoint that creates conversation sessions
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, user: &UserProfile, token: Option<&str>)
        -> Result<SessionInfo>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// [`SessionApi`] over HTTP
#[derive(Clone, Debug)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BriefError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(
        &self,
        user: &UserProfile,
        token: Option<&str>,
    ) -> Result<SessionInfo> {
        let url = format!("{}/api/session/create", self.base_url);
        debug!("Creating session for user {} at {}", user.id, url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-user-id", &user.id)
            .body("{}");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BriefError::HandshakeError(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BriefError::AuthenticationError(format!(
                "Session request rejected with status {}",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| "Failed to create session".to_string());
            return Err(BriefError::HandshakeError(message));
        }

        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| BriefError::HandshakeError(format!("Invalid session response: {}", e)))?;

        if info.session_id.is_empty() {
            return Err(BriefError::HandshakeError(
                "Session response has no session id".into(),
            ));
        }

        info!("Session created: {}", info.session_id);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserProfile {
        UserProfile::new("u1", "a@b.c")
    }

    #[tokio::test]
    async fn test_create_session_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/session/create")
            .match_header("x-user-id", "u1")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sessionId":"s1","agentId":"a1"}"#)
            .create_async()
            .await;

        let api = HttpSessionApi::new(server.url()).unwrap();
        let info = api.create_session(&user(), Some("tok")).await.unwrap();

        assert_eq!(info.session_id, "s1");
        assert_eq!(info.agent_id.as_deref(), Some("a1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_session_error_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/session/create")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"Inbox unavailable"}"#)
            .create_async()
            .await;

        let api = HttpSessionApi::new(server.url()).unwrap();
        let result = api.create_session(&user(), None).await;
        assert_eq!(
            result,
            Err(BriefError::HandshakeError("Inbox unavailable".into()))
        );
    }

    #[tokio::test]
    async fn test_create_session_error_without_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/session/create")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let api = HttpSessionApi::new(server.url()).unwrap();
        let result = api.create_session(&user(), None).await;
        assert_eq!(
            result,
            Err(BriefError::HandshakeError("Failed to create session".into()))
        );
    }

    #[tokio::test]
    async fn test_create_session_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/session/create")
            .with_status(401)
            .create_async()
            .await;

        let api = HttpSessionApi::new(server.url()).unwrap();
        let result = api.create_session(&user(), Some("expired")).await;
        assert!(matches!(result, Err(BriefError::AuthenticationError(_))));
    }

    #[tokio::test]
    async fn test_create_session_missing_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/session/create")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sessionId":""}"#)
            .create_async()
            .await;

        let api = HttpSessionApi::new(server.url()).unwrap();
        let result = api.create_session(&user(), None).await;
        assert!(matches!(result, Err(BriefError::HandshakeError(_))));
    }
}
