use chat_core::{ChatError, ErrorCategory, Session, UserIdentity, classify_http_status};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{RemoteConfig, service_error_message};

const LOGIN_PATH: &str = "api/auth/local";
const REGISTER_PATH: &str = "api/auth/local/register";

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    jwt: Option<String>,
    user: Option<UserIdentity>,
}

/// Exchanges credentials for a [`Session`].
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    config: RemoteConfig,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, config: RemoteConfig) -> Self {
        Self { http, config }
    }

    /// Log in with an email or username plus password.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<Session, ChatError> {
        let session = self
            .post(LOGIN_PATH, &LoginRequest { identifier, password }, "login failed")
            .await?;
        info!(user_id = %session.user.id, "logged in");
        Ok(session)
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, ChatError> {
        let request = RegisterRequest {
            username,
            email,
            password,
        };
        let session = self
            .post(REGISTER_PATH, &request, "registration failed")
            .await?;
        info!(user_id = %session.user.id, "registered");
        Ok(session)
    }

    async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        fallback_message: &str,
    ) -> Result<Session, ChatError> {
        let url = self.config.endpoint(path)?;
        debug!(url = %url, "sending auth request");

        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                ChatError::new(ErrorCategory::Network, "auth_request_failed", err.to_string())
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            ChatError::new(ErrorCategory::Network, "auth_request_failed", err.to_string())
        })?;

        if !status.is_success() {
            return Err(ChatError::new(
                classify_http_status(status.as_u16()),
                "auth_rejected",
                service_error_message(&text).unwrap_or_else(|| fallback_message.to_owned()),
            ));
        }

        parse_auth_response(&text)
    }
}

fn parse_auth_response(body: &str) -> Result<Session, ChatError> {
    let invalid = || {
        ChatError::new(
            ErrorCategory::Protocol,
            "invalid_auth_response",
            "invalid response from server",
        )
    };

    let response: AuthResponse = serde_json::from_str(body).map_err(|_| invalid())?;
    match (response.jwt, response.user) {
        (Some(jwt), Some(user)) if !jwt.trim().is_empty() => Ok(Session::new(jwt, user)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use chat_core::UserId;

    use super::*;
    use crate::test_support::serve_http_once;

    #[test]
    fn parses_jwt_and_user() {
        let session = parse_auth_response(
            r#"{"jwt":"jwt-9","user":{"id":9,"username":"zoe","email":"z@example.org","confirmed":true}}"#,
        )
        .expect("valid auth response");
        assert_eq!(session.token, "jwt-9");
        assert_eq!(session.user.id, UserId::new("9"));
        assert_eq!(session.user.username, "zoe");
    }

    #[test]
    fn missing_jwt_or_user_is_invalid() {
        for body in [r#"{"user":{"id":1,"username":"a"}}"#, r#"{"jwt":"x"}"#, r#"{"jwt":"","user":{"id":1,"username":"a"}}"#, "[]"] {
            let err = parse_auth_response(body).expect_err("incomplete response must fail");
            assert_eq!(err.code, "invalid_auth_response");
        }
    }

    #[tokio::test]
    async fn login_posts_identifier_and_password() {
        let (base, server) =
            serve_http_once(200, r#"{"jwt":"jwt-1","user":{"id":1,"username":"alice"}}"#).await;
        let client = AuthClient::new(
            reqwest::Client::new(),
            RemoteConfig::parse(&base).expect("loopback url"),
        );

        let session = client
            .login("alice@example.org", "hunter2")
            .await
            .expect("login succeeds");
        assert_eq!(session.user.username, "alice");

        let request = server.await.expect("server task");
        assert!(request.starts_with("POST /api/auth/local HTTP/1.1"));
        assert!(request.contains(r#""identifier":"alice@example.org""#));
        assert!(request.contains(r#""password":"hunter2""#));
    }

    #[tokio::test]
    async fn rejected_login_surfaces_service_message() {
        let (base, server) = serve_http_once(
            400,
            r#"{"data":null,"error":{"status":400,"name":"ValidationError","message":"Invalid identifier or password"}}"#,
        )
        .await;
        let client = AuthClient::new(
            reqwest::Client::new(),
            RemoteConfig::parse(&base).expect("loopback url"),
        );

        let err = client
            .login("alice", "wrong")
            .await
            .expect_err("login must fail");
        assert_eq!(err.code, "auth_rejected");
        assert_eq!(err.category, ErrorCategory::Config);
        assert_eq!(err.message, "Invalid identifier or password");
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn register_posts_to_register_endpoint() {
        let (base, server) =
            serve_http_once(200, r#"{"jwt":"jwt-2","user":{"id":2,"username":"bob"}}"#).await;
        let client = AuthClient::new(
            reqwest::Client::new(),
            RemoteConfig::parse(&base).expect("loopback url"),
        );

        let session = client
            .register("bob", "bob@example.org", "pw")
            .await
            .expect("register succeeds");
        assert_eq!(session.token, "jwt-2");

        let request = server.await.expect("server task");
        assert!(request.starts_with("POST /api/auth/local/register HTTP/1.1"));
        assert!(request.contains(r#""username":"bob""#));
    }
}
