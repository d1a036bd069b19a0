//! The single network round-trip that trades an expired access credential
//! for a new one.
//!
//! The long-lived proof of the session (a cookie set at login) travels with
//! the request through the shared client's cookie jar. This module performs
//! no retries; the retry policy belongs to the API client.

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::Credential;

#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    #[error("Refresh rejected with status {0}")]
    Rejected(StatusCode),

    #[error("Refresh request failed: {0}")]
    Network(String),

    #[error("Refresh response did not contain a token")]
    MissingToken,

    #[error("Session ended while the refresh was in flight")]
    SessionEnded,

    #[error("Renewed credential could not be saved: {0}")]
    Storage(String),
}

/// Token-bearing response shared by the login, registration and refresh endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_credential(self) -> Option<Credential> {
        self.token
            .filter(|t| !t.trim().is_empty())
            .map(Credential::new)
    }
}

#[derive(Clone)]
pub struct SessionRefresher {
    client: Client,
    url: String,
}

impl SessionRefresher {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }

    /// Exchange the current (possibly expired) credential for a new one.
    pub async fn exchange(&self, current: Option<&Credential>) -> Result<Credential, RefreshError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json");
        if let Some(credential) = current {
            request = request.bearer_auth(credential.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "Refresh endpoint rejected the session");
            return Err(RefreshError::Rejected(status));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|_| RefreshError::MissingToken)?;

        body.into_credential().ok_or(RefreshError::MissingToken)
    }
}
