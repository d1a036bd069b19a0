//! API client for the bizdesk REST backend.
//!
//! Every call goes through [`ApiClient::send`], which attaches the current
//! bearer credential and, when the backend rejects it with 401 or 403,
//! renews the credential once and reissues the request once. Concurrent
//! rejections within one session share a single in-flight renewal.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::refresh::TokenResponse;
use crate::auth::{Credential, RefreshError, SessionEpoch, SessionRefresher, SignOutReason};
use crate::lifecycle::SessionLifecycle;

// ============================================================================
// Constants
// ============================================================================

/// Default base URL for the backend
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub login_path: String,
    pub register_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub request_timeout: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "/auth/login".to_string(),
            register_path: "/auth/register".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ApiSettings {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// 204, or a 2xx with no body.
    Empty,
    Json(Value),
}

impl Payload {
    /// Deserialize into `T`. An empty payload is read as JSON `null`, so
    /// `()` and `Option<_>` accept it.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let value = match self {
            Payload::Empty => Value::Null,
            Payload::Json(value) => value,
        };
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

struct InFlightRefresh {
    id: u64,
    epoch: SessionEpoch,
    future: SharedRefresh,
}

#[derive(Default)]
struct RefreshSlot {
    next_id: u64,
    current: Option<InFlightRefresh>,
}

/// API client for the bizdesk backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    settings: Arc<ApiSettings>,
    lifecycle: SessionLifecycle,
    refresher: SessionRefresher,
    refresh_slot: Arc<Mutex<RefreshSlot>>,
}

impl ApiClient {
    /// Create a new API client bound to a session lifecycle
    pub fn new(settings: ApiSettings, lifecycle: SessionLifecycle) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .cookie_store(true)
            .build()?;

        let refresher = SessionRefresher::new(client.clone(), settings.url(&settings.refresh_path));

        Ok(Self {
            client,
            settings: Arc::new(settings),
            lifecycle,
            refresher,
            refresh_slot: Arc::new(Mutex::new(RefreshSlot::default())),
        })
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    // ===== Session Actions =====

    /// Sign in with username and password. A rejected login never triggers
    /// a credential refresh.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionEpoch, ApiError> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
        });
        let credential = self
            .issue_credential(&self.settings.login_path, &body)
            .await?
            .ok_or_else(|| {
                ApiError::NotAuthenticated("login response did not contain a token".to_string())
            })?;

        self.begin_session(credential)
    }

    /// Register an account. Returns the new session when the backend signs
    /// the account in as part of registration.
    pub async fn register<B: Serialize + ?Sized>(
        &self,
        body: &B,
    ) -> Result<Option<SessionEpoch>, ApiError> {
        let credential = self
            .issue_credential(&self.settings.register_path, body)
            .await?;
        credential.map(|c| self.begin_session(c)).transpose()
    }

    fn begin_session(&self, credential: Credential) -> Result<SessionEpoch, ApiError> {
        self.lifecycle.sign_in(credential).map_err(|e| {
            warn!(error = %e, "Session not started");
            ApiError::CredentialStorage(format!("{:#}", e))
        })
    }

    /// End the session locally, then tell the backend. The local sign-out
    /// happens whether or not the backend call succeeds.
    pub async fn logout(&self) {
        let was_authenticated = self.lifecycle.is_authenticated();
        let credential = self.lifecycle.credential();
        self.lifecycle.sign_out(SignOutReason::UserLogout);

        if !was_authenticated {
            return;
        }

        let mut request = self.client.post(self.settings.url(&self.settings.logout_path));
        if let Some(ref credential) = credential {
            request = request.bearer_auth(credential.as_str());
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                debug!(status = %response.status(), "Logout endpoint returned an error");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to notify backend of logout"),
        }
    }

    async fn issue_credential<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<Credential>, ApiError> {
        let response = self
            .client
            .post(self.settings.url(path))
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(parsed.into_credential())
    }

    // ===== Authenticated Calls =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(Method::GET, path, None).await?.into_typed()
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(Method::DELETE, path, None).await?.into_typed()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_with_body(Method::POST, path, body).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_with_body(Method::PUT, path, body).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_with_body(Method::PATCH, path, body).await
    }

    async fn send_with_body<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.send(method, path, Some(body)).await?.into_typed()
    }

    /// Issue one logical call.
    ///
    /// At most one refresh and one reissue happen per call, however the
    /// reissued request is answered.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Payload, ApiError> {
        let url = self.settings.url(path);
        let epoch = self.lifecycle.status().epoch;
        let mut refreshed = false;

        loop {
            let (response, sent) = self.dispatch(&method, &url, body.as_ref()).await?;
            let status = response.status();

            if status.is_success() {
                let payload = Self::read_payload(status, response).await?;
                self.lifecycle.record_api_activity(epoch);
                return Ok(payload);
            }

            if Self::is_auth_rejection(status) && !refreshed {
                refreshed = true;
                if self.lifecycle.is_current(epoch) && self.lifecycle.credential() != sent {
                    // Another call renewed the credential after this one went out
                    debug!(%status, url = %url, "Credential already renewed, reissuing");
                    continue;
                }
                debug!(%status, url = %url, "Credential rejected, renewing session");
                self.renew_session(epoch).await?;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            debug!(%status, url = %url, body = %ApiError::truncate_body(&text), "Request failed");
            return Err(ApiError::from_status(status, &text));
        }
    }

    /// Send one attempt, returning the response with the credential it carried.
    async fn dispatch(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(Response, Option<Credential>), ApiError> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header(header::ACCEPT, "application/json");
        // Re-read on every attempt so a reissue carries the renewed credential
        let credential = self.lifecycle.credential();
        if let Some(ref credential) = credential {
            request = request.bearer_auth(credential.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok((request.send().await?, credential))
    }

    fn is_auth_rejection(status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn read_payload(status: StatusCode, response: Response) -> Result<Payload, ApiError> {
        if status == StatusCode::NO_CONTENT {
            return Ok(Payload::Empty);
        }
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Payload::Empty);
        }
        serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    // ===== Session Renewal =====

    async fn renew_session(&self, epoch: SessionEpoch) -> Result<(), ApiError> {
        if !self.lifecycle.is_current(epoch) {
            return Err(ApiError::SessionExpired);
        }

        let (id, future) = self.join_refresh(epoch);
        let result = future.await;
        self.release_refresh(id);

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Session renewal failed");
                Err(ApiError::SessionExpired)
            }
        }
    }

    /// Join the in-flight renewal for `epoch`, or start one.
    fn join_refresh(&self, epoch: SessionEpoch) -> (u64, SharedRefresh) {
        let mut slot = self
            .refresh_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(ref in_flight) = slot.current {
            if in_flight.epoch == epoch && in_flight.future.peek().is_none() {
                debug!(epoch, "Joining in-flight session renewal");
                return (in_flight.id, in_flight.future.clone());
            }
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let future = Self::refresh_once(self.refresher.clone(), self.lifecycle.clone(), epoch)
            .boxed()
            .shared();
        slot.current = Some(InFlightRefresh {
            id,
            epoch,
            future: future.clone(),
        });
        (id, future)
    }

    fn release_refresh(&self, id: u64) {
        let mut slot = self
            .refresh_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.current.as_ref().is_some_and(|f| f.id == id) {
            slot.current = None;
        }
    }

    async fn refresh_once(
        refresher: SessionRefresher,
        lifecycle: SessionLifecycle,
        epoch: SessionEpoch,
    ) -> Result<Credential, RefreshError> {
        let current = lifecycle.credential();
        match refresher.exchange(current.as_ref()).await {
            Ok(credential) => match lifecycle.renew(epoch, credential.clone()) {
                Ok(true) => {
                    info!(epoch, "Session renewed");
                    Ok(credential)
                }
                Ok(false) => Err(RefreshError::SessionEnded),
                Err(e) => {
                    lifecycle.sign_out_epoch(epoch, SignOutReason::RefreshFailed);
                    Err(RefreshError::Storage(format!("{:#}", e)))
                }
            },
            Err(e) => {
                lifecycle.sign_out_epoch(epoch, SignOutReason::RefreshFailed);
                Err(e)
            }
        }
    }
}
