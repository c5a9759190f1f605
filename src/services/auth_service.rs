use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::events::{AppEvent, EventBus};
use crate::services::http_service::{HttpClient, CLIENT_ID, CLIENT_URL, USER_AGENT};

const DEVICE_CODE_URL: &str = "https://id.twitch.tv/oauth2/device";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Fresh device codes requested before giving up on the flow.
const MAX_CODE_ROUNDS: u32 = 3;

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Default)]
struct AuthInner {
    access_token: Option<String>,
    user_id: Option<u64>,
    device_id: Option<String>,
}

/// Authentication state: token, device/session identifiers, login flow.
///
/// `session_id` is fresh per process; `device_id` is restored from the
/// platform cookie so the account keeps a stable device fingerprint.
pub struct AuthState {
    http: Arc<HttpClient>,
    bus: EventBus,
    session_id: String,
    inner: RwLock<AuthInner>,
    validate_lock: Mutex<()>,
    logged_in_tx: watch::Sender<bool>,
}

impl AuthState {
    pub fn new(http: Arc<HttpClient>, bus: EventBus) -> Self {
        let (logged_in_tx, _) = watch::channel(false);
        Self {
            http,
            bus,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            inner: RwLock::new(AuthInner::default()),
            validate_lock: Mutex::new(()),
            logged_in_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn user_id(&self) -> Option<u64> {
        self.inner.read().await.user_id
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.read().await.access_token.clone()
    }

    pub fn logged_in_rx(&self) -> watch::Receiver<bool> {
        self.logged_in_tx.subscribe()
    }

    pub async fn wait_until_logged_in(&self) {
        let mut rx = self.logged_in_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop the current access token so the next validate reruns the flow.
    pub async fn invalidate(&self) {
        self.inner.write().await.access_token = None;
        let _ = self.logged_in_tx.send(false);
    }

    /// Request headers for platform endpoints; `gql` adds the OAuth
    /// authorization and web origin.
    pub async fn headers(&self, gql: bool) -> HeaderMap {
        let inner = self.inner.read().await;
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        headers.insert("Accept-Language", HeaderValue::from_static("en-US"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Client-Id", HeaderValue::from_static(CLIENT_ID));
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
        if let Ok(value) = HeaderValue::from_str(&self.session_id) {
            headers.insert("Client-Session-Id", value);
        }
        if let Some(device_id) = inner.device_id.as_deref() {
            if let Ok(value) = HeaderValue::from_str(device_id) {
                headers.insert("X-Device-Id", value);
            }
        }
        if gql {
            headers.insert("Origin", HeaderValue::from_static(CLIENT_URL));
            headers.insert("Referer", HeaderValue::from_static(CLIENT_URL));
            if let Some(token) = inner.access_token.as_deref() {
                if let Ok(value) = HeaderValue::from_str(&format!("OAuth {token}")) {
                    headers.insert("Authorization", value);
                }
            }
        }
        headers
    }

    /// Validate the stored token, running the device-code flow when needed.
    ///
    /// Serialized so concurrent callers share one login attempt.
    pub async fn validate(&self) -> Result<u64> {
        let _guard = self.validate_lock.lock().await;
        if let Some(user_id) = self.inner.read().await.user_id {
            if *self.logged_in_tx.borrow() {
                return Ok(user_id);
            }
        }

        self.ensure_device_id().await?;

        for round in 0..2 {
            let token = match self.http.jar().get_auth_token().await.filter(|t| !t.is_empty()) {
                Some(token) => {
                    if round == 0 {
                        info!("[AUTH] Restoring session from cookie");
                    }
                    token
                }
                None => {
                    self.bus.publish(AppEvent::LoginRequired);
                    self.bus.publish(AppEvent::AttentionRequired { sound: true });
                    self.device_code_flow().await?
                }
            };

            match self.validate_token(&token).await? {
                Some(user_id) => {
                    {
                        let mut inner = self.inner.write().await;
                        inner.access_token = Some(token.clone());
                        inner.user_id = Some(user_id);
                    }
                    self.http.jar().set_auth_token(&token).await.ok();
                    self.http.jar().set_user_id(user_id).await.ok();
                    let _ = self.logged_in_tx.send(true);
                    info!("[AUTH] Login successful, user ID: {user_id}");
                    self.bus.publish(AppEvent::LoginStatus {
                        status: "logged_in".into(),
                        user_id: Some(user_id),
                    });
                    return Ok(user_id);
                }
                None => {
                    // stored token rejected: drop it and rerun the flow
                    warn!("[AUTH] Restored session is invalid");
                    self.http.jar().clear_auth_token().await.ok();
                    self.inner.write().await.access_token = None;
                }
            }
        }
        Err(Error::Login("login verification failed".into()))
    }

    async fn ensure_device_id(&self) -> Result<()> {
        if self.inner.read().await.device_id.is_some() {
            return Ok(());
        }
        let device_id = match self.http.jar().get_device_id().await {
            Some(existing) => existing,
            None => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                self.http.jar().set_device_id(&generated).await.ok();
                generated
            }
        };
        self.inner.write().await.device_id = Some(device_id);
        Ok(())
    }

    /// Check the token against the validation endpoint.
    ///
    /// `Ok(Some(user_id))` when valid for our client id, `Ok(None)` when the
    /// token is rejected or belongs to a different client (jar is wiped in
    /// that case).
    async fn validate_token(&self, token: &str) -> Result<Option<u64>> {
        let auth_header = format!("OAuth {token}");
        let response = self
            .http
            .execute(VALIDATE_URL, move |client| {
                client.get(VALIDATE_URL).header("Authorization", &auth_header)
            })
            .await;
        let response = match response {
            Ok(response) => response,
            Err(Error::RequestInvalid { status: 401 }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Request(format!("validate response: {e}")))?;
        if body.get("client_id").and_then(Value::as_str) != Some(CLIENT_ID) {
            // token minted for another client: the whole jar is suspect
            warn!("[AUTH] Cookie client ID mismatch, clearing jar");
            self.http.jar().clear().await.ok();
            return Ok(None);
        }
        let user_id = body
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| Error::Login("validate response without user_id".into()))?;
        Ok(Some(user_id))
    }

    /// OAuth device-code flow.
    ///
    /// Publishes the user code on the bus and polls the token endpoint every
    /// `interval` seconds until the user confirms or the code expires; a few
    /// fresh codes are requested before giving up.
    async fn device_code_flow(&self) -> Result<String> {
        for round in 0..MAX_CODE_ROUNDS {
            let code: DeviceCodeResponse = self
                .http
                .execute(DEVICE_CODE_URL, |client| {
                    client
                        .post(DEVICE_CODE_URL)
                        .form(&[("client_id", CLIENT_ID), ("scopes", "")])
                })
                .await?
                .json()
                .await
                .map_err(|e| Error::Login(format!("device code response: {e}")))?;

            info!(
                "[AUTH] Device flow started (round {}): enter {} at {}",
                round + 1,
                code.user_code,
                code.verification_uri
            );
            self.bus.publish(AppEvent::OauthCodeRequired {
                url: code.verification_uri.clone(),
                code: code.user_code.clone(),
            });

            let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);
            let mut interval = code.interval.max(1);
            loop {
                if tokio::time::Instant::now() >= deadline {
                    warn!("[AUTH] Device code expired, requesting a new one");
                    break;
                }
                // the user won't have typed the code in instantly
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let device_code = code.device_code.clone();
                let response = self
                    .http
                    .execute_any_status(TOKEN_URL, move |client| {
                        client.post(TOKEN_URL).form(&[
                            ("client_id", CLIENT_ID),
                            ("scopes", ""),
                            ("device_code", &device_code),
                            ("grant_type", DEVICE_CODE_GRANT),
                        ])
                    })
                    .await?;

                if response.status().is_success() {
                    let token: TokenResponse = response
                        .json()
                        .await
                        .map_err(|e| Error::Login(format!("token response: {e}")))?;
                    self.http.jar().set_auth_token(&token.access_token).await.ok();
                    return Ok(token.access_token);
                }

                let body = response.text().await.unwrap_or_default();
                if body.contains("authorization_pending") {
                    continue;
                } else if body.contains("slow_down") {
                    interval += 2;
                    info!("[AUTH] Slowing token polling to every {interval}s");
                } else if body.contains("expired_token") {
                    warn!("[AUTH] Device code rejected as expired");
                    break;
                } else if body.contains("captcha") {
                    return Err(Error::CaptchaRequired);
                } else {
                    return Err(Error::Login(format!("token polling failed: {body}")));
                }
            }
        }
        Err(Error::Login("device code expired too many times".into()))
    }
}
