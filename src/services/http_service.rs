use log::{debug, warn};
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};
use crate::services::cookie_jar_service::CookieJarService;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::rate_limiter::RateLimiter;

/// Client credentials of the platform's Android app; reward endpoints only
/// answer to this client id with no scopes.
pub const CLIENT_ID: &str = "kd1unb4b3q4t58fwlpcbzcbnm76a8fp";
pub const CLIENT_URL: &str = "https://www.twitch.tv";
pub const USER_AGENT: &str = "Dalvik/2.1.0 (Linux; U; Android 14; SM-S911B Build/TP1A.220624.014) \
                              tv.twitch.android.app/16.8.1/1608010";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 5;

/// Shared HTTP client with cookie persistence, retries and proxy support.
///
/// All subsystems route through here so the cookie jar and rate limiting
/// stay coherent. The inner reqwest client is rebuilt when the proxy
/// changes.
pub struct HttpClient {
    client: RwLock<Client>,
    jar: Arc<CookieJarService>,
    limiter: RateLimiter,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpClient {
    pub async fn new(
        jar: Arc<CookieJarService>,
        proxy: Option<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let client = Self::build_client(&jar, proxy.as_deref()).await?;
        Ok(Self {
            client: RwLock::new(client),
            jar,
            limiter: RateLimiter::for_http(),
            shutdown_rx,
        })
    }

    async fn build_client(jar: &CookieJarService, proxy: Option<&str>) -> Result<Client> {
        let mut builder = Client::builder()
            .cookie_provider(jar.to_reqwest_jar().await)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .user_agent(USER_AGENT);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            builder = builder
                .proxy(Proxy::all(proxy).map_err(|e| Error::Request(format!("bad proxy: {e}")))?);
        }
        builder
            .build()
            .map_err(|e| Error::Miner(format!("failed to build HTTP client: {e}")))
    }

    /// Swap the proxy at runtime, rebuilding the client.
    pub async fn set_proxy(&self, proxy: Option<String>) -> Result<()> {
        let client = Self::build_client(&self.jar, proxy.as_deref()).await?;
        *self.client.write().await = client;
        Ok(())
    }

    pub fn jar(&self) -> &CookieJarService {
        &self.jar
    }

    /// Execute a request with bounded retries.
    ///
    /// `build` constructs the request against the current client once per
    /// attempt. Transient failures (connect errors, timeouts, 5xx) are
    /// retried up to 5 times with backoff; 429 honors `Retry-After`; other
    /// 4xx surface as `RequestInvalid` without retrying.
    pub async fn execute<F>(&self, url_for_cookies: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = ExponentialBackoff::for_requests();
        loop {
            if *self.shutdown_rx.borrow() {
                return Err(Error::ExitRequest);
            }
            self.limiter.acquire().await;

            let result = {
                let client = self.client.read().await;
                build(&client).send().await
            };

            let failure = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        self.jar
                            .update_from_response(url_for_cookies, response.headers())
                            .await
                            .ok();
                        return Ok(response);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(5);
                        warn!("[HTTP] 429 received, honoring Retry-After: {retry_after}s");
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        Error::Request("rate limited by server".into())
                    } else if status.is_client_error() {
                        return Err(Error::RequestInvalid { status: status.as_u16() });
                    } else {
                        Error::Request(format!("HTTP {status}"))
                    }
                }
                Err(e) => Error::from(e),
            };

            if !failure.is_transient() {
                return Err(failure);
            }
            if backoff.attempt() + 1 >= MAX_ATTEMPTS {
                return Err(failure);
            }
            let delay = backoff.next_delay();
            debug!(
                "[HTTP] Transient failure ({failure}), retry {}/{} in {:.1}s",
                backoff.attempt(),
                MAX_ATTEMPTS - 1,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Like `execute`, but hands back any response below 500 instead of
    /// mapping 4xx to errors. For endpoints where 4xx carries protocol
    /// meaning (the device-code token poll answers 400 while pending).
    pub async fn execute_any_status<F>(&self, url_for_cookies: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = ExponentialBackoff::for_requests();
        loop {
            if *self.shutdown_rx.borrow() {
                return Err(Error::ExitRequest);
            }
            self.limiter.acquire().await;

            let result = {
                let client = self.client.read().await;
                build(&client).send().await
            };

            let failure = match result {
                Ok(response) if !response.status().is_server_error() => {
                    self.jar
                        .update_from_response(url_for_cookies, response.headers())
                        .await
                        .ok();
                    return Ok(response);
                }
                Ok(response) => Error::Request(format!("HTTP {}", response.status())),
                Err(e) => Error::from(e),
            };

            if !failure.is_transient() || backoff.attempt() + 1 >= MAX_ATTEMPTS {
                return Err(failure);
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let url_owned = url.to_string();
        self.execute(url, move |client| client.request(Method::GET, url_owned.as_str()))
            .await
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.get(url).await?;
        response
            .text()
            .await
            .map_err(|e| Error::Request(format!("reading body: {e}")))
    }

    /// Probe a proxy URL before accepting it.
    ///
    /// Builds a throwaway client with the candidate proxy and checks the
    /// platform answers through it. Does not touch the live client.
    pub async fn verify_proxy(proxy_url: &str) -> Result<()> {
        if proxy_url.is_empty() {
            return Err(Error::Request("empty proxy URL".into()));
        }
        url::Url::parse(proxy_url).map_err(|e| Error::Request(format!("invalid proxy URL: {e}")))?;
        let client = Client::builder()
            .proxy(Proxy::all(proxy_url).map_err(|e| Error::Request(format!("bad proxy: {e}")))?)
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Request(format!("building probe client: {e}")))?;
        let response = client
            .head(CLIENT_URL)
            .send()
            .await
            .map_err(|e| Error::Request(format!("proxy probe failed: {e}")))?;
        if response.status().is_server_error() {
            return Err(Error::Request(format!("proxy probe returned {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_jar(tag: &str) -> Arc<CookieJarService> {
        let dir = std::env::temp_dir().join(format!("dm-http-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(CookieJarService::new(dir.join("cookies.jar")))
    }

    #[tokio::test]
    async fn test_client_builds_without_proxy() {
        let (_tx, rx) = watch::channel(false);
        let client = HttpClient::new(test_jar("plain"), None, rx).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_proxy_rejected_at_build() {
        let (_tx, rx) = watch::channel(false);
        let client = HttpClient::new(test_jar("proxy"), Some("not a url".into()), rx).await;
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_verify_proxy_rejects_garbage() {
        assert!(HttpClient::verify_proxy("").await.is_err());
        assert!(HttpClient::verify_proxy("::::").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_execute() {
        let (tx, rx) = watch::channel(false);
        let client = HttpClient::new(test_jar("shutdown"), None, rx).await.unwrap();
        tx.send(true).unwrap();
        let result = client.get("http://127.0.0.1:1/unreachable").await;
        assert!(matches!(result, Err(Error::ExitRequest)));
    }
}
