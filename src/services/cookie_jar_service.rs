use anyhow::Result;
use cookie_store::{CookieStore, RawCookie};
use log::{debug, error};
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

const PLATFORM_URL: &str = "https://www.twitch.tv";
const AUTH_TOKEN_COOKIE: &str = "auth-token";
const DEVICE_ID_COOKIE: &str = "unique_id";
const USER_ID_COOKIE: &str = "persistent";

/// Persistent cookie storage backing the shared HTTP client.
///
/// Cookies live in `DATA_DIR/cookies.jar`; the auth token, device id and
/// user id all ride in here so a restart resumes the previous session.
pub struct CookieJarService {
    store: Arc<Mutex<CookieStore>>,
    file_path: PathBuf,
}

impl CookieJarService {
    pub fn new(file_path: PathBuf) -> Self {
        let store = if file_path.exists() {
            debug!("[COOKIE_JAR] Loading cookies from: {:?}", file_path);
            match Self::load_from_file(&file_path) {
                Ok(store) => {
                    debug!("[COOKIE_JAR] Loaded {} cookies", store.iter_any().count());
                    store
                }
                Err(e) => {
                    error!("[COOKIE_JAR] Failed to load cookies: {e:?}");
                    error!("[COOKIE_JAR] Creating new cookie store");
                    CookieStore::default()
                }
            }
        } else {
            debug!("[COOKIE_JAR] Creating new cookie store at: {:?}", file_path);
            CookieStore::default()
        };

        Self {
            store: Arc::new(Mutex::new(store)),
            file_path,
        }
    }

    fn load_from_file(path: &PathBuf) -> Result<CookieStore> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        CookieStore::load_json(reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse cookie store: {e:?}"))
    }

    /// Save cookies to disk.
    pub async fn save(&self) -> Result<()> {
        let store = self.store.lock().await;
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        store
            .save_json(&mut writer)
            .map_err(|e| anyhow::anyhow!("Failed to save cookies: {e:?}"))?;
        debug!(
            "[COOKIE_JAR] Saved {} cookies to {:?}",
            store.iter_any().count(),
            self.file_path
        );
        Ok(())
    }

    /// Clear all cookies and delete the jar file.
    pub async fn clear(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        *store = CookieStore::default();
        drop(store);
        if self.file_path.exists() {
            fs::remove_file(&self.file_path)?;
            debug!("[COOKIE_JAR] Cleared cookies and deleted file: {:?}", self.file_path);
        }
        Ok(())
    }

    pub async fn add_cookie(&self, name: &str, value: &str) -> Result<()> {
        let url = Url::parse(PLATFORM_URL)?;
        let cookie = RawCookie::build((name.to_string(), value.to_string()))
            .domain(url.domain().unwrap_or("twitch.tv"))
            .path("/")
            .permanent()
            .build();
        let mut store = self.store.lock().await;
        store
            .insert_raw(&cookie, &url)
            .map_err(|e| anyhow::anyhow!("Failed to insert cookie: {e:?}"))?;
        Ok(())
    }

    pub async fn get_cookie(&self, name: &str) -> Option<String> {
        let url = Url::parse(PLATFORM_URL).ok()?;
        let store = self.store.lock().await;
        store
            .get(url.domain()?, "/", name)
            .map(|cookie| cookie.value().to_string())
    }

    /// Seed a reqwest cookie provider with the persisted cookies.
    pub async fn to_reqwest_jar(&self) -> Arc<reqwest::cookie::Jar> {
        let store = self.store.lock().await;
        let jar = reqwest::cookie::Jar::default();
        for cookie in store.iter_any() {
            let url = format!(
                "https://{}{}",
                cookie.domain().unwrap_or("twitch.tv"),
                cookie.path().unwrap_or("/")
            );
            if let Ok(url) = Url::parse(&url) {
                jar.add_cookie_str(&format!("{}={}", cookie.name(), cookie.value()), &url);
            }
        }
        Arc::new(jar)
    }

    /// Fold `Set-Cookie` headers from a response back into the store.
    pub async fn update_from_response(&self, url: &str, headers: &HeaderMap) -> Result<()> {
        let url = Url::parse(url)?;
        let mut store = self.store.lock().await;
        for cookie_str in headers.get_all(SET_COOKIE) {
            if let Ok(cookie_str) = cookie_str.to_str() {
                if let Ok(cookie) = RawCookie::parse(cookie_str) {
                    let _ = store.insert_raw(&cookie, &url);
                }
            }
        }
        Ok(())
    }

    pub async fn get_auth_token(&self) -> Option<String> {
        self.get_cookie(AUTH_TOKEN_COOKIE).await
    }

    pub async fn set_auth_token(&self, token: &str) -> Result<()> {
        self.add_cookie(AUTH_TOKEN_COOKIE, token).await?;
        self.save().await
    }

    pub async fn clear_auth_token(&self) -> Result<()> {
        // overwriting with an empty value beats surgically removing it from
        // the store; validation treats empty as missing
        self.add_cookie(AUTH_TOKEN_COOKIE, "").await?;
        self.save().await
    }

    /// Stable device identifier, persisted across restarts.
    pub async fn get_device_id(&self) -> Option<String> {
        self.get_cookie(DEVICE_ID_COOKIE)
            .await
            .filter(|v| !v.is_empty())
    }

    pub async fn set_device_id(&self, device_id: &str) -> Result<()> {
        self.add_cookie(DEVICE_ID_COOKIE, device_id).await?;
        self.save().await
    }

    pub async fn set_user_id(&self, user_id: u64) -> Result<()> {
        self.add_cookie(USER_ID_COOKIE, &user_id.to_string()).await?;
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_jar(tag: &str) -> CookieJarService {
        let dir = std::env::temp_dir().join(format!("dm-jar-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        CookieJarService::new(dir.join("cookies.jar"))
    }

    #[tokio::test]
    async fn test_cookie_roundtrip() {
        let jar = temp_jar("roundtrip");
        jar.set_auth_token("token123").await.unwrap();
        jar.set_device_id("device456").await.unwrap();
        assert_eq!(jar.get_auth_token().await.as_deref(), Some("token123"));
        assert_eq!(jar.get_device_id().await.as_deref(), Some("device456"));

        // a fresh service over the same file sees the persisted values
        let reloaded = CookieJarService::new(jar.file_path.clone());
        assert_eq!(reloaded.get_auth_token().await.as_deref(), Some("token123"));
        std::fs::remove_file(&jar.file_path).ok();
    }

    #[tokio::test]
    async fn test_cleared_token_reads_as_missing() {
        let jar = temp_jar("cleared");
        jar.set_auth_token("token123").await.unwrap();
        jar.clear_auth_token().await.unwrap();
        assert_eq!(jar.get_auth_token().await.as_deref(), Some(""));
        assert_eq!(jar.get_device_id().await, None);
        std::fs::remove_file(&jar.file_path).ok();
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let jar = temp_jar("clearfile");
        jar.set_auth_token("x").await.unwrap();
        assert!(jar.file_path.exists());
        jar.clear().await.unwrap();
        assert!(!jar.file_path.exists());
        assert_eq!(jar.get_auth_token().await, None);
    }
}
