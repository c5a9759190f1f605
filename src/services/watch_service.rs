use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::models::settings::Settings;
use crate::services::channel_service::ChannelService;
use crate::services::http_service::HttpClient;

lazy_static! {
    static ref SPADE_PATTERN: Regex =
        Regex::new(r#""spade_?url":\s*"(https://video-edge-[.\w\-/]+\.ts(?:\?[^"]*)?)""#).unwrap();
    static ref SETTINGS_JS_PATTERN: Regex =
        Regex::new(r#"src="(https://[\w.]+/config/settings\.[0-9a-f]{32}\.js)""#).unwrap();
}

/// Grace on top of the heartbeat interval before progress is extrapolated.
const EXTRAPOLATION_GRACE: Duration = Duration::from_secs(20);
const MINUTE: Duration = Duration::from_secs(60);

/// The channel currently being watched. Owned by the watch loop; the state
/// machine publishes replacements over a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub channel_id: i64,
    pub login: String,
    pub broadcast_id: String,
}

enum HeartbeatOutcome {
    Sent,
    /// 404/410: the beacon URL went stale.
    StaleBeacon,
    Rejected(u16),
}

/// Signals from the watch loop back to the state machine queue.
#[derive(Debug, Clone)]
pub enum WatchSignal {
    /// A wall minute of continuous watching passed without the loop seeing a
    /// reason to stop; the state machine extrapolates progress if the server
    /// has gone quiet for longer than `interval + 20s`.
    MinuteTick,
    /// The beacon rejected us twice; the stream data is stale.
    BeaconLost { channel_id: i64 },
}

/// Heartbeat loop: posts minute-watched events to the active stream's
/// beacon URL at `20 / connection_quality` second cadence.
pub struct WatchService {
    http: Arc<HttpClient>,
    channels: Arc<ChannelService>,
    settings: Arc<RwLock<Settings>>,
    target_rx: watch::Receiver<Option<WatchTarget>>,
    signals: mpsc::UnboundedSender<WatchSignal>,
    restart: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
    user_id: u64,
}

impl WatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Arc<HttpClient>,
        channels: Arc<ChannelService>,
        settings: Arc<RwLock<Settings>>,
        target_rx: watch::Receiver<Option<WatchTarget>>,
        signals: mpsc::UnboundedSender<WatchSignal>,
        restart: Arc<Notify>,
        shutdown_rx: watch::Receiver<bool>,
        user_id: u64,
    ) -> Self {
        Self { http, channels, settings, target_rx, signals, restart, shutdown_rx, user_id }
    }

    /// Drive the heartbeat loop until shutdown.
    pub async fn run(mut self) {
        let mut spade_cache: Option<(i64, String)> = None;
        let mut broadcast_override: Option<(i64, String)> = None;
        let mut minute_mark = Instant::now();
        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }
            let maybe_target = self.target_rx.borrow().clone();
            let Some(mut target) = maybe_target else {
                // nothing to watch; wait for a target or shutdown
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = self.target_rx.changed() => {}
                    _ = shutdown_rx.changed() => {}
                }
                minute_mark = Instant::now();
                continue;
            };
            // a beacon refresh may have produced a newer broadcast id than
            // the one the state machine handed us
            if let Some((channel_id, broadcast_id)) = &broadcast_override {
                if *channel_id == target.channel_id {
                    target.broadcast_id = broadcast_id.clone();
                } else {
                    broadcast_override = None;
                }
            }

            // reuse the beacon for the same channel, re-scrape otherwise
            let spade_url = match &spade_cache {
                Some((channel_id, url)) if *channel_id == target.channel_id => url.clone(),
                _ => match self.scrape_spade_url(&target.login).await {
                    Ok(url) => {
                        debug!("[WATCH] Beacon for {}: {url}", target.login);
                        spade_cache = Some((target.channel_id, url.clone()));
                        url
                    }
                    Err(e) => {
                        warn!("[WATCH] No beacon for {}: {e}", target.login);
                        let _ = self
                            .signals
                            .send(WatchSignal::BeaconLost { channel_id: target.channel_id });
                        self.sleep_one_interval().await;
                        continue;
                    }
                },
            };

            match self.send_heartbeat(&spade_url, &target).await {
                Ok(HeartbeatOutcome::Sent) => {}
                Ok(HeartbeatOutcome::StaleBeacon) => {
                    // stale beacon: drop the cache, refresh stream info and
                    // let the next iteration retry with a fresh scrape
                    info!("[WATCH] Beacon rejected for {}, refreshing", target.login);
                    spade_cache = None;
                    match self.refresh_broadcast(&target).await {
                        Some(broadcast_id) => {
                            broadcast_override = Some((target.channel_id, broadcast_id));
                        }
                        None => {
                            let _ = self
                                .signals
                                .send(WatchSignal::BeaconLost { channel_id: target.channel_id });
                        }
                    }
                }
                Ok(HeartbeatOutcome::Rejected(status)) => {
                    debug!("[WATCH] Beacon returned {status} for {}", target.login);
                }
                Err(Error::ExitRequest) => return,
                Err(e) => debug!("[WATCH] Heartbeat failed for {}: {e}", target.login),
            }

            if minute_mark.elapsed() >= MINUTE {
                minute_mark = Instant::now();
                let _ = self.signals.send(WatchSignal::MinuteTick);
            }
            self.sleep_one_interval().await;
        }
    }

    /// Interruptible inter-heartbeat sleep: a target change or an explicit
    /// restart cuts it short so switches take effect immediately.
    async fn sleep_one_interval(&mut self) {
        let interval = self.settings.read().await.heartbeat_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.target_rx.changed() => {}
            _ = self.restart.notified() => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    /// POST one minute-watched event.
    async fn send_heartbeat(
        &self,
        spade_url: &str,
        target: &WatchTarget,
    ) -> Result<HeartbeatOutcome> {
        let payload = build_watch_payload(target, self.user_id);
        let spade = spade_url.to_string();
        let response = self
            .http
            .execute_any_status(spade_url, move |client| {
                client.post(spade.as_str()).form(&[("data", payload.clone())])
            })
            .await?;
        match response.status().as_u16() {
            204 => Ok(HeartbeatOutcome::Sent),
            404 | 410 => Ok(HeartbeatOutcome::StaleBeacon),
            other => Ok(HeartbeatOutcome::Rejected(other)),
        }
    }

    async fn refresh_broadcast(&self, target: &WatchTarget) -> Option<String> {
        match self.channels.fetch_stream(&target.login).await {
            Ok(Some(stream)) => Some(stream.broadcast_id),
            Ok(None) => None,
            Err(e) => {
                debug!("[WATCH] Stream refresh failed for {}: {e}", target.login);
                None
            }
        }
    }

    /// Extract the beacon URL from the channel page, falling back to the
    /// page's settings script.
    async fn scrape_spade_url(&self, login: &str) -> Result<String> {
        let page_url = format!("https://www.twitch.tv/{login}");
        let html = self.http.get_text(&page_url).await?;
        if let Some(url) = extract_spade_url(&html) {
            return Ok(url);
        }
        if let Some(settings_url) = SETTINGS_JS_PATTERN
            .captures(&html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            let settings_js = self.http.get_text(&settings_url).await?;
            if let Some(url) = extract_spade_url(&settings_js) {
                return Ok(url);
            }
        }
        Err(Error::Request(format!("no beacon URL found for channel {login}")))
    }
}

pub fn extract_spade_url(document: &str) -> Option<String> {
    SPADE_PATTERN
        .captures(document)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Minute-watched event payload: minified JSON, base64-encoded.
pub fn build_watch_payload(target: &WatchTarget, user_id: u64) -> String {
    let payload = json!([{
        "event": "minute-watched",
        "properties": {
            "broadcast_id": target.broadcast_id,
            "channel_id": target.channel_id,
            "channel": target.login,
            "hidden": false,
            "live": true,
            "location": "channel",
            "logged_in": true,
            "muted": false,
            "player": "site",
            "user_id": user_id,
        }
    }]);
    general_purpose::STANDARD.encode(payload.to_string())
}

/// How long the server may stay quiet before extrapolation kicks in.
pub fn extrapolation_deadline(heartbeat_interval: Duration) -> Duration {
    heartbeat_interval + EXTRAPOLATION_GRACE
}
