use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::services::auth_service::AuthState;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::{chunked, create_nonce, CHARS_ASCII};

const WS_URL: &str = "wss://pubsub-edge.twitch.tv/v1";
pub const WS_TOPICS_LIMIT: usize = 50;
pub const MAX_WEBSOCKETS: usize = 8;
/// The two per-user topics always present.
pub const BASE_TOPICS: usize = 2;
pub const TOPICS_PER_CHANNEL: usize = 2;
/// Hard cap on tracked channels, bounded by pool capacity.
pub const MAX_CHANNELS: usize =
    (MAX_WEBSOCKETS * WS_TOPICS_LIMIT - BASE_TOPICS) / TOPICS_PER_CHANNEL;

const PING_INTERVAL: Duration = Duration::from_secs(4 * 60);
const PING_JITTER: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// LISTEN/UNLISTEN frames carry at most this many topics.
const TOPICS_PER_FRAME: usize = 10;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    UserDrops,
    UserNotifications,
    ChannelStreamState,
    ChannelStreamUpdate,
}

impl TopicKind {
    fn prefix(self) -> &'static str {
        match self {
            TopicKind::UserDrops => "user-drop-events",
            TopicKind::UserNotifications => "onsite-notifications",
            TopicKind::ChannelStreamState => "video-playback-by-id",
            TopicKind::ChannelStreamUpdate => "broadcast-settings-update",
        }
    }
}

/// A pub-sub subscription: kind plus target (user or channel) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WsTopic {
    pub kind: TopicKind,
    pub target: i64,
}

impl WsTopic {
    pub fn new(kind: TopicKind, target: i64) -> Self {
        Self { kind, target }
    }

    pub fn as_str(&self) -> String {
        format!("{}.{}", self.kind.prefix(), self.target)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, target) = raw.rsplit_once('.')?;
        let target = target.parse().ok()?;
        let kind = match prefix {
            "user-drop-events" => TopicKind::UserDrops,
            "onsite-notifications" => TopicKind::UserNotifications,
            "video-playback-by-id" => TopicKind::ChannelStreamState,
            "broadcast-settings-update" => TopicKind::ChannelStreamUpdate,
            _ => return None,
        };
        Some(Self { kind, target })
    }
}

/// Decoded pub-sub payloads handed to the state machine queue.
#[derive(Debug, Clone)]
pub enum WsMessage {
    DropProgress { drop_id: String, current_minutes: u32, required_minutes: u32 },
    DropClaim { drop_id: String, drop_instance_id: String },
    Notification { id: String, kind: String },
    StreamUp { channel_id: i64 },
    StreamDown { channel_id: i64 },
    ViewersUpdate { channel_id: i64, viewers: u64 },
    StreamSettingsUpdate { channel_id: i64 },
}

/// Decode one topic payload; `None` drops it (logged by the caller).
fn decode_message(topic: WsTopic, payload: &Value) -> Option<WsMessage> {
    let msg_type = payload.get("type").and_then(Value::as_str).unwrap_or("");
    match topic.kind {
        TopicKind::UserDrops => match msg_type {
            "drop-progress" => Some(WsMessage::DropProgress {
                drop_id: payload.pointer("/data/drop_id")?.as_str()?.to_string(),
                current_minutes: payload.pointer("/data/current_progress_min")?.as_u64()? as u32,
                required_minutes: payload.pointer("/data/required_progress_min")?.as_u64()? as u32,
            }),
            "drop-claim" => Some(WsMessage::DropClaim {
                drop_id: payload.pointer("/data/drop_id")?.as_str()?.to_string(),
                drop_instance_id: payload
                    .pointer("/data/drop_instance_id")?
                    .as_str()?
                    .to_string(),
            }),
            _ => None,
        },
        TopicKind::UserNotifications => {
            if msg_type != "create-notification" {
                return None;
            }
            let notification = payload.pointer("/data/notification")?;
            Some(WsMessage::Notification {
                id: notification.get("id")?.as_str()?.to_string(),
                kind: notification.get("type")?.as_str()?.to_string(),
            })
        }
        TopicKind::ChannelStreamState => match msg_type {
            "viewcount" => Some(WsMessage::ViewersUpdate {
                channel_id: topic.target,
                viewers: payload.get("viewers").and_then(Value::as_u64).unwrap_or(0),
            }),
            "stream-up" => Some(WsMessage::StreamUp { channel_id: topic.target }),
            "stream-down" => Some(WsMessage::StreamDown { channel_id: topic.target }),
            "commercial" => None, // skip these
            other => {
                warn!("[WS] Unknown stream state: {other}");
                None
            }
        },
        TopicKind::ChannelStreamUpdate => {
            Some(WsMessage::StreamSettingsUpdate { channel_id: topic.target })
        }
    }
}

struct ConnShared {
    idx: usize,
    /// Desired topic set; the connection task reconciles submissions
    /// against this.
    topics: Mutex<HashMap<String, WsTopic>>,
    topics_changed: Notify,
    reconnect: Notify,
    auth: Arc<AuthState>,
    tx: mpsc::UnboundedSender<WsMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

struct Connection {
    shared: Arc<ConnShared>,
    task: tokio::task::JoinHandle<()>,
}

/// Sharded pool of pub-sub connections.
///
/// Each connection holds at most 50 topics; topics beyond the pool's total
/// capacity queue until capacity frees up. Connection failures stay local:
/// one reconnecting socket never disturbs its peers.
pub struct WsPool {
    auth: Arc<AuthState>,
    tx: mpsc::UnboundedSender<WsMessage>,
    shutdown_rx: watch::Receiver<bool>,
    conns: Mutex<Vec<Connection>>,
    queued: Mutex<Vec<WsTopic>>,
}

impl WsPool {
    pub fn new(
        auth: Arc<AuthState>,
        tx: mpsc::UnboundedSender<WsMessage>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            auth,
            tx,
            shutdown_rx,
            conns: Mutex::new(Vec::new()),
            queued: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to topics, sharding across connections.
    ///
    /// Topics that don't fit the pool cap are queued, not dropped.
    pub async fn add_topics(&self, topics: Vec<WsTopic>) {
        let mut remaining: Vec<WsTopic> = {
            let conns = self.conns.lock().await;
            let mut seen: Vec<WsTopic> = Vec::new();
            for conn in conns.iter() {
                seen.extend(conn.shared.topics.lock().await.values().copied());
            }
            topics.into_iter().filter(|t| !seen.contains(t)).collect()
        };
        if remaining.is_empty() {
            return;
        }

        let mut conns = self.conns.lock().await;
        for idx in 0..MAX_WEBSOCKETS {
            if remaining.is_empty() {
                break;
            }
            if idx >= conns.len() {
                conns.push(self.spawn_connection(idx));
            }
            let conn = &conns[idx];
            let mut owned = conn.shared.topics.lock().await;
            let mut changed = false;
            while owned.len() < WS_TOPICS_LIMIT {
                let Some(topic) = remaining.pop() else { break };
                owned.insert(topic.as_str(), topic);
                changed = true;
            }
            drop(owned);
            if changed {
                conn.shared.topics_changed.notify_one();
            }
        }
        drop(conns);

        if !remaining.is_empty() {
            warn!("[WS] Pool full, queueing {} topics", remaining.len());
            self.queued.lock().await.extend(remaining);
        }
    }

    /// Unsubscribe topics and recycle now-surplus connections.
    pub async fn remove_topics(&self, topic_strs: &[String]) {
        let mut recycled: Vec<WsTopic> = Vec::new();
        {
            let mut conns = self.conns.lock().await;
            for conn in conns.iter() {
                let mut owned = conn.shared.topics.lock().await;
                let before = owned.len();
                for topic in topic_strs {
                    owned.remove(topic);
                }
                if owned.len() != before {
                    conn.shared.topics_changed.notify_one();
                }
            }
            // drop trailing connections once the remainder fits the rest
            loop {
                let mut total = 0;
                for conn in conns.iter() {
                    total += conn.shared.topics.lock().await.len();
                }
                if conns.len() > 1 && total <= (conns.len() - 1) * WS_TOPICS_LIMIT {
                    let conn = conns.pop().expect("len checked above");
                    recycled.extend(conn.shared.topics.lock().await.values().copied());
                    conn.task.abort();
                } else {
                    break;
                }
            }
        }
        // re-add topics recycled from dropped connections, then any queued
        let queued: Vec<WsTopic> = self.queued.lock().await.drain(..).collect();
        recycled.extend(queued);
        if !recycled.is_empty() {
            self.add_topics(recycled).await;
        }
    }

    pub async fn topic_count(&self) -> usize {
        let conns = self.conns.lock().await;
        let mut total = 0;
        for conn in conns.iter() {
            total += conn.shared.topics.lock().await.len();
        }
        total
    }

    pub async fn stop(&self) {
        let mut conns = self.conns.lock().await;
        for conn in conns.drain(..) {
            conn.shared.reconnect.notify_one();
            conn.task.abort();
        }
    }

    fn spawn_connection(&self, idx: usize) -> Connection {
        let shared = Arc::new(ConnShared {
            idx,
            topics: Mutex::new(HashMap::new()),
            topics_changed: Notify::new(),
            reconnect: Notify::new(),
            auth: self.auth.clone(),
            tx: self.tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        });
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            connection_task(task_shared).await;
        });
        Connection { shared, task }
    }
}

/// Lifecycle of one pooled connection: connect with backoff, reconcile
/// subscriptions, ping, dispatch, reconnect on failure. The desired topic
/// set survives reconnects and is re-submitted on each new socket.
async fn connection_task(shared: Arc<ConnShared>) {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
    let mut shutdown_rx = shared.shutdown_rx.clone();
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match connect_async(WS_URL).await {
            Ok((stream, _)) => {
                info!("[WS] Websocket[{}] connected", shared.idx);
                backoff.reset();
                let result = run_connection(&shared, stream, &mut shutdown_rx).await;
                match result {
                    ConnectionEnd::Shutdown => return,
                    ConnectionEnd::Reconnect => {
                        warn!("[WS] Websocket[{}] reconnecting...", shared.idx);
                    }
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                info!(
                    "[WS] Websocket[{}] connection problem ({e}), retry in {:.0}s",
                    shared.idx,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum ConnectionEnd {
    Shutdown,
    Reconnect,
}

async fn run_connection(
    shared: &Arc<ConnShared>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut write, mut read) = stream.split();
    // nothing submitted yet on a fresh socket: force a reconcile pass
    let mut submitted: HashMap<String, WsTopic> = HashMap::new();
    shared.topics_changed.notify_one();

    let mut next_ping = Instant::now() + jittered_ping_interval();
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_sleep = pong_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
            _ = shared.reconnect.notified() => {
                return ConnectionEnd::Reconnect;
            }
            _ = tokio::time::sleep_until(next_ping) => {
                if write.send(Message::Text(json!({"type": "PING"}).to_string().into())).await.is_err() {
                    return ConnectionEnd::Reconnect;
                }
                debug!("[WS] Websocket[{}] sent PING", shared.idx);
                next_ping = Instant::now() + jittered_ping_interval();
                pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
            }
            _ = tokio::time::sleep_until(pong_sleep), if pong_deadline.is_some() => {
                warn!("[WS] Websocket[{}] missed PONG, reconnecting", shared.idx);
                return ConnectionEnd::Reconnect;
            }
            _ = shared.topics_changed.notified() => {
                if reconcile_topics(shared, &mut write, &mut submitted).await.is_err() {
                    return ConnectionEnd::Reconnect;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => {
                                if let Some(end) = handle_frame(shared, &value) {
                                    return end;
                                }
                                if value.get("type").and_then(Value::as_str) == Some("PONG") {
                                    pong_deadline = None;
                                }
                            }
                            Err(e) => debug!("[WS] Websocket[{}] bad frame: {e}", shared.idx),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("[WS] Websocket[{}] closed by server", shared.idx);
                        return ConnectionEnd::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("[WS] Websocket[{}] error: {e}", shared.idx);
                        return ConnectionEnd::Reconnect;
                    }
                    None => {
                        info!("[WS] Websocket[{}] stream ended", shared.idx);
                        return ConnectionEnd::Reconnect;
                    }
                }
            }
        }
    }
}

fn jittered_ping_interval() -> Duration {
    let jitter = rand::thread_rng()
        .gen_range(-(PING_JITTER.as_secs_f64())..=PING_JITTER.as_secs_f64());
    Duration::from_secs_f64((PING_INTERVAL.as_secs_f64() + jitter).max(1.0))
}

/// Send LISTEN/UNLISTEN frames to match submissions to the desired set.
async fn reconcile_topics<S>(
    shared: &Arc<ConnShared>,
    write: &mut S,
    submitted: &mut HashMap<String, WsTopic>,
) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let desired = shared.topics.lock().await.clone();
    let token = shared.auth.access_token().await.unwrap_or_default();

    let removed: Vec<String> = submitted
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();
    if !removed.is_empty() {
        debug!("[WS] Websocket[{}] removing topics: {}", shared.idx, removed.join(", "));
        for chunk in chunked(&removed, TOPICS_PER_FRAME) {
            let frame = json!({
                "type": "UNLISTEN",
                "nonce": create_nonce(CHARS_ASCII, 30),
                "data": {"topics": chunk, "auth_token": token},
            });
            write
                .send(Message::Text(frame.to_string().into()))
                .await
                .map_err(|_| ())?;
        }
        for topic in &removed {
            submitted.remove(topic);
        }
    }

    let added: Vec<String> = desired
        .keys()
        .filter(|k| !submitted.contains_key(*k))
        .cloned()
        .collect();
    if !added.is_empty() {
        debug!("[WS] Websocket[{}] adding topics: {}", shared.idx, added.join(", "));
        for chunk in chunked(&added, TOPICS_PER_FRAME) {
            let frame = json!({
                "type": "LISTEN",
                "nonce": create_nonce(CHARS_ASCII, 30),
                "data": {"topics": chunk, "auth_token": token},
            });
            write
                .send(Message::Text(frame.to_string().into()))
                .await
                .map_err(|_| ())?;
        }
        for topic in added {
            if let Some(parsed) = desired.get(&topic) {
                submitted.insert(topic, *parsed);
            }
        }
    }
    Ok(())
}

/// Handle a decoded frame; `Some(end)` terminates the connection loop.
fn handle_frame(shared: &Arc<ConnShared>, value: &Value) -> Option<ConnectionEnd> {
    match value.get("type").and_then(Value::as_str).unwrap_or("") {
        "MESSAGE" => {
            let Some(topic_str) = value.pointer("/data/topic").and_then(Value::as_str) else {
                return None;
            };
            let Some(topic) = WsTopic::parse(topic_str) else {
                debug!("[WS] Message for unrecognized topic: {topic_str}");
                return None;
            };
            let Some(inner) = value
                .pointer("/data/message")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            else {
                debug!("[WS] Undecodable payload on {topic_str}");
                return None;
            };
            if let Some(message) = decode_message(topic, &inner) {
                let _ = shared.tx.send(message);
            }
            None
        }
        "RESPONSE" => {
            let error = value.get("error").and_then(Value::as_str).unwrap_or("");
            if !error.is_empty() {
                // bad auth on a topic: resubscribe later with a fresh token
                error!("[WS] Websocket[{}] subscription error: {error}", shared.idx);
                let retry_shared = shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    retry_shared.auth.validate().await.ok();
                    retry_shared.topics_changed.notify_one();
                });
            }
            None
        }
        "PONG" => {
            debug!("[WS] Websocket[{}] received PONG", shared.idx);
            None
        }
        "RECONNECT" => {
            warn!("[WS] Websocket[{}] server requested reconnect", shared.idx);
            Some(ConnectionEnd::Reconnect)
        }
        other => {
            debug!("[WS] Websocket[{}] unknown frame type: {other}", shared.idx);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_cap_is_199() {
        assert_eq!(MAX_CHANNELS, 199);
    }

    #[test]
    fn test_topic_string_roundtrip() {
        let topic = WsTopic::new(TopicKind::UserDrops, 1234);
        assert_eq!(topic.as_str(), "user-drop-events.1234");
        assert_eq!(WsTopic::parse("user-drop-events.1234"), Some(topic));
        assert_eq!(
            WsTopic::parse("video-playback-by-id.99"),
            Some(WsTopic::new(TopicKind::ChannelStreamState, 99))
        );
        assert_eq!(WsTopic::parse("not-a-topic.x"), None);
        assert_eq!(WsTopic::parse("garbage"), None);
    }

    #[test]
    fn test_decode_drop_progress() {
        let topic = WsTopic::new(TopicKind::UserDrops, 1);
        let payload = json!({
            "type": "drop-progress",
            "data": {"drop_id": "d1", "current_progress_min": 3, "required_progress_min": 10},
        });
        match decode_message(topic, &payload) {
            Some(WsMessage::DropProgress { drop_id, current_minutes, required_minutes }) => {
                assert_eq!(drop_id, "d1");
                assert_eq!(current_minutes, 3);
                assert_eq!(required_minutes, 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_stream_state() {
        let topic = WsTopic::new(TopicKind::ChannelStreamState, 55);
        let up = json!({"type": "stream-up", "server_time": 0});
        assert!(matches!(
            decode_message(topic, &up),
            Some(WsMessage::StreamUp { channel_id: 55 })
        ));
        let viewers = json!({"type": "viewcount", "viewers": 777});
        assert!(matches!(
            decode_message(topic, &viewers),
            Some(WsMessage::ViewersUpdate { channel_id: 55, viewers: 777 })
        ));
        // commercials are skipped
        assert!(decode_message(topic, &json!({"type": "commercial"})).is_none());
    }

    #[test]
    fn test_decode_failure_is_dropped() {
        let topic = WsTopic::new(TopicKind::UserDrops, 1);
        let broken = json!({"type": "drop-progress", "data": {}});
        assert!(decode_message(topic, &broken).is_none());
    }

    async fn test_pool() -> (WsPool, mpsc::UnboundedReceiver<WsMessage>) {
        use crate::events::EventBus;
        use crate::services::cookie_jar_service::CookieJarService;
        use crate::services::http_service::HttpClient;
        let dir = std::env::temp_dir().join(format!("dm-ws-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let jar = Arc::new(CookieJarService::new(dir.join("cookies.jar")));
        let bus = EventBus::new();
        let http = Arc::new(HttpClient::new(jar, None, bus.shutdown_rx()).await.unwrap());
        let auth = Arc::new(AuthState::new(http, bus.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        (WsPool::new(auth, tx, bus.shutdown_rx()), rx)
    }

    #[tokio::test]
    async fn test_pool_shards_topics_across_connections() {
        let (pool, _rx) = test_pool().await;
        let topics: Vec<WsTopic> = (0..120)
            .map(|i| WsTopic::new(TopicKind::ChannelStreamState, i))
            .collect();
        pool.add_topics(topics).await;
        assert_eq!(pool.topic_count().await, 120);
        let conns = pool.conns.lock().await;
        assert_eq!(conns.len(), 3); // 50 + 50 + 20
        for conn in conns.iter() {
            assert!(conn.shared.topics.lock().await.len() <= WS_TOPICS_LIMIT);
        }
        drop(conns);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_pool_deduplicates_topics() {
        let (pool, _rx) = test_pool().await;
        let topic = WsTopic::new(TopicKind::UserDrops, 42);
        pool.add_topics(vec![topic, topic]).await;
        pool.add_topics(vec![topic]).await;
        assert_eq!(pool.topic_count().await, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_pool_removal_recycles_connections() {
        let (pool, _rx) = test_pool().await;
        let topics: Vec<WsTopic> = (0..120)
            .map(|i| WsTopic::new(TopicKind::ChannelStreamState, i))
            .collect();
        pool.add_topics(topics.clone()).await;
        let to_remove: Vec<String> = topics[20..].iter().map(WsTopic::as_str).collect();
        pool.remove_topics(&to_remove).await;
        assert_eq!(pool.topic_count().await, 20);
        assert_eq!(pool.conns.lock().await.len(), 1);
        pool.stop().await;
    }
}
