//! In-process event bus between the mining engine and the control surface.
//!
//! Outbound `AppEvent`s fan out over a broadcast channel; whatever transport
//! fronts the UI subscribes and forwards them. Inbound control operations
//! arrive as `ControlCommand`s on the state machine's queue.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub id: String,
    pub name: String,
    pub game: Option<String>,
    pub game_id: Option<String>,
    pub game_icon: Option<String>,
    pub viewers: Option<u64>,
    pub online: bool,
    pub drops_enabled: bool,
    pub acl_based: bool,
    pub watching: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropProgressPayload {
    pub drop_id: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub game_name: String,
    pub drop_name: String,
    pub current_minutes: u32,
    pub required_minutes: u32,
    pub progress: f64,
    pub remaining_seconds: u64,
}

/// Every event pushed to the external surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum AppEvent {
    StatusUpdate { status: String },
    ConsoleOutput { line: String },

    ChannelAdd(ChannelPayload),
    ChannelUpdate(ChannelPayload),
    ChannelRemove { id: String },
    ChannelsBatchUpdate { list: Vec<ChannelPayload> },
    ChannelsClear,
    ChannelWatching { id: String },
    ChannelWatchingClear,

    CampaignAdd(Value),
    InventoryBatchUpdate { list: Vec<Value> },
    InventoryClear,
    DropUpdate { campaign_id: String, drop: Value },

    DropProgress(DropProgressPayload),
    DropProgressStop,

    LoginRequired,
    OauthCodeRequired { url: String, code: String },
    LoginStatus { status: String, user_id: Option<u64> },

    SettingsUpdated,
    GamesAvailable { list: Vec<String> },
    ManualModeUpdate { active: bool, game_name: Option<String> },
    WantedItemsUpdate { tree: Value },
    ThemeChange { dark_mode: bool },

    /// Emitted only for states that need user input (login, captcha,
    /// terminal platform error).
    AttentionRequired { sound: bool },
}

/// Control operations accepted from the external surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    SelectChannel { id: String },
    ExitManualMode,
    Reload,
    SetSettings { patch: Value },
    VerifyProxy { url: String },
}

/// Broadcast hub carrying events to any number of surface subscribers plus
/// the process-wide shutdown flag.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self { tx, shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; delivery to zero subscribers is not an error.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    /// Print a line to the surface console and the log.
    pub fn print(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.publish(AppEvent::ConsoleOutput { line });
    }

    pub fn status(&self, status: impl Into<String>) {
        self.publish(AppEvent::StatusUpdate { status: status.into() });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(AppEvent::ChannelsClear);
        assert!(matches!(rx1.recv().await.unwrap(), AppEvent::ChannelsClear));
        assert!(matches!(rx2.recv().await.unwrap(), AppEvent::ChannelsClear));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(AppEvent::LoginRequired);
        bus.status("idle");
    }

    #[tokio::test]
    async fn test_shutdown_flag_observed() {
        let bus = EventBus::new();
        let mut rx = bus.shutdown_rx();
        assert!(!bus.is_shutdown());
        bus.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = AppEvent::OauthCodeRequired {
            url: "https://www.twitch.tv/activate".into(),
            code: "ABCD1234".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "oauth_code_required");
        assert_eq!(json["payload"]["code"], "ABCD1234");
    }

    #[test]
    fn test_control_command_parsing() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"action":"select_channel","id":"123"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::SelectChannel { ref id } if id == "123"));
        let cmd: ControlCommand = serde_json::from_str(r#"{"action":"reload"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Reload));
    }

    #[test]
    fn test_drop_progress_payload_roundtrip() {
        let event = AppEvent::DropProgress(DropProgressPayload {
            drop_id: "d1".into(),
            campaign_id: "c1".into(),
            campaign_name: "Campaign".into(),
            game_name: "Game".into(),
            drop_name: "Drop".into(),
            current_minutes: 3,
            required_minutes: 10,
            progress: 0.3,
            remaining_seconds: 420,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: AppEvent = serde_json::from_str(&json).unwrap();
        match back {
            AppEvent::DropProgress(p) => {
                assert_eq!(p.current_minutes, 3);
                assert_eq!(p.required_minutes, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
