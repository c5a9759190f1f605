use serde_json::Value;

use crate::events::ChannelPayload;
use crate::models::drops::{AclEntry, Game};

/// Tag the platform attaches to streams with reward badges enabled.
const DROPS_TAG_ID: &str = "c2542d6d-cd10-4532-919b-3d19f30a768b";

/// A live broadcast attached to a tracked channel.
#[derive(Debug, Clone)]
pub struct Stream {
    pub broadcast_id: String,
    pub viewers: u64,
    pub drops_enabled: bool,
    pub game: Option<Game>,
    pub title: String,
    /// Opaque beacon endpoint receiving watch heartbeats. Scraped lazily and
    /// refreshed whenever stream info is re-fetched.
    pub spade_url: Option<String>,
}

impl Stream {
    /// Build from a `GetStreamInfo` user object. `None` when offline.
    pub fn from_stream_info(user: &Value) -> Option<Self> {
        let stream = user.get("stream").filter(|v| !v.is_null())?;
        let broadcast_id = stream.get("id")?.as_str()?.to_string();
        let viewers = stream.get("viewersCount").and_then(Value::as_u64).unwrap_or(0);
        let game = user
            .pointer("/broadcastSettings/game")
            .or_else(|| stream.get("game"))
            .filter(|v| !v.is_null())
            .and_then(Game::from_gql);
        let title = user
            .pointer("/broadcastSettings/title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // tags are not always present; when they are, the badge check is
        // authoritative for reward availability
        let drops_enabled = match stream.get("tags").and_then(Value::as_array) {
            Some(tags) => tags.iter().any(|t| {
                t.get("id").and_then(Value::as_str) == Some(DROPS_TAG_ID)
                    || t.get("localizedName").and_then(Value::as_str) == Some("Drops Enabled")
            }),
            None => true,
        };
        Some(Self {
            broadcast_id,
            viewers,
            drops_enabled,
            game,
            title,
            spade_url: None,
        })
    }
}

/// A tracked channel; at most one channel process-wide is being watched.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub login: String,
    pub display_name: String,
    pub acl_based: bool,
    pub stream: Option<Stream>,
}

impl Channel {
    /// Offline placeholder for an allow-listed channel; its live state is
    /// established by a follow-up stream info probe.
    pub fn from_acl(entry: &AclEntry) -> Self {
        Self {
            id: entry.id,
            login: entry.login.clone(),
            display_name: entry.login.clone(),
            acl_based: true,
            stream: None,
        }
    }

    /// Build from a `GameDirectory` stream edge node.
    pub fn from_directory(node: &Value, game: &Game) -> Option<Self> {
        let broadcaster = node.get("broadcaster").filter(|v| !v.is_null())?;
        let id = broadcaster.get("id")?.as_str()?.parse().ok()?;
        let login = broadcaster.get("login")?.as_str()?.to_string();
        let display_name = broadcaster
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or(&login)
            .to_string();
        let stream = Stream {
            broadcast_id: node.get("id")?.as_str()?.to_string(),
            viewers: node.get("viewersCount").and_then(Value::as_u64).unwrap_or(0),
            // the directory query already filters for reward availability
            drops_enabled: true,
            game: Some(game.clone()),
            title: node
                .pointer("/broadcaster/broadcastSettings/title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            spade_url: None,
        };
        Some(Self {
            id,
            login,
            display_name,
            acl_based: false,
            stream: Some(stream),
        })
    }

    pub fn online(&self) -> bool {
        self.stream.is_some()
    }

    pub fn viewers(&self) -> Option<u64> {
        self.stream.as_ref().map(|s| s.viewers)
    }

    pub fn game(&self) -> Option<&Game> {
        self.stream.as_ref().and_then(|s| s.game.as_ref())
    }

    pub fn drops_enabled(&self) -> bool {
        self.stream.as_ref().map(|s| s.drops_enabled).unwrap_or(false)
    }

    /// Replace the stream state, returning the previous one.
    pub fn set_stream(&mut self, stream: Option<Stream>) -> Option<Stream> {
        std::mem::replace(&mut self.stream, stream)
    }

    pub fn set_viewers(&mut self, viewers: u64) {
        if let Some(stream) = self.stream.as_mut() {
            stream.viewers = viewers;
        }
    }

    /// Event payload for the control surface.
    pub fn payload(&self, watching: bool) -> ChannelPayload {
        ChannelPayload {
            id: self.id.to_string(),
            name: self.display_name.clone(),
            game: self.game().map(|g| g.name.clone()),
            game_id: self.game().map(|g| g.id.clone()),
            game_icon: self.game().and_then(|g| g.box_art_url.clone()),
            viewers: self.viewers(),
            online: self.online(),
            drops_enabled: self.drops_enabled(),
            acl_based: self.acl_based,
            watching,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn game() -> Game {
        Game {
            id: "10".into(),
            name: "Some Game".into(),
            slug: Some("some-game".into()),
            box_art_url: None,
        }
    }

    #[test]
    fn test_from_directory_node() {
        let node = json!({
            "id": "40000001",
            "viewersCount": 1234,
            "broadcaster": {"id": "501", "login": "streamer_a", "displayName": "Streamer_A"},
        });
        let channel = Channel::from_directory(&node, &game()).unwrap();
        assert_eq!(channel.id, 501);
        assert_eq!(channel.login, "streamer_a");
        assert!(channel.online());
        assert!(channel.drops_enabled());
        assert_eq!(channel.viewers(), Some(1234));
        assert!(!channel.acl_based);
    }

    #[test]
    fn test_directory_node_without_broadcaster() {
        let node = json!({"id": "4", "viewersCount": 5, "broadcaster": null});
        assert!(Channel::from_directory(&node, &game()).is_none());
    }

    #[test]
    fn test_acl_channel_starts_offline() {
        let channel = Channel::from_acl(&AclEntry { id: 77, login: "acl_chan".into() });
        assert!(channel.acl_based);
        assert!(!channel.online());
        assert_eq!(channel.viewers(), None);
        assert!(!channel.drops_enabled());
    }

    #[test]
    fn test_stream_info_offline() {
        let user = json!({"id": "1", "login": "x", "stream": null});
        assert!(Stream::from_stream_info(&user).is_none());
    }

    #[test]
    fn test_stream_info_badge_check() {
        let user = json!({
            "id": "1",
            "login": "x",
            "broadcastSettings": {"title": "farming", "game": {"id": "10", "name": "Some Game"}},
            "stream": {
                "id": "900",
                "viewersCount": 42,
                "tags": [{"id": DROPS_TAG_ID, "localizedName": "Drops Enabled"}],
            },
        });
        let stream = Stream::from_stream_info(&user).unwrap();
        assert!(stream.drops_enabled);
        assert_eq!(stream.broadcast_id, "900");
        assert_eq!(stream.game.as_ref().unwrap().name, "Some Game");

        let user = json!({
            "id": "1", "login": "x",
            "stream": {"id": "901", "viewersCount": 7, "tags": []},
        });
        let stream = Stream::from_stream_info(&user).unwrap();
        assert!(!stream.drops_enabled);
    }

    #[test]
    fn test_set_stream_transitions() {
        let mut channel = Channel::from_acl(&AclEntry { id: 9, login: "c".into() });
        let user = json!({
            "id": "9", "login": "c",
            "stream": {"id": "55", "viewersCount": 3},
        });
        let before = channel.set_stream(Stream::from_stream_info(&user));
        assert!(before.is_none());
        assert!(channel.online());
        let before = channel.set_stream(None);
        assert!(before.is_some());
        assert!(!channel.online());
    }
}
