use log::{debug, warn};
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::channel::{Channel, Stream};
use crate::models::drops::{AclEntry, Game};
use crate::services::gql_service::{GqlClient, GqlOperation};

/// Streams requested per directory page.
const DIRECTORY_PAGE: usize = 30;

/// Channel discovery and selection.
pub struct ChannelService {
    gql: Arc<GqlClient>,
}

impl ChannelService {
    pub fn new(gql: Arc<GqlClient>) -> Self {
        Self { gql }
    }

    /// Live drops-enabled channels for a game, from the directory.
    ///
    /// When the derived slug misses, the name is resolved through the
    /// directory redirect endpoint and the query retried once.
    pub async fn get_live_streams(&self, game: &Game, limit: usize) -> Result<Vec<Channel>> {
        let mut slug = game.slug();
        for attempt in 0..2 {
            let response = self
                .gql
                .request(GqlOperation::game_directory(&slug, limit.min(DIRECTORY_PAGE), true))
                .await
                .map_err(|e| Error::Gql(format!("game directory for {slug}: {e}")))?;
            let game_data = &response["data"]["game"];
            if game_data.is_null() {
                if attempt == 0 {
                    match self.resolve_slug(&game.name).await? {
                        Some(resolved) if resolved != slug => {
                            debug!("[CHANNELS] Slug {slug} resolved to {resolved}");
                            slug = resolved;
                            continue;
                        }
                        _ => {}
                    }
                }
                warn!("[CHANNELS] No directory entry for game: {}", game.name);
                return Ok(Vec::new());
            }
            let channels = game_data["streams"]["edges"]
                .as_array()
                .map(|edges| {
                    edges
                        .iter()
                        .filter_map(|edge| edge.get("node"))
                        .filter_map(|node| Channel::from_directory(node, game))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(channels);
        }
        Ok(Vec::new())
    }

    async fn resolve_slug(&self, game_name: &str) -> Result<Option<String>> {
        let response = self.gql.request(GqlOperation::slug_redirect(game_name)).await?;
        Ok(response
            .pointer("/data/game/slug")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Probe allow-listed channels for live state, in one batched call.
    ///
    /// Returns a channel per probed entry; offline ones come back without a
    /// stream and are left out.
    pub async fn bulk_check_online(&self, entries: &[AclEntry]) -> Result<Vec<Channel>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let ops: Vec<GqlOperation> = entries
            .iter()
            .map(|e| GqlOperation::get_stream_info(&e.login))
            .collect();
        let results = self.gql.request_batch(ops).await?;
        let mut online = Vec::new();
        for (entry, result) in entries.iter().zip(results) {
            let user = &result["data"]["user"];
            if user.is_null() {
                continue;
            }
            if let Some(stream) = Stream::from_stream_info(user) {
                let mut channel = Channel::from_acl(entry);
                if let Some(display) = user.get("displayName").and_then(Value::as_str) {
                    channel.display_name = display.to_string();
                }
                channel.set_stream(Some(stream));
                online.push(channel);
            }
        }
        Ok(online)
    }

    /// Re-fetch one channel's stream info. `Ok(None)` when offline.
    pub async fn fetch_stream(&self, login: &str) -> Result<Option<Stream>> {
        let response = self.gql.request(GqlOperation::get_stream_info(login)).await?;
        let user = &response["data"]["user"];
        if user.is_null() {
            return Ok(None);
        }
        Ok(Stream::from_stream_info(user))
    }
}

/// Position of the channel's game in the wanted list; unwanted games and
/// offline channels sort last.
pub fn game_priority(channel: &Channel, wanted_games: &[Game]) -> usize {
    channel
        .game()
        .and_then(|game| wanted_games.iter().position(|w| w.id == game.id))
        .unwrap_or(usize::MAX)
}

/// Order candidates for selection.
///
/// Ties break, in order: game priority (lower index first), ACL-based over
/// directory-sourced, higher viewers, channel id.
pub fn selection_order(channels: &mut Vec<&Channel>, wanted_games: &[Game]) {
    channels.sort_by_key(|ch| {
        (
            game_priority(ch, wanted_games),
            Reverse(ch.acl_based),
            Reverse(ch.viewers().unwrap_or(0)),
            ch.id,
        )
    });
}

/// Whether `candidate` beats the currently watched channel.
pub fn should_switch(current: Option<&Channel>, candidate: &Channel, wanted_games: &[Game]) -> bool {
    let Some(current) = current else {
        return true;
    };
    let candidate_priority = game_priority(candidate, wanted_games);
    let current_priority = game_priority(current, wanted_games);
    candidate_priority < current_priority
        || (candidate_priority == current_priority && candidate.acl_based && !current.acl_based)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn game(id: &str, name: &str) -> Game {
        Game { id: id.into(), name: name.into(), slug: None, box_art_url: None }
    }

    fn channel(id: i64, game_ref: &Game, viewers: u64, acl: bool) -> Channel {
        let node = json!({
            "id": format!("b{id}"),
            "viewersCount": viewers,
            "broadcaster": {"id": id.to_string(), "login": format!("chan{id}")},
        });
        let mut ch = Channel::from_directory(&node, game_ref).unwrap();
        ch.acl_based = acl;
        ch
    }

    #[test]
    fn test_priority_follows_wanted_order() {
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        let wanted = vec![game_a.clone(), game_b.clone()];
        let ch_a = channel(10, &game_a, 10, false);
        let ch_b = channel(11, &game_b, 10_000, false);
        assert_eq!(game_priority(&ch_a, &wanted), 0);
        assert_eq!(game_priority(&ch_b, &wanted), 1);

        // priority beats viewer count
        let mut candidates: Vec<&Channel> = vec![&ch_b, &ch_a];
        selection_order(&mut candidates, &wanted);
        assert_eq!(candidates[0].id, 10);
    }

    #[test]
    fn test_acl_beats_viewers_within_same_game() {
        let game_a = game("1", "GameA");
        let wanted = vec![game_a.clone()];
        let acl = channel(1, &game_a, 5, true);
        let directory = channel(2, &game_a, 50_000, false);
        let mut candidates: Vec<&Channel> = vec![&directory, &acl];
        selection_order(&mut candidates, &wanted);
        assert_eq!(candidates[0].id, 1);
    }

    #[test]
    fn test_viewers_then_id_tiebreak() {
        let game_a = game("1", "GameA");
        let wanted = vec![game_a.clone()];
        let big = channel(5, &game_a, 100, false);
        let small = channel(3, &game_a, 10, false);
        let equal_a = channel(7, &game_a, 10, false);
        let mut candidates: Vec<&Channel> = vec![&equal_a, &big, &small];
        selection_order(&mut candidates, &wanted);
        assert_eq!(candidates[0].id, 5); // most viewers
        assert_eq!(candidates[1].id, 3); // viewer tie broken by id
        assert_eq!(candidates[2].id, 7);
    }

    #[test]
    fn test_should_switch_rules() {
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        let wanted = vec![game_a.clone(), game_b.clone()];
        let watching_b = channel(1, &game_b, 100, false);
        let candidate_a = channel(2, &game_a, 10, false);
        let candidate_b_acl = channel(3, &game_b, 10, true);
        let candidate_b_dir = channel(4, &game_b, 9999, false);

        assert!(should_switch(None, &candidate_b_dir, &wanted));
        // higher-priority game wins
        assert!(should_switch(Some(&watching_b), &candidate_a, &wanted));
        // same game: ACL wins
        assert!(should_switch(Some(&watching_b), &candidate_b_acl, &wanted));
        // same game, both directory: stay put
        assert!(!should_switch(Some(&watching_b), &candidate_b_dir, &wanted));
    }

    #[test]
    fn test_unwanted_game_sorts_last() {
        let game_a = game("1", "GameA");
        let game_x = game("9", "Unwanted");
        let wanted = vec![game_a.clone()];
        let ch_wanted = channel(1, &game_a, 1, false);
        let ch_unwanted = channel(2, &game_x, 9999, false);
        let mut candidates: Vec<&Channel> = vec![&ch_unwanted, &ch_wanted];
        selection_order(&mut candidates, &wanted);
        assert_eq!(candidates[0].id, 1);
        assert_eq!(game_priority(&ch_unwanted, &wanted), usize::MAX);
    }
}
