use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::events::{AppEvent, EventBus};
use crate::models::drops::{Campaign, CampaignStatus, TimedDrop};
use crate::models::settings::Settings;
use crate::services::gql_service::{merge_data, GqlClient, GqlOperation};

/// Fetches and reconciles the campaign inventory, and claims finished drops.
pub struct InventoryService {
    gql: Arc<GqlClient>,
    bus: EventBus,
}

impl InventoryService {
    pub fn new(gql: Arc<GqlClient>, bus: EventBus) -> Self {
        Self { gql, bus }
    }

    /// Fetch in-progress and available campaigns and build the domain model.
    ///
    /// One batched call covers the inventory and the campaign directory;
    /// details for every observed campaign follow in batches, overlaid onto
    /// the inventory data (which carries our progress and so wins merges).
    pub async fn fetch_inventory(&self, user_id: u64) -> Result<Vec<Campaign>> {
        self.bus.status("Fetching inventory...");
        let mut results = self
            .gql
            .request_batch(vec![GqlOperation::inventory(), GqlOperation::campaigns()])
            .await?;
        let campaigns_response = results.pop().expect("two results for two operations");
        let inventory_response = results.pop().expect("two results for two operations");

        let inventory = &inventory_response["data"]["currentUser"]["inventory"];
        let ongoing: &[Value] = inventory["dropCampaignsInProgress"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default();

        // awarded benefit ids with their award timestamps; used to infer
        // claim state for drops lacking a self edge
        let claimed_benefits: HashMap<String, DateTime<Utc>> = inventory["gameEventDrops"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|b| {
                        let id = b.get("id")?.as_str()?.to_string();
                        let at = b.get("lastAwardedAt")?.as_str()?;
                        let at = DateTime::parse_from_rfc3339(at).ok()?.with_timezone(&Utc);
                        Some((id, at))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut campaign_data: HashMap<String, Value> = ongoing
            .iter()
            .filter_map(|c| Some((c.get("id")?.as_str()?.to_string(), c.clone())))
            .collect();

        let available: Vec<(String, Value)> = campaigns_response["data"]["currentUser"]
            ["dropCampaigns"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter(|c| {
                        matches!(
                            c.get("status").and_then(Value::as_str),
                            Some("ACTIVE") | Some("UPCOMING")
                        )
                    })
                    .filter_map(|c| Some((c.get("id")?.as_str()?.to_string(), c.clone())))
                    .collect()
            })
            .unwrap_or_default();

        // detailed data for every available campaign, fetched in batches
        self.bus.status("Fetching campaign details...");
        let user_login = user_id.to_string();
        let detail_ops: Vec<GqlOperation> = available
            .iter()
            .map(|(id, _)| GqlOperation::campaign_details(&user_login, id))
            .collect();
        let detail_results = self.gql.request_batch(detail_ops).await?;
        for ((id, listing), detail) in available.iter().zip(detail_results) {
            let detail = &detail["data"]["user"]["dropCampaign"];
            let mut merged = merge_data(listing, detail);
            if let Some(existing) = campaign_data.get(id) {
                merged = merge_data(existing, &merged);
            }
            campaign_data.insert(id.clone(), merged);
        }

        let now = Utc::now();
        let mut campaigns: Vec<Campaign> = campaign_data
            .values()
            // campaigns without a game are invalid listings
            .filter(|data| data.get("game").map(|g| !g.is_null()).unwrap_or(false))
            .filter_map(|data| match Campaign::from_gql(data, &claimed_benefits) {
                Ok(campaign) => Some(campaign),
                Err(e) => {
                    warn!("[INVENTORY] Skipping malformed campaign: {e}");
                    None
                }
            })
            .collect();
        campaigns.sort_by_key(|c| !c.is_active(now));
        campaigns.sort_by_key(|c| {
            if c.status(now) == CampaignStatus::Upcoming {
                c.starts_at
            } else {
                c.ends_at
            }
        });
        campaigns.sort_by_key(|c| !c.eligible());

        info!("[INVENTORY] Fetched {} campaigns", campaigns.len());
        Ok(campaigns)
    }

    /// Claim one drop. Returns whether the drop ended up claimed.
    ///
    /// Safe to call twice: an already-claimed drop short-circuits, and the
    /// platform answering "already claimed" counts as success.
    pub async fn claim_drop(&self, user_id: u64, campaign: &mut Campaign, drop_id: &str) -> bool {
        let now = Utc::now();
        let campaign_id = campaign.id.clone();
        {
            let Some(drop) = campaign.get_drop_mut(drop_id) else {
                return false;
            };
            if drop.is_claimed {
                return true;
            }
            if drop.claim_id.is_none() {
                // claim ids are derivable when the platform hasn't sent one
                drop.update_claim_id(format!("{user_id}#{campaign_id}#{drop_id}"));
            }
        }
        if !campaign.can_claim(drop_id, now) {
            return false;
        }
        let claim_id = campaign
            .get_drop(drop_id)
            .and_then(|d| d.claim_id.clone())
            .expect("claim id set above");

        let claimed = match self.gql.request(GqlOperation::claim_drop(&claim_id)).await {
            Ok(response) => matches!(
                response
                    .pointer("/data/claimDropRewards/status")
                    .and_then(Value::as_str),
                Some("ELIGIBLE_FOR_ALL") | Some("DROP_INSTANCE_ALREADY_CLAIMED")
            ),
            Err(e) => {
                error!("[INVENTORY] Drop claim failed for {drop_id}: {e}");
                false
            }
        };

        if claimed {
            let (game_name, rewards, counts) = {
                let drop = campaign.get_drop_mut(drop_id).expect("drop exists");
                drop.mark_claimed();
                (
                    campaign.game.name.clone(),
                    campaign.get_drop(drop_id).expect("drop exists").rewards_text(),
                    (campaign.claimed_drops(), campaign.total_drops()),
                )
            };
            self.bus.print(format!(
                "Claimed drop: {game_name} {rewards} ({}/{})",
                counts.0, counts.1
            ));
            self.bus.publish(AppEvent::DropUpdate {
                campaign_id: campaign.id.clone(),
                drop: drop_payload(campaign.get_drop(drop_id).expect("drop exists")),
            });
        } else {
            error!("[INVENTORY] Drop claim has potentially failed! Drop ID: {drop_id}");
        }
        claimed
    }

    /// Resolve the currently-progressing drop on a channel, by id.
    pub async fn current_drop_id(&self, channel_id: i64) -> Result<Option<String>> {
        let response = self.gql.request(GqlOperation::current_drop(channel_id)).await?;
        Ok(response
            .pointer("/data/currentUser/dropCurrentSession")
            .filter(|v| !v.is_null())
            .and_then(|session| session.get("dropID"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Dismiss a platform notification after acting on it.
    pub async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        self.gql
            .request(GqlOperation::notifications_delete(notification_id))
            .await
            .map(|_| ())
    }

    pub fn publish_inventory(&self, campaigns: &[Campaign]) {
        let list: Vec<Value> = campaigns.iter().map(campaign_payload).collect();
        for payload in &list {
            self.bus.publish(AppEvent::CampaignAdd(payload.clone()));
        }
        self.bus.publish(AppEvent::InventoryBatchUpdate { list });
    }

    /// Hierarchical Games → Campaigns → Drops → Benefits tree of everything
    /// currently worth mining, in priority order.
    pub fn wanted_tree(&self, settings: &Settings, campaigns: &[Campaign], now: DateTime<Utc>) -> Value {
        let next_hour = now + Duration::hours(1);
        let mut games = Vec::new();
        for game_name in &settings.games_to_watch {
            let lowered = game_name.to_lowercase();
            let mut wanted_campaigns = Vec::new();
            let mut game_entry: Option<&Campaign> = None;
            for campaign in campaigns {
                if campaign.game.name.to_lowercase() != lowered {
                    continue;
                }
                game_entry.get_or_insert(campaign);
                if !campaign.can_earn_within(next_hour, now) {
                    continue;
                }
                let wanted_drops: Vec<Value> = campaign
                    .drops
                    .iter()
                    .filter(|d| d.has_wanted_unclaimed_benefits(&settings.mining_benefits))
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "benefits": d.benefits.iter()
                                .filter(|b| b.kind.is_wanted(&settings.mining_benefits))
                                .map(|b| json!({"name": b.name, "image_url": b.image_url}))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                if !wanted_drops.is_empty() {
                    wanted_campaigns.push(json!({
                        "id": campaign.id,
                        "name": campaign.name,
                        "url": campaign.campaign_url,
                        "drops": wanted_drops,
                    }));
                }
            }
            if !wanted_campaigns.is_empty() {
                let game = game_entry.map(|c| &c.game);
                games.push(json!({
                    "game_id": game.map(|g| g.id.clone()),
                    "game_name": game_name,
                    "game_icon": game.and_then(|g| g.box_art_url.clone()),
                    "campaigns": wanted_campaigns,
                }));
            }
        }
        Value::Array(games)
    }
}

pub fn drop_payload(drop: &TimedDrop) -> Value {
    json!({
        "id": drop.id,
        "name": drop.name,
        "required_minutes": drop.required_minutes,
        "current_minutes": drop.current_minutes(),
        "progress": drop.progress(),
        "is_claimed": drop.is_claimed,
        "benefits": drop.benefits.iter()
            .map(|b| json!({"id": b.id, "name": b.name, "image_url": b.image_url}))
            .collect::<Vec<_>>(),
    })
}

pub fn campaign_payload(campaign: &Campaign) -> Value {
    let now = Utc::now();
    json!({
        "id": campaign.id,
        "name": campaign.name,
        "game_name": campaign.game.name,
        "game_id": campaign.game.id,
        "game_icon": campaign.game.box_art_url,
        "link_url": campaign.link_url,
        "campaign_url": campaign.campaign_url,
        "linked": campaign.linked,
        "acl_based": campaign.acl_based(),
        "status": match campaign.status(now) {
            CampaignStatus::Upcoming => "UPCOMING",
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Expired => "EXPIRED",
        },
        "starts_at": campaign.starts_at.to_rfc3339(),
        "ends_at": campaign.ends_at.to_rfc3339(),
        "claimed_drops": campaign.claimed_drops(),
        "total_drops": campaign.total_drops(),
        "drops": campaign.drops.iter().map(drop_payload).collect::<Vec<_>>(),
    })
}
