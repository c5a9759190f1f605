use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::models::settings::MiningBenefits;

/// Extrapolated minutes are capped; past this the progress data is stale
/// enough that a channel switch is forced instead.
pub const MAX_EXTRA_MINUTES: u32 = 15;
/// Longest allowed precondition chain.
pub const MAX_PRECONDITION_DEPTH: usize = 32;
/// Completed drops stay claimable until this long after the campaign ends.
const CLAIM_GRACE_HOURS: i64 = 24;

lazy_static! {
    // strips the dimensions suffix from box art URLs (".../game_id-285x380.jpg")
    static ref DIMS_PATTERN: Regex = Regex::new(r"-\d+x\d+(?P<ext>\.(?:jpg|png|gif))$").unwrap();
}

pub fn remove_dimensions(url: &str) -> String {
    DIMS_PATTERN.replace(url, "$ext").into_owned()
}

fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Miner("missing timestamp in campaign data".into()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Miner(format!("bad timestamp {raw:?}: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Game {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub box_art_url: Option<String>,
}

impl Game {
    pub fn from_gql(data: &Value) -> Option<Self> {
        let id = data.get("id")?.as_str()?.to_string();
        let name = data
            .get("displayName")
            .and_then(Value::as_str)
            .or_else(|| data.get("name").and_then(Value::as_str))?
            .to_string();
        Some(Self {
            id,
            name,
            slug: data.get("slug").and_then(Value::as_str).map(str::to_string),
            box_art_url: data
                .get("boxArtURL")
                .and_then(Value::as_str)
                .map(remove_dimensions),
        })
    }

    /// Directory slug, derived from the name when the API didn't provide one.
    pub fn slug(&self) -> String {
        if let Some(slug) = &self.slug {
            return slug.clone();
        }
        let lowered = self.name.to_lowercase().replace('\'', "");
        let mut slug = String::with_capacity(lowered.len());
        let mut last_dash = true;
        for ch in lowered.chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch);
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        slug.trim_matches('-').to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenefitKind {
    Item,
    Badge,
    Emote,
    Other,
}

impl BenefitKind {
    /// Unknown distribution types map to `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "DIRECT_ENTITLEMENT" => Self::Item,
            "BADGE" => Self::Badge,
            "EMOTE" => Self::Emote,
            _ => Self::Other,
        }
    }

    pub fn is_badge_or_emote(self) -> bool {
        matches!(self, Self::Badge | Self::Emote)
    }

    pub fn is_wanted(self, gate: &MiningBenefits) -> bool {
        match self {
            Self::Item => gate.item,
            Self::Badge => gate.badge,
            Self::Emote => gate.emote,
            Self::Other => gate.other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Benefit {
    pub id: String,
    pub name: String,
    pub image_url: String,
    pub kind: BenefitKind,
}

impl Benefit {
    fn from_gql(edge: &Value) -> Option<Self> {
        let benefit = edge.get("benefit")?;
        Some(Self {
            id: benefit.get("id")?.as_str()?.to_string(),
            name: benefit
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            image_url: benefit
                .get("imageAssetURL")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: BenefitKind::parse(
                benefit
                    .get("distributionType")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Upcoming,
    Active,
    Expired,
}

/// A timed drop within a campaign.
#[derive(Debug, Clone)]
pub struct TimedDrop {
    pub id: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub required_minutes: u32,
    pub benefits: Vec<Benefit>,
    pub precondition_ids: Vec<String>,
    pub claim_id: Option<String>,
    pub is_claimed: bool,
    real_minutes: u32,
    extra_minutes: u32,
    last_report_at: Option<DateTime<Utc>>,
}

impl TimedDrop {
    fn from_gql(data: &Value, claimed_benefits: &HashMap<String, DateTime<Utc>>) -> Result<Self> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Miner("drop without an id".into()))?
            .to_string();
        let starts_at = parse_datetime(&data["startAt"])?;
        let ends_at = parse_datetime(&data["endAt"])?;
        let benefits: Vec<Benefit> = data
            .get("benefitEdges")
            .and_then(Value::as_array)
            .map(|edges| edges.iter().filter_map(Benefit::from_gql).collect())
            .unwrap_or_default();
        let required_minutes = data
            .get("requiredMinutesWatched")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let mut claim_id = None;
        let mut is_claimed = false;
        let mut real_minutes = 0;
        if let Some(self_edge) = data.get("self").filter(|v| !v.is_null()) {
            claim_id = self_edge
                .get("dropInstanceID")
                .and_then(Value::as_str)
                .map(str::to_string);
            is_claimed = self_edge
                .get("isClaimed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            real_minutes = self_edge
                .get("currentMinutesWatched")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
        } else if !benefits.is_empty() {
            // No self edge: infer the claim from awarded-benefit timestamps.
            // If every benefit was awarded while this drop was live, the drop
            // has been claimed before.
            let awarded: Vec<&DateTime<Utc>> = benefits
                .iter()
                .filter_map(|b| claimed_benefits.get(&b.id))
                .collect();
            if awarded.len() == benefits.len()
                && awarded.iter().all(|at| starts_at <= **at && **at < ends_at)
            {
                is_claimed = true;
            }
        }
        if is_claimed {
            // claimed drops may report inconsistent minutes
            real_minutes = required_minutes;
        }

        let precondition_ids = data
            .get("preconditionDrops")
            .and_then(Value::as_array)
            .map(|pre| {
                pre.iter()
                    .filter_map(|d| d.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            starts_at,
            ends_at,
            required_minutes,
            benefits,
            precondition_ids,
            claim_id,
            is_claimed,
            real_minutes: real_minutes.min(required_minutes),
            extra_minutes: 0,
            last_report_at: None,
        })
    }

    pub fn current_minutes(&self) -> u32 {
        (self.real_minutes + self.extra_minutes).min(self.required_minutes)
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.required_minutes.saturating_sub(self.current_minutes())
    }

    pub fn is_complete(&self) -> bool {
        self.required_minutes > 0 && self.current_minutes() >= self.required_minutes
    }

    pub fn progress(&self) -> f64 {
        if self.required_minutes == 0 {
            return 0.0;
        }
        (self.current_minutes() as f64 / self.required_minutes as f64).clamp(0.0, 1.0)
    }

    /// Apply an authoritative progress report.
    ///
    /// Applies only when `at` is newer than the last reconciled report; the
    /// server value replaces any extrapolation and is the one place the
    /// counter may go backwards.
    pub fn report_minutes(&mut self, minutes: u32, at: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_report_at {
            if at <= last {
                return false;
            }
        }
        self.last_report_at = Some(at);
        self.real_minutes = minutes.min(self.required_minutes);
        self.extra_minutes = 0;
        true
    }

    pub fn last_report_at(&self) -> Option<DateTime<Utc>> {
        self.last_report_at
    }

    /// Extrapolate one minute of progress; true when the cap was hit.
    pub fn bump_minutes(&mut self) -> bool {
        self.extra_minutes += 1;
        self.extra_minutes >= MAX_EXTRA_MINUTES
    }

    pub fn extra_minutes(&self) -> u32 {
        self.extra_minutes
    }

    pub fn update_claim_id(&mut self, claim_id: String) {
        self.claim_id = Some(claim_id);
    }

    /// Transition to claimed. Monotonic: never reverts.
    pub fn mark_claimed(&mut self) {
        self.is_claimed = true;
        self.real_minutes = self.required_minutes;
        self.extra_minutes = 0;
    }

    // preconditions are checked at the campaign level, where the sibling
    // drops are reachable
    fn base_earn_conditions(&self, in_precondition_chain: bool) -> bool {
        !self.is_claimed
            && self.required_minutes > 0
            && self.extra_minutes < MAX_EXTRA_MINUTES
            && (!self.benefits.is_empty() || in_precondition_chain)
    }

    pub fn rewards_text(&self) -> String {
        self.benefits
            .iter()
            .map(|b| b.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn has_wanted_unclaimed_benefits(&self, gate: &MiningBenefits) -> bool {
        !self.is_claimed && self.benefits.iter().any(|b| b.kind.is_wanted(gate))
    }
}

/// Channel reference carried by an ACL-based campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub id: i64,
    pub login: String,
}

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub game: Game,
    pub linked: bool,
    pub link_url: String,
    pub campaign_url: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub allowed_channels: Vec<AclEntry>,
    pub drops: Vec<TimedDrop>,
    valid: bool,
}

impl Campaign {
    pub fn from_gql(data: &Value, claimed_benefits: &HashMap<String, DateTime<Utc>>) -> Result<Self> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Miner("campaign without an id".into()))?
            .to_string();
        let game = data
            .get("game")
            .and_then(Game::from_gql)
            .ok_or_else(|| Error::Miner(format!("campaign {id} without a game")))?;
        let linked = data
            .pointer("/self/isAccountConnected")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let allowed_channels = match data.get("allow") {
            Some(allow)
                if allow
                    .get("isEnabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(true) =>
            {
                allow
                    .get("channels")
                    .and_then(Value::as_array)
                    .map(|channels| {
                        channels
                            .iter()
                            .filter_map(|ch| {
                                let id = ch.get("id")?.as_str()?.parse().ok()?;
                                let login = ch
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .or_else(|| ch.get("displayName").and_then(Value::as_str))?
                                    .to_lowercase();
                                Some(AclEntry { id, login })
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        };

        let mut drops: Vec<TimedDrop> = data
            .get("timeBasedDrops")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|d| TimedDrop::from_gql(d, claimed_benefits).ok())
                    .collect()
            })
            .unwrap_or_default();

        // reject precondition cycles and over-deep chains
        let invalid = invalid_precondition_drops(&drops);
        if !invalid.is_empty() {
            warn!(
                "[INVENTORY] Campaign {id}: dropping {} drop(s) with broken precondition chains",
                invalid.len()
            );
            drops.retain(|d| !invalid.contains(&d.id));
        }

        Ok(Self {
            campaign_url: format!("https://www.twitch.tv/drops/campaigns?dropID={id}"),
            id,
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            game,
            linked,
            link_url: data
                .get("accountLinkURL")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            starts_at: parse_datetime(&data["startAt"])?,
            ends_at: parse_datetime(&data["endAt"])?,
            allowed_channels,
            drops,
            valid: data.get("status").and_then(Value::as_str) != Some("EXPIRED"),
        })
    }

    pub fn status(&self, now: DateTime<Utc>) -> CampaignStatus {
        if !self.valid || self.ends_at <= now {
            CampaignStatus::Expired
        } else if now < self.starts_at {
            CampaignStatus::Upcoming
        } else {
            CampaignStatus::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == CampaignStatus::Active
    }

    pub fn acl_based(&self) -> bool {
        !self.allowed_channels.is_empty()
    }

    /// The account may earn here when it's linked, or when the campaign only
    /// awards badges/emotes (which need no account link).
    pub fn eligible(&self) -> bool {
        self.linked
            || self
                .drops
                .iter()
                .flat_map(|d| d.benefits.iter())
                .any(|b| b.kind.is_badge_or_emote())
    }

    pub fn total_drops(&self) -> usize {
        self.drops.len()
    }

    pub fn claimed_drops(&self) -> usize {
        self.drops.iter().filter(|d| d.is_claimed).count()
    }

    pub fn finished(&self) -> bool {
        self.drops
            .iter()
            .all(|d| d.is_claimed || d.required_minutes == 0)
    }

    pub fn get_drop(&self, drop_id: &str) -> Option<&TimedDrop> {
        self.drops.iter().find(|d| d.id == drop_id)
    }

    pub fn get_drop_mut(&mut self, drop_id: &str) -> Option<&mut TimedDrop> {
        self.drops.iter_mut().find(|d| d.id == drop_id)
    }

    /// All transitive preconditions of `drop_id` are claimed.
    pub fn preconditions_met(&self, drop_id: &str) -> bool {
        let Some(drop) = self.get_drop(drop_id) else {
            return false;
        };
        drop.precondition_ids.iter().all(|pid| {
            self.get_drop(pid)
                .map(|pre| pre.is_claimed && self.preconditions_met(&pre.id))
                .unwrap_or(false)
        })
    }

    /// Drop IDs referenced as preconditions by unclaimed drops.
    fn precondition_chain(&self) -> HashSet<&str> {
        self.drops
            .iter()
            .filter(|d| !d.is_claimed)
            .flat_map(|d| d.precondition_ids.iter().map(String::as_str))
            .collect()
    }

    fn drop_can_earn(&self, drop: &TimedDrop, now: DateTime<Utc>) -> bool {
        let chained = self.precondition_chain().contains(drop.id.as_str());
        drop.base_earn_conditions(chained)
            && self.preconditions_met(&drop.id)
            && drop.starts_at <= now
            && now < drop.ends_at
    }

    /// A drop is claimable once complete with every precondition claimed,
    /// until 24h past the campaign end.
    pub fn can_claim(&self, drop_id: &str, now: DateTime<Utc>) -> bool {
        let Some(drop) = self.get_drop(drop_id) else {
            return false;
        };
        drop.claim_id.is_some()
            && !drop.is_claimed
            && drop.is_complete()
            && self.preconditions_met(drop_id)
            && now < self.ends_at + Duration::hours(CLAIM_GRACE_HOURS)
    }

    /// Whether any drop can currently be progressed (optionally on a
    /// specific channel, already known to stream this campaign's game).
    pub fn can_earn(&self, channel_id: Option<i64>, now: DateTime<Utc>) -> bool {
        if !self.eligible() || !self.is_active(now) {
            return false;
        }
        if let Some(channel_id) = channel_id {
            if self.acl_based() && !self.allowed_channels.iter().any(|c| c.id == channel_id) {
                return false;
            }
        }
        self.drops.iter().any(|d| self.drop_can_earn(d, now))
    }

    /// Same as `can_earn`, but channel-agnostic and against a future stamp.
    pub fn can_earn_within(&self, stamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.eligible()
            && self.valid
            && self.ends_at > now
            && self.starts_at < stamp
            && self.drops.iter().any(|d| {
                let chained = self.precondition_chain().contains(d.id.as_str());
                d.base_earn_conditions(chained)
                    && self.preconditions_met(&d.id)
                    && d.ends_at > now
                    && d.starts_at < stamp
            })
    }

    /// The drop currently expected to gain progress: earnable, least
    /// remaining minutes.
    pub fn first_drop(&self, now: DateTime<Utc>) -> Option<&TimedDrop> {
        self.drops
            .iter()
            .filter(|d| self.drop_can_earn(d, now))
            .min_by_key(|d| d.remaining_minutes())
    }

    /// Largest remaining minutes across earnable chains, used to order
    /// campaigns by urgency.
    pub fn remaining_minutes(&self) -> u32 {
        self.drops
            .iter()
            .filter(|d| !d.is_claimed)
            .map(|d| d.remaining_minutes())
            .max()
            .unwrap_or(0)
    }

    /// Campaign/drop time boundaries that should wake the maintenance task.
    pub fn time_triggers(&self) -> Vec<DateTime<Utc>> {
        let mut triggers = vec![self.starts_at, self.ends_at];
        for drop in &self.drops {
            triggers.push(drop.starts_at);
            triggers.push(drop.ends_at);
        }
        triggers
    }

    pub fn has_wanted_unclaimed_benefits(&self, gate: &MiningBenefits) -> bool {
        self.drops.iter().any(|d| d.has_wanted_unclaimed_benefits(gate))
    }
}

/// Find drops whose precondition chains contain a cycle, a dangling
/// reference, or exceed the depth cap.
fn invalid_precondition_drops(drops: &[TimedDrop]) -> HashSet<String> {
    let by_id: HashMap<&str, &TimedDrop> = drops.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut invalid = HashSet::new();
    for drop in drops {
        let mut visited = HashSet::new();
        if !walk_preconditions(drop.id.as_str(), &by_id, &mut visited, 0) {
            invalid.insert(drop.id.clone());
        }
    }
    invalid
}

fn walk_preconditions<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a TimedDrop>,
    visited: &mut HashSet<&'a str>,
    depth: usize,
) -> bool {
    if depth > MAX_PRECONDITION_DEPTH {
        return false;
    }
    if !visited.insert(id) {
        return false; // cycle
    }
    let Some(drop) = by_id.get(id) else {
        return false; // dangling reference
    };
    let ok = drop
        .precondition_ids
        .iter()
        .all(|pid| walk_preconditions(pid, by_id, visited, depth + 1));
    visited.remove(id);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn campaign_json(drops: Vec<Value>) -> Value {
        json!({
            "id": "camp-1",
            "name": "Test Campaign",
            "game": {"id": "10", "displayName": "Some Game", "slug": "some-game"},
            "self": {"isAccountConnected": true},
            "accountLinkURL": "https://example.invalid/link",
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "status": "ACTIVE",
            "allow": {"channels": null, "isEnabled": true},
            "timeBasedDrops": drops,
        })
    }

    fn drop_json(id: &str, required: u32, preconditions: Vec<&str>) -> Value {
        json!({
            "id": id,
            "name": format!("Drop {id}"),
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "requiredMinutesWatched": required,
            "benefitEdges": [{"benefit": {
                "id": format!("benefit-{id}"),
                "name": "Reward",
                "imageAssetURL": "https://example.invalid/img.png",
                "distributionType": "DIRECT_ENTITLEMENT",
            }}],
            "preconditionDrops": preconditions.iter().map(|p| json!({"id": p})).collect::<Vec<_>>(),
            "self": {"currentMinutesWatched": 0, "isClaimed": false, "dropInstanceID": null},
        })
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_status_derivation() {
        let campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 60, vec![])]), &HashMap::new())
                .unwrap();
        let before = DateTime::parse_from_rfc3339("2025-12-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let after = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(campaign.status(before), CampaignStatus::Upcoming);
        assert_eq!(campaign.status(now()), CampaignStatus::Active);
        assert_eq!(campaign.status(after), CampaignStatus::Expired);
    }

    #[test]
    fn test_minutes_invariants() {
        let mut campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 5, vec![])]), &HashMap::new())
                .unwrap();
        let drop = campaign.get_drop_mut("d1").unwrap();
        assert!(drop.report_minutes(3, now()));
        assert_eq!(drop.current_minutes(), 3);
        // stale report is ignored
        assert!(!drop.report_minutes(4, now() - Duration::minutes(5)));
        assert_eq!(drop.current_minutes(), 3);
        // over-reporting clamps to required
        assert!(drop.report_minutes(100, now() + Duration::minutes(1)));
        assert_eq!(drop.current_minutes(), 5);
        assert!(drop.is_complete());
    }

    #[test]
    fn test_authoritative_report_may_regress() {
        let mut campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 10, vec![])]), &HashMap::new())
                .unwrap();
        let drop = campaign.get_drop_mut("d1").unwrap();
        drop.report_minutes(4, now());
        drop.bump_minutes();
        drop.bump_minutes();
        assert_eq!(drop.current_minutes(), 6);
        // server snaps us back down, wiping extrapolation
        assert!(drop.report_minutes(5, now() + Duration::minutes(2)));
        assert_eq!(drop.current_minutes(), 5);
        assert_eq!(drop.extra_minutes(), 0);
    }

    #[test]
    fn test_bump_cap() {
        let mut campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 60, vec![])]), &HashMap::new())
                .unwrap();
        let drop = campaign.get_drop_mut("d1").unwrap();
        for _ in 0..MAX_EXTRA_MINUTES - 1 {
            assert!(!drop.bump_minutes());
        }
        assert!(drop.bump_minutes());
    }

    #[test]
    fn test_claim_is_monotonic() {
        let mut campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 5, vec![])]), &HashMap::new())
                .unwrap();
        let drop = campaign.get_drop_mut("d1").unwrap();
        drop.mark_claimed();
        assert!(drop.is_claimed);
        assert_eq!(drop.current_minutes(), 5);
        // a later server report cannot unclaim
        drop.report_minutes(0, now());
        assert!(drop.is_claimed);
    }

    #[test]
    fn test_precondition_chain_eligibility() {
        let mut campaign = Campaign::from_gql(
            &campaign_json(vec![
                drop_json("d1", 5, vec![]),
                drop_json("d2", 5, vec!["d1"]),
                drop_json("d3", 5, vec!["d2"]),
            ]),
            &HashMap::new(),
        )
        .unwrap();
        assert!(campaign.preconditions_met("d1"));
        assert!(!campaign.preconditions_met("d2"));
        assert!(!campaign.preconditions_met("d3"));

        campaign.get_drop_mut("d1").unwrap().mark_claimed();
        assert!(campaign.preconditions_met("d2"));
        assert!(!campaign.preconditions_met("d3"));

        // only d2 is targetable now
        let first = campaign.first_drop(now()).unwrap();
        assert_eq!(first.id, "d2");
    }

    #[test]
    fn test_precondition_cycle_rejected() {
        let campaign = Campaign::from_gql(
            &campaign_json(vec![
                drop_json("d1", 5, vec!["d2"]),
                drop_json("d2", 5, vec!["d1"]),
                drop_json("d3", 5, vec![]),
            ]),
            &HashMap::new(),
        )
        .unwrap();
        // the cycle members are gone, the clean drop survives
        assert!(campaign.get_drop("d1").is_none());
        assert!(campaign.get_drop("d2").is_none());
        assert!(campaign.get_drop("d3").is_some());
    }

    #[test]
    fn test_claimed_inferred_from_benefit_awards() {
        let mut claimed = HashMap::new();
        claimed.insert("benefit-d1".to_string(), now());
        let drops = vec![json!({
            "id": "d1",
            "name": "Drop d1",
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "requiredMinutesWatched": 5,
            "benefitEdges": [{"benefit": {
                "id": "benefit-d1", "name": "Reward",
                "imageAssetURL": "", "distributionType": "BADGE",
            }}],
            "preconditionDrops": null,
            // no self edge: claim state must be inferred
        })];
        let campaign = Campaign::from_gql(&campaign_json(drops), &claimed).unwrap();
        assert!(campaign.get_drop("d1").unwrap().is_claimed);
    }

    #[test]
    fn test_eligible_unlinked_badge_only() {
        let mut data = campaign_json(vec![drop_json("d1", 5, vec![])]);
        data["self"]["isAccountConnected"] = json!(false);
        let campaign = Campaign::from_gql(&data, &HashMap::new()).unwrap();
        // item-only campaign without a link is not eligible
        assert!(!campaign.eligible());

        data["timeBasedDrops"][0]["benefitEdges"][0]["benefit"]["distributionType"] =
            json!("BADGE");
        let campaign = Campaign::from_gql(&data, &HashMap::new()).unwrap();
        assert!(campaign.eligible());
    }

    #[test]
    fn test_benefit_gate_filters_wanted() {
        let campaign =
            Campaign::from_gql(&campaign_json(vec![drop_json("d1", 5, vec![])]), &HashMap::new())
                .unwrap();
        let mut gate = MiningBenefits::default();
        assert!(campaign.has_wanted_unclaimed_benefits(&gate));
        gate.item = false;
        assert!(!campaign.has_wanted_unclaimed_benefits(&gate));
    }

    #[test]
    fn test_unknown_benefit_kind_maps_to_other() {
        assert_eq!(BenefitKind::parse("SOMETHING_NEW"), BenefitKind::Other);
        assert_eq!(BenefitKind::parse("DIRECT_ENTITLEMENT"), BenefitKind::Item);
    }

    #[test]
    fn test_game_slug_derivation() {
        let game = Game {
            id: "1".into(),
            name: "Tom Clancy's The Division 2".into(),
            slug: None,
            box_art_url: None,
        };
        assert_eq!(game.slug(), "tom-clancys-the-division-2");
    }

    #[test]
    fn test_remove_dimensions() {
        assert_eq!(
            remove_dimensions("https://cdn.example/game_id-285x380.jpg"),
            "https://cdn.example/game_id.jpg"
        );
        assert_eq!(remove_dimensions("https://cdn.example/plain.png"), "https://cdn.example/plain.png");
    }
}
