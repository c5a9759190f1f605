use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify, RwLock};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::events::{AppEvent, ControlCommand, DropProgressPayload, EventBus};
use crate::models::channel::Channel;
use crate::models::drops::{AclEntry, Campaign, Game};
use crate::models::settings::Settings;
use crate::services::auth_service::AuthState;
use crate::services::channel_service::{selection_order, should_switch, ChannelService};
use crate::services::http_service::HttpClient;
use crate::services::inventory_service::{drop_payload, InventoryService};
use crate::services::watch_service::{extrapolation_deadline, WatchSignal, WatchTarget};
use crate::services::websocket_service::{TopicKind, WsMessage, WsPool, WsTopic, MAX_CHANNELS};

/// Phases of the mining state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InventoryFetch,
    GamesUpdate,
    ChannelsCleanup,
    ChannelsFetch,
    ChannelSwitch,
    Exit,
}

/// Control operation paired with an optional reply slot.
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

/// After a claim, re-evaluation of the watched channel is immediate but
/// debounced to this much.
const POST_CLAIM_DEBOUNCE: Duration = Duration::from_millis(500);
/// Attempts to observe the next drop rotating in after a claim.
const POST_CLAIM_POLLS: u32 = 8;
const POST_CLAIM_POLL_DELAY: Duration = Duration::from_secs(2);
/// Campaign horizon: a campaign counts as minable if it can progress within
/// the next hour.
const EARN_HORIZON: ChronoDuration = ChronoDuration::hours(1);

/// The mining engine: drives IDLE → INVENTORY_FETCH → GAMES_UPDATE →
/// CHANNELS_CLEANUP → CHANNELS_FETCH → CHANNEL_SWITCH and reacts to
/// pub-sub events, watch-loop signals, maintenance timers and control
/// commands. Owns the domain model; everything else posts to its queues.
pub struct MiningService {
    bus: EventBus,
    http: Arc<HttpClient>,
    auth: Arc<AuthState>,
    inventory: InventoryService,
    channel_service: Arc<ChannelService>,
    ws_pool: Arc<WsPool>,
    settings: Arc<RwLock<Settings>>,
    settings_path: PathBuf,

    // domain model, mutated only from the run loop
    campaigns: Vec<Campaign>,
    drop_index: HashMap<String, usize>,
    channels: BTreeMap<i64, Channel>,
    wanted_games: Vec<Game>,
    watching: Option<i64>,
    manual_target: Option<(i64, Game)>,
    active_drop_id: Option<String>,
    user_id: u64,

    // queues in
    ws_rx: mpsc::UnboundedReceiver<WsMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    watch_rx: mpsc::UnboundedReceiver<WatchSignal>,
    shutdown_rx: watch::Receiver<bool>,

    // watch loop out
    target_tx: watch::Sender<Option<WatchTarget>>,
    restart_watching: Arc<Notify>,

    state: State,
    full_cleanup: bool,
    /// Triggers coalesce: any number of wake-ups during a phase fold into
    /// one pending re-entry.
    pending_reentry: bool,
    maintenance_triggers: VecDeque<DateTime<Utc>>,
    next_reload: Instant,
    last_authoritative: Option<Instant>,
    last_claim: Option<Instant>,
}

impl MiningService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        http: Arc<HttpClient>,
        auth: Arc<AuthState>,
        gql: Arc<crate::services::gql_service::GqlClient>,
        channel_service: Arc<ChannelService>,
        ws_pool: Arc<WsPool>,
        settings: Arc<RwLock<Settings>>,
        settings_path: PathBuf,
        ws_rx: mpsc::UnboundedReceiver<WsMessage>,
        control_rx: mpsc::UnboundedReceiver<ControlRequest>,
        watch_rx: mpsc::UnboundedReceiver<WatchSignal>,
        target_tx: watch::Sender<Option<WatchTarget>>,
        restart_watching: Arc<Notify>,
    ) -> Self {
        let shutdown_rx = bus.shutdown_rx();
        Self {
            inventory: InventoryService::new(gql, bus.clone()),
            bus,
            http,
            auth,
            channel_service,
            ws_pool,
            settings,
            settings_path,
            campaigns: Vec::new(),
            drop_index: HashMap::new(),
            channels: BTreeMap::new(),
            wanted_games: Vec::new(),
            watching: None,
            manual_target: None,
            active_drop_id: None,
            user_id: 0,
            ws_rx,
            control_rx,
            watch_rx,
            shutdown_rx,
            target_tx,
            restart_watching,
            state: State::Idle,
            full_cleanup: false,
            pending_reentry: false,
            maintenance_triggers: VecDeque::new(),
            next_reload: Instant::now() + Duration::from_secs(3600),
            last_authoritative: None,
            last_claim: None,
        }
    }

    /// Main loop. Returns when shutdown is requested.
    pub async fn run(mut self) -> Result<()> {
        self.user_id = self.auth.validate().await?;
        self.ws_pool
            .add_topics(vec![
                WsTopic::new(TopicKind::UserDrops, self.user_id as i64),
                WsTopic::new(TopicKind::UserNotifications, self.user_id as i64),
            ])
            .await;
        self.state = State::InventoryFetch;

        loop {
            if *self.shutdown_rx.borrow() {
                self.state = State::Exit;
            }
            match self.state {
                State::Idle => {
                    self.bus.status("Idle");
                    self.stop_watching();
                    self.idle_wait().await;
                }
                State::InventoryFetch => match self.phase_inventory_fetch().await {
                    Ok(()) => self.state = State::GamesUpdate,
                    Err(Error::ExitRequest) => self.state = State::Exit,
                    Err(e) => {
                        // a failed fetch aborts the phase, not the miner
                        error!("[MINER] Inventory fetch failed: {e}");
                        self.bus.print(format!("Inventory fetch failed, retrying later: {e}"));
                        self.schedule_reload().await;
                        self.state = State::Idle;
                    }
                },
                State::GamesUpdate => {
                    self.phase_games_update().await;
                    self.state = State::ChannelsCleanup;
                }
                State::ChannelsCleanup => {
                    self.phase_channels_cleanup().await;
                }
                State::ChannelsFetch => match self.phase_channels_fetch().await {
                    Ok(()) => self.state = State::ChannelSwitch,
                    Err(Error::ExitRequest) => self.state = State::Exit,
                    Err(e) => {
                        error!("[MINER] Channel fetch failed: {e}");
                        self.schedule_reload().await;
                        self.state = State::Idle;
                    }
                },
                State::ChannelSwitch => {
                    self.phase_channel_switch().await;
                }
                State::Exit => break,
            }
            // events that arrived mid-phase are handled before the next one
            self.drain_pending_events().await;
        }

        self.bus.status("Exiting...");
        self.stop_watching();
        self.ws_pool.stop().await;
        self.http.jar().save().await.ok();
        Ok(())
    }

    // ------------------------------------------------------------------
    // phases
    // ------------------------------------------------------------------

    async fn phase_inventory_fetch(&mut self) -> Result<()> {
        let campaigns = self.inventory.fetch_inventory(self.user_id).await?;
        self.campaigns = campaigns;
        self.drop_index.clear();
        for (idx, campaign) in self.campaigns.iter().enumerate() {
            for drop in &campaign.drops {
                self.drop_index.insert(drop.id.clone(), idx);
            }
        }

        self.bus.publish(AppEvent::InventoryClear);
        self.inventory.publish_inventory(&self.campaigns);

        // maintenance wake-ups: campaign/drop boundaries within reach, each
        // a minute early so the switch happens before the boundary hits
        let now = Utc::now();
        let next_hour = now + EARN_HORIZON;
        let mut triggers: Vec<DateTime<Utc>> = self
            .campaigns
            .iter()
            .filter(|c| c.can_earn_within(next_hour, now))
            .flat_map(|c| c.time_triggers())
            .map(|t| t - ChronoDuration::minutes(1))
            .filter(|t| *t > now)
            .collect();
        triggers.sort();
        triggers.dedup();
        self.maintenance_triggers = triggers.into();
        self.schedule_reload().await;

        self.save_settings().await;
        Ok(())
    }

    async fn phase_games_update(&mut self) {
        // claim whatever is already finished
        let now = Utc::now();
        let claimable: Vec<(usize, String)> = self
            .campaigns
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c.status(now), crate::models::drops::CampaignStatus::Upcoming))
            .flat_map(|(idx, c)| {
                c.drops
                    .iter()
                    .filter(|d| c.can_claim(&d.id, now))
                    .map(move |d| (idx, d.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (idx, drop_id) in claimable {
            let mut campaign = self.campaigns[idx].clone();
            self.inventory.claim_drop(self.user_id, &mut campaign, &drop_id).await;
            self.campaigns[idx] = campaign;
        }

        // wanted-games set, in priority order
        let settings = self.settings.read().await.clone();
        let next_hour = Utc::now() + EARN_HORIZON;
        let now = Utc::now();
        self.wanted_games.clear();
        if settings.games_to_watch.is_empty() {
            // no priority list: every earnable campaign's game is wanted
            for campaign in &self.campaigns {
                if campaign.can_earn_within(next_hour, now)
                    && campaign.has_wanted_unclaimed_benefits(&settings.mining_benefits)
                    && !self.wanted_games.iter().any(|g| g.id == campaign.game.id)
                {
                    self.wanted_games.push(campaign.game.clone());
                }
            }
        } else {
            for game_name in &settings.games_to_watch {
                let lowered = game_name.to_lowercase();
                for campaign in &self.campaigns {
                    if campaign.game.name.to_lowercase() == lowered
                        && campaign.can_earn_within(next_hour, now)
                        && campaign.has_wanted_unclaimed_benefits(&settings.mining_benefits)
                        && !self.wanted_games.iter().any(|g| g.id == campaign.game.id)
                    {
                        self.wanted_games.push(campaign.game.clone());
                        break;
                    }
                }
            }
        }
        if self.wanted_games.is_empty() {
            warn!(
                "[MINER] No wanted games (games_to_watch: {:?}, campaigns: {})",
                settings.games_to_watch,
                self.campaigns.len()
            );
        } else {
            info!(
                "[MINER] Wanted games: {}",
                self.wanted_games.iter().map(|g| g.name.as_str()).collect::<Vec<_>>().join(", ")
            );
        }

        // manual mode: drop it when its game is mined out, keep it in front
        // of the priority order otherwise
        if let Some((_, manual_game)) = self.manual_target.clone() {
            let still_earnable = self.campaigns.iter().any(|c| {
                c.game.id == manual_game.id && c.can_earn_within(next_hour, now)
            });
            if !still_earnable {
                self.exit_manual_mode("all drops completed for the selected game");
            } else if let Some(pos) = self.wanted_games.iter().position(|g| g.id == manual_game.id)
            {
                let game = self.wanted_games.remove(pos);
                self.wanted_games.insert(0, game);
            }
        }

        let games: Vec<String> = self
            .campaigns
            .iter()
            .map(|c| c.game.name.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        self.bus.publish(AppEvent::GamesAvailable { list: games });
        self.bus.publish(AppEvent::WantedItemsUpdate {
            tree: self.inventory.wanted_tree(&settings, &self.campaigns, now),
        });

        self.full_cleanup = true;
        self.restart_watching.notify_one();
    }

    async fn phase_channels_cleanup(&mut self) {
        self.bus.status("Cleaning up channels...");
        let to_remove: Vec<i64> = if self.wanted_games.is_empty() || self.full_cleanup {
            self.channels.keys().copied().collect()
        } else {
            self.channels
                .values()
                .filter(|ch| {
                    !ch.acl_based
                        && (!ch.online()
                            || ch
                                .game()
                                .map(|g| !self.wanted_games.iter().any(|w| w.id == g.id))
                                .unwrap_or(true))
                })
                .map(|ch| ch.id)
                .collect()
        };
        self.full_cleanup = false;
        if !to_remove.is_empty() {
            let topics: Vec<String> = to_remove
                .iter()
                .flat_map(|id| {
                    [
                        WsTopic::new(TopicKind::ChannelStreamState, *id).as_str(),
                        WsTopic::new(TopicKind::ChannelStreamUpdate, *id).as_str(),
                    ]
                })
                .collect();
            self.ws_pool.remove_topics(&topics).await;
            for id in &to_remove {
                self.channels.remove(id);
                self.bus.publish(AppEvent::ChannelRemove { id: id.to_string() });
            }
        }
        if self.wanted_games.is_empty() {
            self.bus.publish(AppEvent::ChannelsClear);
            self.bus.print("No active campaigns to mine, idling");
            self.state = State::Idle;
        } else {
            self.state = State::ChannelsFetch;
        }
    }

    async fn phase_channels_fetch(&mut self) -> Result<()> {
        self.bus.status("Gathering channels...");
        let now = Utc::now();
        let next_hour = now + EARN_HORIZON;

        let mut gathered: HashMap<i64, Channel> = std::mem::take(&mut self.channels)
            .into_values()
            .map(|ch| (ch.id, ch))
            .collect();

        // ACL channels from earnable campaigns of wanted games; games with
        // no ACL fall back to the directory
        let mut acl_entries: Vec<AclEntry> = Vec::new();
        let mut directory_games: Vec<Game> = Vec::new();
        for campaign in &self.campaigns {
            if !self.wanted_games.iter().any(|g| g.id == campaign.game.id)
                || !campaign.can_earn_within(next_hour, now)
            {
                continue;
            }
            if campaign.acl_based() {
                for entry in &campaign.allowed_channels {
                    if !gathered.contains_key(&entry.id)
                        && !acl_entries.iter().any(|e| e.id == entry.id)
                    {
                        acl_entries.push(entry.clone());
                    }
                }
            } else if !directory_games.iter().any(|g| g.id == campaign.game.id) {
                directory_games.push(campaign.game.clone());
            }
        }

        for channel in self.channel_service.bulk_check_online(&acl_entries).await? {
            gathered.entry(channel.id).or_insert(channel);
        }
        for game in &directory_games {
            match self.channel_service.get_live_streams(game, 30).await {
                Ok(channels) => {
                    for channel in channels {
                        gathered.entry(channel.id).or_insert(channel);
                    }
                }
                Err(e) => warn!("[MINER] Directory fetch failed for {}: {e}", game.name),
            }
        }

        // order and cap; the tail is where offline and low-priority
        // channels end up
        let mut ordered: Vec<&Channel> = gathered.values().collect();
        selection_order(&mut ordered, &self.wanted_games);
        let keep_ids: Vec<i64> = ordered.iter().take(MAX_CHANNELS).map(|ch| ch.id).collect();
        let dropped: Vec<i64> = ordered.iter().skip(MAX_CHANNELS).map(|ch| ch.id).collect();
        drop(ordered);
        if !dropped.is_empty() {
            let topics: Vec<String> = dropped
                .iter()
                .flat_map(|id| {
                    [
                        WsTopic::new(TopicKind::ChannelStreamState, *id).as_str(),
                        WsTopic::new(TopicKind::ChannelStreamUpdate, *id).as_str(),
                    ]
                })
                .collect();
            self.ws_pool.remove_topics(&topics).await;
        }
        self.channels = keep_ids
            .iter()
            .filter_map(|id| gathered.remove(id).map(|ch| (*id, ch)))
            .collect();

        // one batched surface update beats hundreds of channel_add events
        let list: Vec<_> = self
            .channels
            .values()
            .map(|ch| ch.payload(self.watching == Some(ch.id)))
            .collect();
        self.bus.publish(AppEvent::ChannelsBatchUpdate { list });

        let topics: Vec<WsTopic> = self
            .channels
            .keys()
            .flat_map(|id| {
                [
                    WsTopic::new(TopicKind::ChannelStreamState, *id),
                    WsTopic::new(TopicKind::ChannelStreamUpdate, *id),
                ]
            })
            .collect();
        self.ws_pool.add_topics(topics).await;

        // the watched channel may have been replaced by a fresh object or
        // dropped entirely; CHANNEL_SWITCH sorts out the rest
        if let Some(watching) = self.watching {
            if !self.channels.contains_key(&watching) {
                self.watching = None;
            }
        }
        Ok(())
    }

    async fn phase_channel_switch(&mut self) {
        self.bus.status("Switching channels...");
        // post-claim re-evaluation is immediate, but debounced
        if let Some(last_claim) = self.last_claim {
            let since = last_claim.elapsed();
            if since < POST_CLAIM_DEBOUNCE {
                tokio::time::sleep(POST_CLAIM_DEBOUNCE - since).await;
            }
        }

        let new_watching: Option<i64> = if let Some((manual_id, manual_game)) =
            self.manual_target.clone()
        {
            // manual mode pins the channel; if it went offline, stay on the
            // same game, and leave manual mode when the game has nothing left
            if self.channels.get(&manual_id).map(|ch| self.can_watch(ch)).unwrap_or(false) {
                Some(manual_id)
            } else {
                let fallback = self
                    .channels
                    .values()
                    .filter(|ch| {
                        ch.game().map(|g| g.id == manual_game.id).unwrap_or(false)
                            && self.can_watch(ch)
                    })
                    .map(|ch| ch.id)
                    .next();
                match fallback {
                    Some(id) => {
                        info!("[MINER] Manual mode: switching to a peer channel for {}", manual_game.name);
                        self.manual_target = Some((id, manual_game));
                        Some(id)
                    }
                    None => {
                        self.exit_manual_mode("no channels available for the selected game");
                        None
                    }
                }
            }
        } else {
            None
        };

        let new_watching = new_watching.or_else(|| {
            let current = self.watching.and_then(|id| self.channels.get(&id));
            let mut candidates: Vec<&Channel> =
                self.channels.values().filter(|ch| self.can_watch(ch)).collect();
            selection_order(&mut candidates, &self.wanted_games);
            candidates
                .into_iter()
                .find(|ch| should_switch(current, ch, &self.wanted_games))
                .map(|ch| ch.id)
        });

        if let Some(id) = new_watching {
            self.watch_channel(id).await;
            self.state = State::Idle;
        } else if self
            .watching
            .and_then(|id| self.channels.get(&id))
            .map(|ch| self.can_watch(ch))
            .unwrap_or(false)
        {
            // keep the current channel
            let id = self.watching.expect("checked above");
            self.update_watch_status(id).await;
            self.state = State::Idle;
        } else {
            self.bus.print("No channels available to watch, idling");
            self.state = State::Idle;
            self.stop_watching();
        }
    }

    // ------------------------------------------------------------------
    // watching
    // ------------------------------------------------------------------

    fn can_watch(&self, channel: &Channel) -> bool {
        if self.wanted_games.is_empty() || !channel.online() || !channel.drops_enabled() {
            return false;
        }
        let Some(game) = channel.game() else {
            return false;
        };
        if !self.wanted_games.iter().any(|g| g.id == game.id) {
            return false;
        }
        let now = Utc::now();
        self.campaigns
            .iter()
            .any(|c| campaign_matches_channel(c, channel) && c.can_earn(Some(channel.id), now))
    }

    fn active_campaign_for(&self, channel: &Channel) -> Option<&Campaign> {
        let now = Utc::now();
        self.campaigns
            .iter()
            .filter(|c| campaign_matches_channel(c, channel) && c.can_earn(Some(channel.id), now))
            .min_by_key(|c| c.remaining_minutes())
    }

    async fn watch_channel(&mut self, id: i64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        let target = WatchTarget {
            channel_id: id,
            login: channel.login.clone(),
            broadcast_id: channel
                .stream
                .as_ref()
                .map(|s| s.broadcast_id.clone())
                .unwrap_or_default(),
        };
        let changed = self.watching != Some(id);
        self.watching = Some(id);
        let _ = self.target_tx.send(Some(target));
        if changed {
            self.bus.publish(AppEvent::ChannelWatching { id: id.to_string() });
            self.restart_watching.notify_one();
        }
        self.update_watch_status(id).await;

        // pre-display the drop we expect to progress
        let expected = self
            .channels
            .get(&id)
            .and_then(|channel| self.active_campaign_for(channel))
            .and_then(|campaign| {
                campaign
                    .first_drop(Utc::now())
                    .map(|drop| (drop.id.clone(), progress_payload(campaign, &drop.id)))
            });
        if let Some((drop_id, payload)) = expected {
            self.active_drop_id = Some(drop_id);
            if let Some(payload) = payload {
                self.bus.publish(AppEvent::DropProgress(payload));
            }
        }
    }

    async fn update_watch_status(&self, id: i64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        let status = if self.manual_target.is_some() {
            format!("Manual mode: watching {}", channel.display_name)
        } else {
            format!("Watching: {}", channel.display_name)
        };
        self.bus.print(status.clone());
        self.bus.status(status);
    }

    fn stop_watching(&mut self) {
        if self.watching.take().is_some() {
            let _ = self.target_tx.send(None);
            self.bus.publish(AppEvent::ChannelWatchingClear);
            self.bus.publish(AppEvent::DropProgressStop);
        }
        self.active_drop_id = None;
    }

    fn exit_manual_mode(&mut self, reason: &str) {
        if self.manual_target.take().is_some() {
            info!("[MINER] Exiting manual mode: {reason}");
            self.bus.publish(AppEvent::ManualModeUpdate { active: false, game_name: None });
        }
    }

    // ------------------------------------------------------------------
    // event handling
    // ------------------------------------------------------------------

    /// Sleep in IDLE until something wants a phase to run.
    async fn idle_wait(&mut self) {
        loop {
            if self.pending_reentry {
                self.pending_reentry = false;
                self.state = State::InventoryFetch;
                return;
            }
            let next_maintenance = self.next_maintenance_sleep();
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    self.state = State::Exit;
                    return;
                }
                _ = tokio::time::sleep_until(self.next_reload) => {
                    info!("[MINER] Scheduled inventory reload");
                    self.state = State::InventoryFetch;
                    return;
                }
                _ = tokio::time::sleep(next_maintenance) => {
                    // a campaign/drop boundary passed: re-evaluate channels
                    let now = Utc::now();
                    if matches!(self.maintenance_triggers.front(), Some(at) if *at <= now) {
                        self.pop_due_triggers();
                        info!("[MINER] Campaign boundary reached, cleaning up");
                        self.state = State::ChannelsCleanup;
                        return;
                    }
                }
                message = self.ws_rx.recv() => {
                    if let Some(message) = message {
                        self.handle_ws_message(message).await;
                    }
                }
                signal = self.watch_rx.recv() => {
                    if let Some(signal) = signal {
                        self.handle_watch_signal(signal).await;
                    }
                }
                request = self.control_rx.recv() => {
                    if let Some(request) = request {
                        self.handle_control(request).await;
                    }
                }
            }
            if self.state != State::Idle {
                return;
            }
        }
    }

    /// Handle events that queued up while a phase was running, without
    /// blocking. Phase changes they request coalesce into the next loop
    /// iteration.
    async fn drain_pending_events(&mut self) {
        loop {
            if let Ok(message) = self.ws_rx.try_recv() {
                self.handle_ws_message(message).await;
                continue;
            }
            if let Ok(signal) = self.watch_rx.try_recv() {
                self.handle_watch_signal(signal).await;
                continue;
            }
            if let Ok(request) = self.control_rx.try_recv() {
                self.handle_control(request).await;
                continue;
            }
            break;
        }
    }

    fn next_maintenance_sleep(&self) -> Duration {
        let now = Utc::now();
        match self.maintenance_triggers.front() {
            Some(at) if *at > now => (*at - now).to_std().unwrap_or(Duration::from_secs(0)),
            Some(_) => Duration::from_secs(0),
            None => Duration::from_secs(3600),
        }
    }

    fn pop_due_triggers(&mut self) {
        let now = Utc::now();
        while matches!(self.maintenance_triggers.front(), Some(at) if *at <= now) {
            self.maintenance_triggers.pop_front();
        }
    }

    async fn schedule_reload(&mut self) {
        let floor = self.settings.read().await.minimum_refresh_interval_minutes;
        let minutes = floor.max(60) as u64;
        self.next_reload = Instant::now() + Duration::from_secs(minutes * 60);
    }

    async fn handle_ws_message(&mut self, message: WsMessage) {
        match message {
            WsMessage::DropProgress { drop_id, current_minutes, .. } => {
                self.handle_drop_progress(&drop_id, current_minutes).await;
            }
            WsMessage::DropClaim { drop_id, drop_instance_id } => {
                self.handle_drop_claim(&drop_id, drop_instance_id).await;
            }
            WsMessage::Notification { id, kind } => {
                if kind == "user_drop_reward_reminder_notification" {
                    self.request_reentry();
                    self.inventory.delete_notification(&id).await.ok();
                }
            }
            WsMessage::StreamUp { channel_id } => {
                self.refresh_channel(channel_id).await;
            }
            WsMessage::StreamDown { channel_id } => {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.set_stream(None);
                    let payload = channel.payload(false);
                    self.bus.publish(AppEvent::ChannelUpdate(payload));
                    if self.watching == Some(channel_id) {
                        self.bus.print(format!(
                            "{} went offline, switching...",
                            channel.display_name.clone()
                        ));
                        self.stop_watching();
                        self.state = State::ChannelSwitch;
                    }
                }
            }
            WsMessage::ViewersUpdate { channel_id, viewers } => {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    if channel.online() {
                        channel.set_viewers(viewers);
                        let watching = self.watching == Some(channel_id);
                        let payload = channel.payload(watching);
                        self.bus.publish(AppEvent::ChannelUpdate(payload));
                    } else {
                        // viewer updates for an "offline" channel mean we
                        // missed the stream-up
                        self.refresh_channel(channel_id).await;
                    }
                }
            }
            WsMessage::StreamSettingsUpdate { channel_id } => {
                // game or title changed; re-fetch to see what it is now
                self.refresh_channel(channel_id).await;
            }
        }
    }

    async fn handle_drop_progress(&mut self, drop_id: &str, current_minutes: u32) {
        self.last_authoritative = Some(Instant::now());
        let now = Utc::now();
        let Some(&idx) = self.drop_index.get(drop_id) else {
            return;
        };
        {
            let campaign = &mut self.campaigns[idx];
            if let Some(drop) = campaign.get_drop_mut(drop_id) {
                drop.report_minutes(current_minutes, now);
            }
        }
        // progress on a sibling drop means our pick was wrong; re-resolve
        if self.active_drop_id.as_deref() != Some(drop_id) {
            if let Some(watching) = self.watching {
                match self.inventory.current_drop_id(watching).await {
                    Ok(Some(current)) => self.active_drop_id = Some(current),
                    Ok(None) => {}
                    Err(e) => warn!("[MINER] Current drop lookup failed: {e}"),
                }
            }
        }

        let campaign = &self.campaigns[idx];
        if let Some(payload) = progress_payload(campaign, drop_id) {
            self.bus.publish(AppEvent::DropProgress(payload));
        }
        self.bus.publish(AppEvent::DropUpdate {
            campaign_id: campaign.id.clone(),
            drop: drop_payload(campaign.get_drop(drop_id).expect("indexed")),
        });

        // completion triggers the claim
        if campaign.can_claim(drop_id, now) {
            let mut campaign = self.campaigns[idx].clone();
            if self.inventory.claim_drop(self.user_id, &mut campaign, drop_id).await {
                self.campaigns[idx] = campaign;
                self.after_claim(drop_id).await;
            }
        }
    }

    async fn handle_drop_claim(&mut self, drop_id: &str, drop_instance_id: String) {
        let Some(&idx) = self.drop_index.get(drop_id) else {
            error!("[MINER] Claim notice for unknown drop: {drop_id}");
            return;
        };
        let mut campaign = self.campaigns[idx].clone();
        if let Some(drop) = campaign.get_drop_mut(drop_id) {
            drop.update_claim_id(drop_instance_id);
        }
        if self.inventory.claim_drop(self.user_id, &mut campaign, drop_id).await {
            self.campaigns[idx] = campaign;
            self.after_claim(drop_id).await;
        }
    }

    /// Post-claim: wait for the platform to rotate the next drop in, then
    /// either resume watching or reload the inventory.
    async fn after_claim(&mut self, drop_id: &str) {
        self.last_claim = Some(Instant::now());
        self.bus.publish(AppEvent::DropProgressStop);
        self.active_drop_id = None;

        let Some(watching) = self.watching else {
            return;
        };
        // the next drop can take a moment to register server-side
        for _ in 0..POST_CLAIM_POLLS {
            tokio::time::sleep(POST_CLAIM_POLL_DELAY).await;
            match self.inventory.current_drop_id(watching).await {
                Ok(Some(current)) if current != drop_id => {
                    self.active_drop_id = Some(current);
                    break;
                }
                Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(_) => break,
            }
        }

        let still_earnable = self
            .channels
            .get(&watching)
            .map(|ch| self.can_watch(ch))
            .unwrap_or(false);
        if still_earnable {
            self.restart_watching.notify_one();
            self.state = State::ChannelSwitch;
        } else {
            self.request_reentry();
        }
    }

    async fn handle_watch_signal(&mut self, signal: WatchSignal) {
        match signal {
            WatchSignal::MinuteTick => self.handle_minute_tick().await,
            WatchSignal::BeaconLost { channel_id } => {
                if self.watching == Some(channel_id) {
                    self.refresh_channel(channel_id).await;
                    let still_live = self
                        .channels
                        .get(&channel_id)
                        .map(Channel::online)
                        .unwrap_or(false);
                    if !still_live {
                        self.stop_watching();
                        self.state = State::ChannelSwitch;
                    }
                }
            }
        }
    }

    /// A wall minute of watching passed. When the server has been quiet for
    /// longer than the heartbeat interval plus grace, fall back to the
    /// current-drop query, then to blind extrapolation.
    async fn handle_minute_tick(&mut self) {
        let Some(watching) = self.watching else {
            return;
        };
        let interval = self.settings.read().await.heartbeat_interval();
        let deadline = extrapolation_deadline(interval);
        if matches!(self.last_authoritative, Some(at) if at.elapsed() < deadline) {
            return;
        }

        // authoritative-over-extrapolated: ask the server first
        if let Ok(Some(drop_id)) = self.inventory.current_drop_id(watching).await {
            if let Some(&idx) = self.drop_index.get(&drop_id) {
                self.active_drop_id = Some(drop_id.clone());
                let campaign = &self.campaigns[idx];
                if let Some(payload) = progress_payload(campaign, &drop_id) {
                    self.bus.publish(AppEvent::DropProgress(payload));
                }
                return;
            }
        }

        // blind bump on the drop we believe is progressing
        let Some(active_drop_id) = self.active_drop_id.clone() else {
            return;
        };
        let Some(&idx) = self.drop_index.get(&active_drop_id) else {
            return;
        };
        let campaign = &mut self.campaigns[idx];
        let capped = campaign
            .get_drop_mut(&active_drop_id)
            .map(|d| d.bump_minutes())
            .unwrap_or(false);
        let campaign = &self.campaigns[idx];
        if let Some(payload) = progress_payload(campaign, &active_drop_id) {
            self.bus.publish(AppEvent::DropProgress(payload));
        }
        if capped {
            warn!("[MINER] Extrapolation cap reached, re-evaluating channel");
            self.state = State::ChannelSwitch;
        }
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        let result = self.apply_control(request.command).await;
        if let Some(reply) = request.reply {
            let _ = reply.send(result);
        }
    }

    async fn apply_control(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::SelectChannel { id } => {
                let channel_id: i64 = id
                    .parse()
                    .map_err(|_| Error::ChannelNotFound(id.clone()))?;
                let channel = self
                    .channels
                    .get(&channel_id)
                    .ok_or_else(|| Error::ChannelNotFound(id.clone()))?;
                if !channel.online() {
                    return Err(Error::ChannelOffline(channel.display_name.clone()));
                }
                let game = channel
                    .game()
                    .cloned()
                    .ok_or_else(|| Error::ChannelOffline(channel.display_name.clone()))?;
                info!("[MINER] Manual mode: {} ({})", channel.display_name, game.name);
                self.manual_target = Some((channel_id, game.clone()));
                self.bus.publish(AppEvent::ManualModeUpdate {
                    active: true,
                    game_name: Some(game.name),
                });
                self.state = State::ChannelSwitch;
                Ok(())
            }
            ControlCommand::ExitManualMode => {
                self.exit_manual_mode("user request");
                self.state = State::ChannelSwitch;
                Ok(())
            }
            ControlCommand::Reload => {
                self.request_reentry();
                Ok(())
            }
            ControlCommand::SetSettings { patch } => {
                let (proxy_before, games_before) = {
                    let settings = self.settings.read().await;
                    (settings.proxy.clone(), settings.games_to_watch.clone())
                };
                let (settings_after, dark_mode) = {
                    let mut settings = self.settings.write().await;
                    settings
                        .apply_patch(&patch)
                        .map_err(|e| Error::Miner(format!("bad settings patch: {e}")))?;
                    (settings.clone(), settings.dark_mode)
                };
                settings_after
                    .save(&self.settings_path)
                    .map_err(|e| Error::Miner(format!("saving settings: {e}")))?;
                if settings_after.proxy != proxy_before {
                    let proxy = (!settings_after.proxy.is_empty())
                        .then(|| settings_after.proxy.clone());
                    self.http.set_proxy(proxy).await?;
                }
                self.bus.publish(AppEvent::SettingsUpdated);
                if patch.get("dark_mode").is_some() {
                    self.bus.publish(AppEvent::ThemeChange { dark_mode });
                }
                if settings_after.games_to_watch != games_before {
                    // priority change: recompute the wanted set
                    self.state = State::GamesUpdate;
                }
                Ok(())
            }
            ControlCommand::VerifyProxy { url } => HttpClient::verify_proxy(&url).await,
        }
    }

    fn request_reentry(&mut self) {
        if self.state == State::Idle {
            self.state = State::InventoryFetch;
        } else {
            self.pending_reentry = true;
        }
    }

    /// Re-fetch a channel's stream and run the transition bookkeeping.
    async fn refresh_channel(&mut self, channel_id: i64) {
        let Some(login) = self.channels.get(&channel_id).map(|ch| ch.login.clone()) else {
            error!("[MINER] Stream event for an untracked channel: {channel_id}");
            return;
        };
        let stream = match self.channel_service.fetch_stream(&login).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[MINER] Stream refresh failed for {login}: {e}");
                return;
            }
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let before_online = channel.online();
        channel.set_stream(stream);
        let after_online = channel.online();
        let watching_this = self.watching == Some(channel_id);
        let payload = channel.payload(watching_this);
        self.bus.publish(AppEvent::ChannelUpdate(payload));

        let channel = self.channels.get(&channel_id).expect("present above");
        if !before_online && after_online {
            // OFFLINE -> ONLINE: maybe it beats the current pick
            if self.can_watch(channel) {
                let current = self.watching.and_then(|id| self.channels.get(&id));
                if should_switch(current, channel, &self.wanted_games) {
                    self.bus.print(format!("{} went online", channel.display_name));
                    self.state = State::ChannelSwitch;
                }
            }
        } else if before_online && !after_online && watching_this {
            self.bus.print(format!("{} went offline, switching...", channel.display_name));
            self.stop_watching();
            self.state = State::ChannelSwitch;
        } else if after_online && watching_this && !self.can_watch(channel) {
            // still live, but the game changed or rewards were disabled
            self.state = State::ChannelSwitch;
        }
    }

    async fn save_settings(&self) {
        let settings = self.settings.read().await;
        if let Err(e) = settings.save(&self.settings_path) {
            warn!("[MINER] Failed to save settings: {e}");
        }
    }
}

fn campaign_matches_channel(campaign: &Campaign, channel: &Channel) -> bool {
    if campaign.acl_based() {
        campaign.allowed_channels.iter().any(|e| e.id == channel.id)
    } else {
        match (channel.game(), &campaign.game) {
            (Some(game), campaign_game) => game.id == campaign_game.id,
            _ => false,
        }
    }
}

fn progress_payload(campaign: &Campaign, drop_id: &str) -> Option<DropProgressPayload> {
    let drop = campaign.get_drop(drop_id)?;
    Some(DropProgressPayload {
        drop_id: drop.id.clone(),
        campaign_id: campaign.id.clone(),
        campaign_name: campaign.name.clone(),
        game_name: campaign.game.name.clone(),
        drop_name: drop.name.clone(),
        current_minutes: drop.current_minutes(),
        required_minutes: drop.required_minutes,
        progress: drop.progress(),
        remaining_seconds: drop.remaining_minutes() as u64 * 60,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn game(id: &str, name: &str) -> Game {
        Game { id: id.into(), name: name.into(), slug: None, box_art_url: None }
    }

    fn directory_channel(id: i64, game_ref: &Game, viewers: u64) -> Channel {
        let node = json!({
            "id": format!("b{id}"),
            "viewersCount": viewers,
            "broadcaster": {"id": id.to_string(), "login": format!("chan{id}")},
        });
        Channel::from_directory(&node, game_ref).unwrap()
    }

    fn campaign_for(game_ref: &Game, acl: Vec<i64>) -> Campaign {
        let allow = if acl.is_empty() {
            json!({"channels": null})
        } else {
            json!({"channels": acl.iter()
                .map(|id| json!({"id": id.to_string(), "name": format!("chan{id}")}))
                .collect::<Vec<_>>(), "isEnabled": true})
        };
        let data = json!({
            "id": format!("camp-{}", game_ref.id),
            "name": format!("Campaign {}", game_ref.name),
            "game": {"id": game_ref.id.clone(), "displayName": game_ref.name.clone()},
            "self": {"isAccountConnected": true},
            "accountLinkURL": "",
            "startAt": "2020-01-01T00:00:00Z",
            "endAt": "2099-01-01T00:00:00Z",
            "status": "ACTIVE",
            "allow": allow,
            "timeBasedDrops": [{
                "id": format!("drop-{}", game_ref.id),
                "name": "Drop",
                "startAt": "2020-01-01T00:00:00Z",
                "endAt": "2099-01-01T00:00:00Z",
                "requiredMinutesWatched": 60,
                "benefitEdges": [{"benefit": {
                    "id": format!("benefit-{}", game_ref.id), "name": "Reward",
                    "imageAssetURL": "", "distributionType": "DIRECT_ENTITLEMENT",
                }}],
                "preconditionDrops": null,
                "self": {"currentMinutesWatched": 0, "isClaimed": false, "dropInstanceID": null},
            }],
        });
        Campaign::from_gql(&data, &StdHashMap::new()).unwrap()
    }

    #[test]
    fn test_campaign_channel_matching() {
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        let directory_campaign = campaign_for(&game_a, vec![]);
        let acl_campaign = campaign_for(&game_b, vec![42]);

        let ch_a = directory_channel(7, &game_a, 10);
        let ch_acl = directory_channel(42, &game_b, 10);
        let ch_other = directory_channel(9, &game_b, 10);

        assert!(campaign_matches_channel(&directory_campaign, &ch_a));
        assert!(!campaign_matches_channel(&directory_campaign, &ch_acl));
        assert!(campaign_matches_channel(&acl_campaign, &ch_acl));
        assert!(!campaign_matches_channel(&acl_campaign, &ch_other));
    }

    async fn test_miner(games_to_watch: Vec<&str>) -> MiningService {
        use crate::services::cookie_jar_service::CookieJarService;
        let dir = std::env::temp_dir().join(format!(
            "dm-miner-{}-{}",
            std::process::id(),
            games_to_watch.len()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let bus = EventBus::new();
        let jar = Arc::new(CookieJarService::new(dir.join("cookies.jar")));
        let http = Arc::new(HttpClient::new(jar, None, bus.shutdown_rx()).await.unwrap());
        let auth = Arc::new(AuthState::new(http.clone(), bus.clone()));
        let gql = Arc::new(crate::services::gql_service::GqlClient::new(http.clone(), auth.clone()));
        let channel_service = Arc::new(ChannelService::new(gql.clone()));
        let ws_pool = Arc::new(WsPool::new(auth.clone(), mpsc::unbounded_channel().0, bus.shutdown_rx()));
        let mut settings = Settings::default();
        settings.games_to_watch = games_to_watch.iter().map(|s| s.to_string()).collect();
        let (_ws_tx, ws_rx) = mpsc::unbounded_channel();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (_watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (target_tx, _target_rx) = watch::channel(None);
        MiningService::new(
            bus,
            http,
            auth,
            gql,
            channel_service,
            ws_pool,
            Arc::new(RwLock::new(settings)),
            dir.join("settings.json"),
            ws_rx,
            control_rx,
            watch_rx,
            target_tx,
            Arc::new(Notify::new()),
        )
    }

    /// Two online channels, the lower-viewer one playing the higher-priority
    /// game: priority wins.
    #[tokio::test]
    async fn test_channel_switch_respects_game_priority() {
        let mut miner = test_miner(vec!["GameA", "GameB"]).await;
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        miner.campaigns = vec![campaign_for(&game_a, vec![]), campaign_for(&game_b, vec![])];
        let ca = directory_channel(10, &game_a, 10);
        let cb = directory_channel(11, &game_b, 10_000);
        miner.channels.insert(ca.id, ca);
        miner.channels.insert(cb.id, cb);

        miner.phase_games_update().await;
        assert_eq!(
            miner.wanted_games.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            vec!["GameA", "GameB"]
        );

        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(10));
    }

    /// Manual selection pins the channel through priority changes until
    /// explicitly released.
    #[tokio::test]
    async fn test_manual_mode_pins_channel() {
        let mut miner = test_miner(vec!["GameA", "GameB"]).await;
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        miner.campaigns = vec![campaign_for(&game_a, vec![]), campaign_for(&game_b, vec![])];
        miner.wanted_games = vec![game_a.clone(), game_b.clone()];
        let ca = directory_channel(10, &game_a, 10);
        let cc = directory_channel(30, &game_b, 5);
        miner.channels.insert(ca.id, ca);
        miner.channels.insert(cc.id, cc);

        miner
            .apply_control(ControlCommand::SelectChannel { id: "30".into() })
            .await
            .unwrap();
        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(30));

        // a higher-priority candidate appears; manual mode ignores it
        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(30));

        miner.apply_control(ControlCommand::ExitManualMode).await.unwrap();
        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(10));
    }

    #[tokio::test]
    async fn test_select_channel_failures() {
        let mut miner = test_miner(vec!["GameA"]).await;
        let game_a = game("1", "GameA");
        let mut offline = directory_channel(10, &game_a, 10);
        offline.set_stream(None);
        miner.channels.insert(offline.id, offline);

        let err = miner
            .apply_control(ControlCommand::SelectChannel { id: "404".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelNotFound(_)));
        let err = miner
            .apply_control(ControlCommand::SelectChannel { id: "10".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelOffline(_)));
    }

    /// The watched channel goes offline; the next candidate takes over.
    #[tokio::test]
    async fn test_offline_switch() {
        let mut miner = test_miner(vec!["GameA", "GameB"]).await;
        let game_a = game("1", "GameA");
        let game_b = game("2", "GameB");
        miner.campaigns = vec![campaign_for(&game_a, vec![]), campaign_for(&game_b, vec![])];
        miner.wanted_games = vec![game_a.clone(), game_b.clone()];
        let ca = directory_channel(10, &game_a, 10);
        let cb = directory_channel(11, &game_b, 100);
        miner.channels.insert(ca.id, ca);
        miner.channels.insert(cb.id, cb);

        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(10));

        miner
            .handle_ws_message(WsMessage::StreamDown { channel_id: 10 })
            .await;
        assert_eq!(miner.state, State::ChannelSwitch);
        assert_eq!(miner.watching, None);

        miner.phase_channel_switch().await;
        assert_eq!(miner.watching, Some(11));
    }

    /// Triggers during a phase coalesce into a single pending re-entry.
    #[tokio::test]
    async fn test_reentry_coalescing() {
        let mut miner = test_miner(vec![]).await;
        miner.state = State::ChannelsFetch; // mid-phase
        miner.request_reentry();
        miner.request_reentry();
        miner.request_reentry();
        assert!(miner.pending_reentry);
        // back in IDLE, one re-entry fires
        miner.state = State::Idle;
        miner.idle_wait().await;
        assert_eq!(miner.state, State::InventoryFetch);
        assert!(!miner.pending_reentry);
    }

    #[test]
    fn test_progress_payload() {
        let game_a = game("1", "GameA");
        let mut campaign = campaign_for(&game_a, vec![]);
        let drop_id = campaign.drops[0].id.clone();
        campaign
            .get_drop_mut(&drop_id)
            .unwrap()
            .report_minutes(15, Utc::now());
        let payload = progress_payload(&campaign, &drop_id).unwrap();
        assert_eq!(payload.current_minutes, 15);
        assert_eq!(payload.required_minutes, 60);
        assert_eq!(payload.remaining_seconds, 45 * 60);
        assert!((payload.progress - 0.25).abs() < f64::EPSILON);
        assert!(progress_payload(&campaign, "missing").is_none());
    }
}
