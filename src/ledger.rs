use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::LikeConfig;
use crate::discourse::{CurrentUser, ForumApi, LikeObserver, ToggleOutcome};
use crate::storage::Store;
use crate::user;

/// Rolling window within which a consumed like still counts against quota.
const WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
/// Hard cap on stored timestamps.
const MAX_STORED: usize = 500;
/// Cap on placeholders synthesized from a single rate-limit response.
const SYNTH_CLAMP: usize = 200;
/// Minimum interval between unforced remote reconciliations.
const SYNC_INTERVAL_MS: i64 = 30 * 60 * 1000;

/// Persisted ledger blob, keyed per site host.
///
/// `timestamps` is most-recent-first and conceptually bounded by the daily
/// limit; it may transiently exceed it when cooldown is inferred and
/// placeholder entries get synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    pub timestamps: Vec<i64>,
    #[serde(default)]
    pub cooldown_until: i64,
    #[serde(default)]
    pub last_sync: i64,
    #[serde(default = "default_matched")]
    pub matched: bool,
    #[serde(default)]
    pub trust_level: Option<u8>,
}

fn default_matched() -> bool {
    true
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            timestamps: Vec::new(),
            cooldown_until: 0,
            last_sync: 0,
            matched: default_matched(),
            trust_level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStatus {
    pub remaining: u32,
    pub used: u32,
    pub limit: u32,
    pub in_cooldown: bool,
    pub cooldown_remaining: Duration,
    pub matched: bool,
    pub last_sync: i64,
}

/// Result of the non-destructive cooldown probe against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// Server rejected a like; cooldown holds until the given instant (ms).
    Cooldown(i64),
    /// Server accepted a like (immediately reversed): no cooldown.
    Clear,
    /// No usable probe post, or the probe itself failed.
    CouldNotTest,
}

/// Best-effort, self-correcting count of likes consumed in the trailing 24
/// hours, with cooldown inferred from rate-limit responses and periodically
/// reconciled against the server's action history.
pub struct Ledger {
    store: Arc<Store>,
    key: String,
    likes: LikeConfig,
    api: Arc<dyn ForumApi>,
    current_user: Mutex<Option<CurrentUser>>,
}

impl Ledger {
    pub fn new(store: Arc<Store>, api: Arc<dyn ForumApi>, likes: LikeConfig) -> Self {
        let host = api
            .base_url()
            .host_str()
            .unwrap_or("unknown")
            .to_string();
        Self {
            store,
            key: format!("like_ledger:{host}"),
            likes,
            api,
            current_user: Mutex::new(None),
        }
    }

    pub fn status(&self) -> LedgerStatus {
        self.status_at(now_ms())
    }

    pub fn clear_cooldown(&self) {
        self.clear_cooldown_at(now_ms());
    }

    pub fn sync_remote(&self, force: bool, probe_post: Option<u64>) {
        self.sync_remote_at(force, probe_post, now_ms());
    }

    fn load_state(&self) -> LedgerState {
        let mut state: LedgerState = self.store.get(&self.key, LedgerState::default());
        if state.timestamps.len() > MAX_STORED {
            state.timestamps.truncate(MAX_STORED);
        }
        state
    }

    fn save_state(&self, state: &LedgerState) {
        if let Err(err) = self.store.set(&self.key, state) {
            tracing::warn!("ledger: persist failed: {err:#}");
        }
    }

    fn limit(&self, state: &LedgerState) -> u32 {
        let level = self
            .current_user
            .lock()
            .as_ref()
            .and_then(|u| u.trust_level)
            .or(state.trust_level);
        self.likes.limit_for(level)
    }

    pub(crate) fn status_at(&self, now: i64) -> LedgerStatus {
        let loaded = self.load_state();
        let mut state = loaded.clone();
        self.prune(&mut state, now);
        if state != loaded {
            self.save_state(&state);
        }
        let limit = self.limit(&state);
        let used = state.timestamps.len() as u32;
        let in_cooldown = state.cooldown_until > now;
        LedgerStatus {
            remaining: limit.saturating_sub(used),
            used,
            limit,
            in_cooldown,
            cooldown_remaining: if in_cooldown {
                Duration::from_millis((state.cooldown_until - now) as u64)
            } else {
                Duration::ZERO
            },
            matched: state.matched,
            last_sync: state.last_sync,
        }
    }

    /// Drop entries older than the rolling window, and once a cooldown has
    /// lapsed, drop the placeholder entries that were synthesized for it.
    fn prune(&self, state: &mut LedgerState, now: i64) {
        let cutoff = now - WINDOW_MS;
        state.timestamps.retain(|ts| *ts > cutoff);
        state.timestamps.sort_unstable_by(|a, b| b.cmp(a));

        if state.cooldown_until > 0 && state.cooldown_until < now {
            let expected_base = state.cooldown_until - WINDOW_MS;
            let before = state.timestamps.len();
            state
                .timestamps
                .retain(|ts| *ts < expected_base || *ts >= expected_base + 5000);
            if state.timestamps.len() < before {
                self.refresh_matched(state);
            }
            state.cooldown_until = 0;
        }
    }

    fn refresh_matched(&self, state: &mut LedgerState) {
        let limit = self.limit(state);
        let count = state.timestamps.len() as u32;
        state.matched = count >= limit || state.last_sync == 0 || count == 0;
    }

    pub(crate) fn observe_at(&self, outcome: &ToggleOutcome, now: i64) {
        // Reload before mutating: another tab may have written meanwhile.
        let mut state = self.load_state();
        self.prune(&mut state, now);

        match outcome {
            ToggleOutcome::Liked { .. } => {
                state.timestamps.insert(0, now);
                state.timestamps.truncate(MAX_STORED);
                tracing::debug!(
                    used = state.timestamps.len(),
                    limit = self.limit(&state),
                    "like recorded"
                );
            }
            ToggleOutcome::Unliked { .. } => {
                // LIFO approximation: the most recent entry is assumed to be
                // the one reversed. Reconciliation corrects any drift.
                if !state.timestamps.is_empty() {
                    state.timestamps.remove(0);
                }
                if state.cooldown_until > now {
                    state.cooldown_until = 0;
                }
            }
            ToggleOutcome::RateLimited { wait } => {
                let wait_ms = wait.as_millis() as i64;
                if wait_ms > 0 {
                    state.cooldown_until = now + wait_ms;
                    tracing::info!(wait_secs = wait.as_secs(), "rate limit observed");
                }
                let limit = self.limit(&state);
                let used = state.timestamps.len() as u32;
                if used < limit && wait_ms > 0 {
                    // The server says the quota is gone but we did not see all
                    // of it locally; synthesize the missing entries at the
                    // start of the implied window.
                    let needed = ((limit - used) as usize).min(SYNTH_CLAMP);
                    let base = state.cooldown_until - WINDOW_MS;
                    for i in 0..needed {
                        state.timestamps.push(base + i as i64);
                    }
                    state.timestamps.sort_unstable_by(|a, b| b.cmp(a));
                }
                state.matched = state.timestamps.len() as u32 >= limit;
            }
        }

        self.save_state(&state);
    }

    pub(crate) fn clear_cooldown_at(&self, now: i64) {
        let mut state = self.load_state();
        state.cooldown_until = 0;
        let recent_cutoff = now - 60_000;
        let window_head = now - WINDOW_MS + 60_000;
        state
            .timestamps
            .retain(|ts| *ts > recent_cutoff || *ts < window_head);
        self.save_state(&state);
        tracing::info!("cooldown cleared");
    }

    pub(crate) fn sync_remote_at(&self, force: bool, probe_post: Option<u64>, now: i64) {
        let mut state = self.load_state();
        if !force && state.last_sync > 0 && now - state.last_sync < SYNC_INTERVAL_MS {
            tracing::debug!(
                minutes = (now - state.last_sync) / 60_000,
                "sync skipped, last run too recent"
            );
            return;
        }

        let user = match self.resolve_user() {
            Some(user) => user,
            None => {
                tracing::debug!("sync skipped, no current user");
                return;
            }
        };

        let saved_cooldown = state.cooldown_until;
        self.prune(&mut state, now);
        let limit = self.limit(&state);

        match self.probe_cooldown(probe_post, now) {
            Probe::Cooldown(until) => {
                // The server proves the day's quota is fully consumed. We
                // cannot introspect exact counts, so model it as a full
                // window of entries spaced a minute apart.
                let base = until - WINDOW_MS;
                state.timestamps = (0..limit as i64).map(|i| base + i * 60_000).collect();
                state.timestamps.sort_unstable_by(|a, b| b.cmp(a));
                state.cooldown_until = until;
                state.last_sync = now;
                state.matched = true;
                state.trust_level = user.trust_level.or(state.trust_level);
                self.save_state(&state);
                tracing::info!(limit, "sync complete, server confirmed quota exhausted");
                return;
            }
            probe @ (Probe::Clear | Probe::CouldNotTest) => {
                let could_not_test = probe == Probe::CouldNotTest;

                let cutoff = now - WINDOW_MS;
                let actions = match self.fetch_history(&user.username, cutoff) {
                    Ok(actions) => actions,
                    Err(err) => {
                        tracing::warn!("sync failed fetching history: {err:#}");
                        return;
                    }
                };

                // A user cannot like the same post twice; keep the newest
                // record per post.
                let mut per_post: std::collections::HashMap<u64, i64> = Default::default();
                for (post_id, ts) in &actions {
                    let entry = per_post.entry(*post_id).or_insert(*ts);
                    if *ts > *entry {
                        *entry = *ts;
                    }
                }
                let mut deduped: Vec<i64> = per_post.into_values().collect();
                deduped.sort_unstable_by(|a, b| b.cmp(a));
                tracing::debug!(
                    fetched = actions.len(),
                    deduped = deduped.len(),
                    "history reconciled"
                );

                let effective_cooldown = if saved_cooldown > now { saved_cooldown } else { 0 };
                if effective_cooldown > 0 {
                    if !could_not_test {
                        // Probe proved no rate limit; the recorded cooldown
                        // was stale.
                        state.cooldown_until = 0;
                    } else if deduped.len() as u32 + 1 >= limit {
                        state.cooldown_until = effective_cooldown;
                    } else {
                        state.cooldown_until = 0;
                    }
                }

                state.timestamps = deduped;
                state.last_sync = now;
                state.matched = true;
                self.prune(&mut state, now);

                if state.timestamps.len() as u32 >= limit {
                    if let Some(oldest) = state.timestamps.iter().min().copied() {
                        let estimated = oldest + WINDOW_MS;
                        if estimated > now {
                            state.cooldown_until = estimated;
                        }
                    }
                }

                state.trust_level = user.trust_level.or(state.trust_level);
                self.save_state(&state);
                tracing::info!(
                    used = state.timestamps.len(),
                    limit,
                    "sync complete"
                );
            }
        }
    }

    fn resolve_user(&self) -> Option<CurrentUser> {
        if let Some(user) = self.current_user.lock().clone() {
            return Some(user);
        }
        let user = user::resolve_current_user(self.api.as_ref(), &self.store)?;
        *self.current_user.lock() = Some(user.clone());
        Some(user)
    }

    /// Non-destructive cooldown probe: toggle a live post and inspect the
    /// response. A rate-limit answer yields the cooldown instant without any
    /// state actually changing server-side; an unexpected success is reversed
    /// immediately by toggling again.
    fn probe_cooldown(&self, probe_post: Option<u64>, now: i64) -> Probe {
        let post_id = match probe_post {
            Some(id) => id,
            None => {
                tracing::debug!("no probe post available, skipping cooldown test");
                return Probe::CouldNotTest;
            }
        };
        match self.api.toggle_like(post_id) {
            Ok(ToggleOutcome::RateLimited { wait }) if !wait.is_zero() => {
                Probe::Cooldown(now + wait.as_millis() as i64)
            }
            Ok(ToggleOutcome::RateLimited { .. }) => Probe::CouldNotTest,
            Ok(_) => {
                // The toggle went through; undo it.
                if let Err(err) = self.api.toggle_like(post_id) {
                    tracing::warn!("probe reversal failed: {err:#}");
                }
                Probe::Clear
            }
            Err(err) => {
                tracing::debug!("cooldown probe failed: {err:#}");
                Probe::CouldNotTest
            }
        }
    }

    /// Fetch up to five pages of like history, stopping early once entries
    /// fall outside the window.
    fn fetch_history(&self, username: &str, cutoff: i64) -> Result<Vec<(u64, i64)>> {
        let mut all = Vec::new();
        let mut offset = 0;
        for _ in 0..5 {
            let items = self.api.user_actions(username, offset)?;
            if items.is_empty() {
                break;
            }
            let page_len = items.len();
            let mut has_old = false;
            for item in items {
                let ts = item.created_at.timestamp_millis();
                if ts > cutoff {
                    all.push((item.post_id, ts));
                } else {
                    has_old = true;
                }
            }
            if has_old || page_len < 50 {
                break;
            }
            offset += 50;
        }
        Ok(all)
    }
}

impl LikeObserver for Ledger {
    fn observe(&self, outcome: &ToggleOutcome) {
        self.observe_at(outcome, now_ms());
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
