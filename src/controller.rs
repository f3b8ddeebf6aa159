use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{LikeConfig, LikeFilterMode, PacingConfig, RunSettings};
use crate::discourse::{ForumApi, ToggleOutcome, TopicSource, TopicSummary};
use crate::ledger::Ledger;
use crate::page::{PageKind, PageSurface};
use crate::storage::Store;

const READ_TOPICS_KEY: &str = "read_topics";
const TODAY_READ_KEY: &str = "today_read";
const TOTAL_READ_KEY: &str = "total_read_count";
const AUTO_RUNNING_KEY: &str = "auto_running";

/// Visited-topic history cap.
const VISITED_CAP: usize = 1000;
/// Quick-like touches at most this many reply posts per topic.
const MAX_REPLY_LIKES: usize = 4;

/// Controller run state. All transitions go through `set_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scrolling,
    AwaitingNavigation,
    Recovering,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct TodayRead {
    #[serde(default)]
    date: String,
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub session_read: u64,
    pub today_read: u64,
    pub total_read: u64,
    pub remaining: u32,
}

pub type StatusCallback = Box<dyn Fn(bool) + Send>;
pub type StatsCallback = Box<dyn Fn(&Stats) + Send>;

/// Drives passive reading of one forum: scrolls article pages at a human
/// cadence, records reads, optionally likes, and hops to the next topic.
/// A watchdog embedded in `guard_tick` recovers the run when the page stops
/// making progress.
///
/// Counters and the visited set round-trip through the store at every
/// mutation, so a rebuilt controller picks up where the last one stopped.
/// The topic queue is deliberately not persisted; it is cheap to rederive.
pub struct Controller<P: PageSurface> {
    page: P,
    api: Arc<dyn ForumApi>,
    ledger: Arc<Ledger>,
    store: Arc<Store>,
    settings: RunSettings,
    pacing: PacingConfig,
    likes: LikeConfig,
    rng: StdRng,

    state: RunState,
    visited: Vec<u64>,
    session_read: u64,
    today: TodayRead,
    total_read: u64,

    queue: Vec<TopicSummary>,
    cursor: usize,

    last_url: Url,
    page_loaded_at: i64,

    on_status_change: Option<StatusCallback>,
    on_stats_update: Option<StatsCallback>,
}

impl<P: PageSurface> Controller<P> {
    /// Rehydrates a controller from the store. Settings, counters and the
    /// visited set survive process restarts; everything else starts fresh.
    pub fn new(
        page: P,
        api: Arc<dyn ForumApi>,
        ledger: Arc<Ledger>,
        store: Arc<Store>,
        pacing: PacingConfig,
        likes: LikeConfig,
    ) -> Self {
        let settings = RunSettings::load(&store);
        let visited: Vec<u64> = store.get(READ_TOPICS_KEY, Vec::new());
        let today: TodayRead = store.get(TODAY_READ_KEY, TodayRead::default());
        let total_read: u64 = store.get(TOTAL_READ_KEY, 0);
        let last_url = page.current_url();
        Self {
            page,
            api,
            ledger,
            store,
            settings,
            pacing,
            likes,
            rng: StdRng::from_entropy(),
            state: RunState::Idle,
            visited,
            session_read: 0,
            today,
            total_read,
            queue: Vec::new(),
            cursor: 0,
            last_url,
            page_loaded_at: now_ms(),
            on_status_change: None,
            on_stats_update: None,
        }
    }

    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn on_status_change(&mut self, cb: impl Fn(bool) + Send + 'static) {
        self.on_status_change = Some(Box::new(cb));
    }

    pub fn on_stats_update(&mut self, cb: impl Fn(&Stats) + Send + 'static) {
        self.on_stats_update = Some(Box::new(cb));
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.state != RunState::Idle
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn stats(&self) -> Stats {
        Stats {
            session_read: self.session_read,
            today_read: self.today.count,
            total_read: self.total_read,
            remaining: self.ledger.status().remaining,
        }
    }

    /// A live post usable as a non-destructive cooldown probe, if the
    /// current page has one.
    pub fn probe_post(&self) -> Option<u64> {
        self.page.posts().first().map(|p| p.post_id)
    }

    pub fn start(&mut self) {
        self.start_at(now_ms());
    }

    pub fn stop(&mut self) {
        let was_running = self.running();
        self.set_state(RunState::Idle);
        if let Err(err) = self.store.set_session(AUTO_RUNNING_KEY, &false) {
            tracing::warn!("controller: session flag not cleared: {err:#}");
        }
        if was_running {
            self.notify_status(false);
            tracing::info!(
                session_read = self.session_read,
                "run stopped"
            );
        }
    }

    pub fn scroll_tick(&mut self) {
        self.scroll_tick_at(now_ms());
    }

    pub fn guard_tick(&mut self) {
        self.guard_tick_at(now_ms());
    }

    /// Picks up a run that a previous page load left flagged as active.
    pub fn resume_if_running(&mut self) {
        if self.store.get_session(AUTO_RUNNING_KEY, false) {
            tracing::info!("resuming run left active by a previous page");
            self.start();
        }
    }

    /// Applies a settings change live and persists it.
    pub fn update_setting(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.settings.apply(key, value);
        self.settings.save(&self.store)
    }

    /// Zeroes the session and daily counters. Only ever user-triggered.
    pub fn reset_counters(&mut self) {
        self.session_read = 0;
        self.today.count = 0;
        if let Err(err) = self.store.set(TODAY_READ_KEY, &self.today) {
            tracing::warn!("controller: counter reset not persisted: {err:#}");
        }
        self.notify_stats();
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "state change");
            self.state = next;
        }
    }

    pub(crate) fn start_at(&mut self, now: i64) {
        if self.running() {
            return;
        }
        if self.settings.stop_on_like_limit && self.quota_exhausted() {
            self.page.notice("Like limit reached; not starting");
            return;
        }
        if let Err(err) = self.store.set_session(AUTO_RUNNING_KEY, &true) {
            tracing::warn!("controller: session flag not set: {err:#}");
        }
        self.last_url = self.page.current_url();
        self.page_loaded_at = now;
        self.notify_status(true);
        tracing::info!(url = %self.last_url, "run started");
        match self.page.kind() {
            PageKind::Article { .. } => self.set_state(RunState::Scrolling),
            _ => {
                self.set_state(RunState::AwaitingNavigation);
                self.acquire_topics();
                self.navigate_next(now);
            }
        }
    }

    /// One scroll-loop iteration. Re-checks the run state after every
    /// suspension point; a `stop()` between delays must win.
    pub(crate) fn scroll_tick_at(&mut self, now: i64) {
        if self.state != RunState::Scrolling {
            return;
        }

        let distance = if self.rng.gen_bool(self.pacing.skim_chance) {
            self.rng.gen_range(self.pacing.skim_min..=self.pacing.skim_max)
        } else {
            self.rng.gen_range(self.pacing.scroll_min..=self.pacing.scroll_max)
        };
        self.page.scroll_by(distance);

        if self.rng.gen_bool(self.pacing.pause_chance) {
            self.sleep_range(self.pacing.pause_min, self.pacing.pause_max);
            if self.state != RunState::Scrolling {
                return;
            }
        }

        if !self.page.near_bottom() {
            return;
        }

        thread::sleep(self.pacing.settle_wait);
        if self.state != RunState::Scrolling {
            return;
        }
        if !self.page.content_settled() {
            return;
        }

        self.mark_read(now);

        if self.settings.stop_after_read
            && self.session_read >= self.settings.stop_after_read_count
        {
            self.page.notice("Read limit reached");
            self.stop();
            return;
        }

        if self.settings.auto_like {
            self.auto_like();
            if self.state != RunState::Scrolling {
                return;
            }
        }

        self.set_state(RunState::AwaitingNavigation);
        self.sleep_range(self.pacing.nav_delay_min, self.pacing.nav_delay_max);
        if self.state != RunState::AwaitingNavigation {
            return;
        }
        self.navigate_next(now);
    }

    fn mark_read(&mut self, now: i64) {
        let topic_id = match self.page.kind() {
            PageKind::Article { topic_id } => topic_id,
            _ => return,
        };
        if !self.visited.contains(&topic_id) {
            self.visited.insert(0, topic_id);
            self.visited.truncate(VISITED_CAP);
            if let Err(err) = self.store.set(READ_TOPICS_KEY, &self.visited) {
                tracing::warn!("controller: visited set not persisted: {err:#}");
            }
        }
        self.session_read += 1;
        let date = date_string(now);
        if self.today.date != date {
            self.today = TodayRead { date, count: 0 };
        }
        self.today.count += 1;
        self.total_read += 1;
        if let Err(err) = self
            .store
            .set(TODAY_READ_KEY, &self.today)
            .and_then(|_| self.store.set(TOTAL_READ_KEY, &self.total_read))
        {
            tracing::warn!("controller: counters not persisted: {err:#}");
        }
        tracing::info!(
            topic_id,
            session = self.session_read,
            today = self.today.count,
            total = self.total_read,
            "topic read"
        );
        self.notify_stats();
    }

    /// Likes the root post (filtered) and, when quick-like is enabled, up to
    /// four unreacted replies. Skipped wholesale on category or quota gates.
    fn auto_like(&mut self) {
        if !self.category_allowed() {
            tracing::debug!("category gated, skipping likes");
            return;
        }
        if self.quota_exhausted() {
            tracing::debug!("quota exhausted, skipping likes");
            return;
        }
        let posts = self.page.posts();
        let mut iter = posts.iter();
        let root = match iter.next() {
            Some(root) => root,
            None => return,
        };
        if !root.already_liked && self.should_like(root.like_count) {
            self.like_post(
                root.post_id,
                self.pacing.like_jitter_min,
                self.pacing.like_jitter_max,
            );
        }
        if !self.settings.quick_like {
            return;
        }
        let mut liked = 0;
        for post in iter {
            if liked >= MAX_REPLY_LIKES {
                break;
            }
            if post.already_liked {
                continue;
            }
            if self.quota_exhausted() {
                break;
            }
            self.like_post(
                post.post_id,
                self.pacing.reply_jitter_min,
                self.pacing.reply_jitter_max,
            );
            liked += 1;
        }
    }

    fn quota_exhausted(&self) -> bool {
        let status = self.ledger.status();
        status.in_cooldown || status.remaining == 0
    }

    fn category_allowed(&self) -> bool {
        let label = match self.page.category_label() {
            Some(label) => label,
            // No label found means liking is allowed.
            None => return true,
        };
        if self.likes.excluded_categories.iter().any(|c| *c == label) {
            return false;
        }
        if !self.likes.allowed_categories.is_empty()
            && !self.likes.allowed_categories.iter().any(|c| *c == label)
        {
            return false;
        }
        true
    }

    pub(crate) fn should_like(&mut self, like_count: u32) -> bool {
        match self.settings.like_filter {
            LikeFilterMode::Off => true,
            LikeFilterMode::Threshold => like_count >= self.settings.like_min_threshold,
            LikeFilterMode::Probability => {
                let p = self.likes.curve.probability(like_count);
                p > 0.0 && self.rng.gen_bool(p)
            }
        }
    }

    fn like_post(&mut self, post_id: u64, jitter_min: Duration, jitter_max: Duration) {
        self.sleep_range(jitter_min, jitter_max);
        if self.state == RunState::Idle {
            return;
        }
        // The ledger hears about the outcome through the client's observer
        // seam; nothing to bookkeep here.
        match self.api.toggle_like(post_id) {
            Ok(ToggleOutcome::Liked { .. }) => tracing::debug!(post_id, "post liked"),
            Ok(ToggleOutcome::Unliked { .. }) => {
                tracing::warn!(post_id, "toggle reversed an existing like")
            }
            Ok(ToggleOutcome::RateLimited { wait }) => {
                tracing::info!(post_id, wait_secs = wait.as_secs(), "like rate limited")
            }
            Err(err) => tracing::warn!(post_id, "like failed: {err:#}"),
        }
    }

    /// Rebuilds the topic queue from the configured listing. A fetch failure
    /// yields an empty queue and is not fatal.
    fn acquire_topics(&mut self) {
        let source = if self.settings.read_unread {
            TopicSource::Unread
        } else {
            TopicSource::Latest
        };
        let topics = match self.api.topics(source, self.settings.topic_limit) {
            Ok(topics) => topics,
            Err(err) => {
                tracing::warn!("controller: topic fetch failed: {err:#}");
                Vec::new()
            }
        };
        let mut topics: Vec<TopicSummary> = if self.settings.skip_read {
            topics
                .into_iter()
                .filter(|t| !self.visited.contains(&t.id))
                .collect()
        } else {
            topics
        };
        if self.settings.random_order {
            topics.shuffle(&mut self.rng);
        }
        tracing::debug!(source = source.as_str(), count = topics.len(), "topic queue rebuilt");
        self.queue = topics;
        self.cursor = 0;
    }

    fn navigate_next(&mut self, now: i64) {
        if self.settings.stop_on_like_limit && self.quota_exhausted() {
            self.page.notice("Like limit reached");
            self.stop();
            return;
        }
        if self.cursor >= self.queue.len() {
            self.acquire_topics();
            if self.queue.is_empty() {
                self.page.notice("No more topics to read");
                self.stop();
                return;
            }
        }
        let topic = self.queue[self.cursor].clone();
        self.cursor += 1;
        let url = match self.api.base_url().join(&format!("/t/topic/{}", topic.id)) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(topic_id = topic.id, "controller: bad topic url: {err}");
                return;
            }
        };
        tracing::info!(topic_id = topic.id, title = %topic.title, "navigating to next topic");
        self.set_state(RunState::AwaitingNavigation);
        // last_url is deliberately left stale here; the guard's next tick
        // spots the change and restarts scrolling.
        self.page_loaded_at = now;
        if let Err(err) = self.page.navigate_to(&url) {
            // Leave the state as is; the guard recovers a stuck page.
            tracing::warn!("controller: navigation failed: {err:#}");
        }
    }

    /// Watchdog pass. Detects page changes and staleness, and kicks off
    /// recovery when the run has made no progress for too long.
    pub(crate) fn guard_tick_at(&mut self, now: i64) {
        if !self.running() {
            return;
        }

        let url = self.page.current_url();
        if url != self.last_url {
            self.last_url = url;
            self.page_loaded_at = now;
            tracing::debug!(url = %self.last_url, "page changed");
            if self.page.kind().is_article() && self.state != RunState::Scrolling {
                thread::sleep(self.pacing.resume_wait);
                if !self.running() {
                    return;
                }
                self.set_state(RunState::Scrolling);
                if self.settings.auto_like {
                    self.auto_like();
                }
            }
            return;
        }

        let is_article = self.page.kind().is_article();
        let idle_for = now - self.page_loaded_at;
        let stalled = if is_article {
            self.state != RunState::Scrolling
                && idle_for > self.pacing.stale_article.as_millis() as i64
        } else {
            idle_for > self.pacing.stale_other.as_millis() as i64
        };
        if stalled {
            self.recover(now);
        }
    }

    fn recover(&mut self, now: i64) {
        tracing::info!(state = ?self.state, "no progress detected, recovering");
        self.set_state(RunState::Recovering);
        thread::sleep(self.pacing.recover_wait);
        if !self.running() {
            return;
        }
        if self.page.kind().is_article() {
            self.set_state(RunState::Scrolling);
        } else {
            self.set_state(RunState::AwaitingNavigation);
            if self.cursor >= self.queue.len() {
                self.acquire_topics();
            }
            self.navigate_next(now);
        }
        self.page_loaded_at = now;
    }

    fn sleep_range(&mut self, min: Duration, max: Duration) {
        if max.is_zero() {
            return;
        }
        let span = (min.as_millis() as u64, max.as_millis() as u64);
        let ms = if span.0 >= span.1 {
            span.1
        } else {
            self.rng.gen_range(span.0..=span.1)
        };
        thread::sleep(Duration::from_millis(ms));
    }

    fn notify_status(&self, running: bool) {
        if let Some(cb) = &self.on_status_change {
            cb(running);
        }
    }

    fn notify_stats(&self) {
        if let Some(cb) = &self.on_stats_update {
            cb(&self.stats());
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn date_string(now: i64) -> String {
    Utc.timestamp_millis_opt(now)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MockPage, PostHandle};
    use crate::test_support::MockApi;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NOW: i64 = 1_700_000_000_000;

    fn build(page: MockPage, api: MockApi) -> (Controller<MockPage>, Arc<MockApi>) {
        build_with(page, api, LikeConfig::default())
    }

    fn build_with(
        page: MockPage,
        api: MockApi,
        likes: LikeConfig,
    ) -> (Controller<MockPage>, Arc<MockApi>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let api = Arc::new(api);
        let ledger = Arc::new(Ledger::new(store.clone(), api.clone(), likes.clone()));
        api.add_observer(ledger.clone());
        let controller =
            Controller::new(page, api.clone(), ledger, store, PacingConfig::instant(), likes)
                .with_seed(7);
        (controller, api)
    }

    fn post(post_id: u64, like_count: u32) -> PostHandle {
        PostHandle {
            post_id,
            like_count,
            already_liked: false,
        }
    }

    fn drive_to_bottom(c: &mut Controller<MockPage>) {
        for _ in 0..500 {
            if c.state() != RunState::Scrolling {
                break;
            }
            c.scroll_tick_at(NOW);
        }
    }

    #[test]
    fn callbacks_are_unset_until_registered() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        // A fresh controller carries no callbacks; a run cycle must not
        // require them.
        c.start_at(NOW);
        c.stop();
        assert_eq!(c.state(), RunState::Idle);

        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        c.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        c.start_at(NOW);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fresh_article_run_reads_and_navigates() {
        // Scenario: start on an article, no auto-like; the bottom of the
        // page marks the topic read and navigation follows.
        let page = MockPage::article(42, vec![post(1, 0)]);
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 43,
            title: "next".into(),
            category_id: None,
        });
        let (mut c, _api) = build(page, api);
        c.start_at(NOW);
        assert_eq!(c.state(), RunState::Scrolling);

        drive_to_bottom(&mut c);

        let stats = c.stats();
        assert_eq!(stats.session_read, 1);
        assert_eq!(stats.today_read, 1);
        assert_eq!(stats.total_read, 1);
        assert_eq!(
            c.page().navigations,
            vec![Url::parse("https://forum.test/t/topic/43").unwrap()]
        );
        assert!(!c.page().scrolls.is_empty());
    }

    #[test]
    fn stop_after_read_count_goes_idle() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 43,
            title: "next".into(),
            category_id: None,
        });
        let (mut c, _api) = build(page, api);
        c.settings.stop_after_read = true;
        c.settings.stop_after_read_count = 1;
        c.start_at(NOW);

        drive_to_bottom(&mut c);

        assert_eq!(c.state(), RunState::Idle);
        assert!(c.page().navigations.is_empty());
        assert_eq!(c.stats().session_read, 1);
        assert_eq!(c.page().taken_notices(), vec!["Read limit reached"]);
    }

    #[test]
    fn start_refused_when_quota_gone() {
        // Scenario: stop-on-like-limit with an exhausted ledger.
        let page = MockPage::article(42, vec![post(1, 0)]);
        let api = MockApi::default();
        let (mut c, _api) = build(page, api);
        c.settings.stop_on_like_limit = true;
        // The pre-check reads the ledger against the wall clock.
        let now = now_ms();
        for i in 0..50 {
            c.ledger.observe_at(&ToggleOutcome::Liked { post_id: i }, now - 1000 + i as i64);
        }
        c.start_at(now);

        assert_eq!(c.state(), RunState::Idle);
        assert_eq!(
            c.page().taken_notices(),
            vec!["Like limit reached; not starting"]
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        let transitions = Arc::new(AtomicU32::new(0));
        let seen = transitions.clone();
        c.on_status_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        c.start_at(NOW);
        c.stop();
        c.stop();
        // One start notification plus exactly one stop notification.
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn auto_like_hits_root_and_replies() {
        let page = MockPage::article(
            42,
            vec![post(10, 5), post(11, 0), post(12, 0), post(13, 0), post(14, 0), post(15, 0)],
        );
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 43,
            title: "next".into(),
            category_id: None,
        });
        let (mut c, api) = build(page, api);
        c.settings.auto_like = true;
        c.settings.quick_like = true;
        c.start_at(NOW);
        drive_to_bottom(&mut c);

        // Root plus at most four replies.
        assert_eq!(api.toggled_posts(), vec![10, 11, 12, 13, 14]);
        assert_eq!(c.ledger.status().used, 5);
    }

    #[test]
    fn already_liked_posts_are_skipped() {
        let liked = PostHandle {
            post_id: 10,
            like_count: 5,
            already_liked: true,
        };
        let page = MockPage::article(42, vec![liked, post(11, 0)]);
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 43,
            title: "next".into(),
            category_id: None,
        });
        let (mut c, api) = build(page, api);
        c.settings.auto_like = true;
        c.settings.quick_like = true;
        c.start_at(NOW);
        drive_to_bottom(&mut c);

        assert_eq!(api.toggled_posts(), vec![11]);
    }

    #[test]
    fn excluded_category_blocks_likes() {
        let mut page = MockPage::article(42, vec![post(10, 5)]);
        page.category = Some("Staff".into());
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 43,
            title: "next".into(),
            category_id: None,
        });
        let likes = LikeConfig {
            excluded_categories: vec!["Staff".into()],
            ..LikeConfig::default()
        };
        let (mut c, _api) = build_with(page, api, likes);
        c.settings.auto_like = true;
        c.start_at(NOW);
        drive_to_bottom(&mut c);

        assert_eq!(c.ledger.status().used, 0);
    }

    #[test]
    fn threshold_filter_is_exact() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        c.settings.like_filter = LikeFilterMode::Threshold;
        c.settings.like_min_threshold = 3;
        assert!(!c.should_like(2));
        assert!(c.should_like(3));
        assert!(c.should_like(100));
    }

    #[test]
    fn probability_filter_never_likes_singletons() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        c.settings.like_filter = LikeFilterMode::Probability;
        for _ in 0..100 {
            assert!(!c.should_like(0));
            assert!(!c.should_like(1));
        }
    }

    #[test]
    fn listing_start_fetches_and_navigates() {
        let page = MockPage::listing();
        let api = MockApi::default();
        api.topics.lock().extend([
            TopicSummary {
                id: 7,
                title: "a".into(),
                category_id: None,
            },
            TopicSummary {
                id: 8,
                title: "b".into(),
                category_id: None,
            },
        ]);
        let (mut c, _api) = build(page, api);
        c.start_at(NOW);

        assert_eq!(c.page().navigations.len(), 1);
        assert_eq!(
            c.page().navigations[0],
            Url::parse("https://forum.test/t/topic/7").unwrap()
        );
        // Guard sees the URL change and flips to scrolling.
        c.guard_tick_at(NOW + 1000);
        assert_eq!(c.state(), RunState::Scrolling);
    }

    #[test]
    fn visited_topics_are_skipped() {
        let page = MockPage::listing();
        let api = MockApi::default();
        api.topics.lock().extend([
            TopicSummary {
                id: 7,
                title: "a".into(),
                category_id: None,
            },
            TopicSummary {
                id: 8,
                title: "b".into(),
                category_id: None,
            },
        ]);
        let (mut c, _api) = build(page, api);
        c.visited = vec![7];
        c.start_at(NOW);

        assert_eq!(
            c.page().navigations,
            vec![Url::parse("https://forum.test/t/topic/8").unwrap()]
        );
    }

    #[test]
    fn empty_refetch_stops_with_notice() {
        let page = MockPage::listing();
        let (mut c, _api) = build(page, MockApi::default());
        c.start_at(NOW);

        assert_eq!(c.state(), RunState::Idle);
        assert!(c
            .page()
            .taken_notices()
            .contains(&"No more topics to read".to_string()));
    }

    #[test]
    fn fetch_failure_is_not_fatal_until_queue_empty() {
        let page = MockPage::listing();
        let api = MockApi::default();
        *api.fail_topics.lock() = true;
        let (mut c, _api) = build(page, api);
        c.start_at(NOW);
        // Failure degrades to an empty queue and a clean stop.
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn guard_recovers_stale_article() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        c.start_at(NOW);
        // Simulate a silent stall: scrolling stopped without a transition.
        c.state = RunState::AwaitingNavigation;

        // Under the 60s threshold nothing happens.
        c.guard_tick_at(NOW + 30_000);
        assert_eq!(c.state(), RunState::AwaitingNavigation);

        c.guard_tick_at(NOW + 61_000);
        assert_eq!(c.state(), RunState::Scrolling);
    }

    #[test]
    fn guard_recovers_stale_listing_by_navigating() {
        let page = MockPage::listing();
        let api = MockApi::default();
        api.topics.lock().push(TopicSummary {
            id: 9,
            title: "t".into(),
            category_id: None,
        });
        let (mut c, _api) = build(page, api);
        c.state = RunState::AwaitingNavigation;
        c.page_loaded_at = NOW;

        c.guard_tick_at(NOW + 31_000);
        assert_eq!(c.page().navigations.len(), 1);
    }

    #[test]
    fn guard_ignores_everything_when_idle() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        c.guard_tick_at(NOW + 600_000);
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn counters_rehydrate_from_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set(TOTAL_READ_KEY, &41u64).unwrap();
        store
            .set(
                TODAY_READ_KEY,
                &TodayRead {
                    date: date_string(NOW),
                    count: 3,
                },
            )
            .unwrap();
        store.set(READ_TOPICS_KEY, &vec![42u64]).unwrap();

        let api = Arc::new(MockApi::default());
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            api.clone(),
            LikeConfig::default(),
        ));
        let mut c = Controller::new(
            MockPage::article(42, vec![post(1, 0)]),
            api,
            ledger,
            store,
            PacingConfig::instant(),
            LikeConfig::default(),
        )
        .with_seed(7);

        assert_eq!(c.total_read, 41);
        assert_eq!(c.today.count, 3);
        c.mark_read(NOW);
        let stats = c.stats();
        assert_eq!(stats.session_read, 1);
        assert_eq!(stats.today_read, 4);
        assert_eq!(stats.total_read, 42);
        // Topic 42 was already in the visited set; no duplicate.
        assert_eq!(c.visited, vec![42]);
    }

    #[test]
    fn daily_counter_resets_on_date_change() {
        let page = MockPage::article(42, vec![post(1, 0)]);
        let (mut c, _api) = build(page, MockApi::default());
        c.today = TodayRead {
            date: "2001-01-01".into(),
            count: 99,
        };
        c.mark_read(NOW);
        assert_eq!(c.today.count, 1);
        assert_eq!(c.today.date, date_string(NOW));
    }
}
