use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::Store;

const DEFAULT_ENV_PREFIX: &str = "LURKER";

pub const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub forum: ForumConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub likes: LikeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForumConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "https://meta.discourse.org".to_string()
}

fn default_user_agent() -> String {
    format!("lurker/{} (+https://github.com/danielmerja/lurker)", env!("CARGO_PKG_VERSION"))
}

/// Timing and scroll-shape constants for the simulated reader.
///
/// All of these are soft knobs: the defaults reproduce the behaviour the bot
/// was tuned with, and tests zero them out to run instantly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacingConfig {
    /// Normal scroll distance range, pixels per tick.
    #[serde(default = "default_scroll_min")]
    pub scroll_min: u32,
    #[serde(default = "default_scroll_max")]
    pub scroll_max: u32,
    /// Occasional faster "skim" scroll range and its per-tick chance.
    #[serde(default = "default_skim_min")]
    pub skim_min: u32,
    #[serde(default = "default_skim_max")]
    pub skim_max: u32,
    #[serde(default = "default_skim_chance")]
    pub skim_chance: f64,
    /// Chance per tick of an extra randomized pause, and its range.
    #[serde(default = "default_pause_chance")]
    pub pause_chance: f64,
    #[serde(default = "default_pause_min", with = "humantime_serde")]
    pub pause_min: Duration,
    #[serde(default = "default_pause_max", with = "humantime_serde")]
    pub pause_max: Duration,
    /// Scroll tick interval.
    #[serde(default = "default_scroll_tick", with = "humantime_serde")]
    pub scroll_tick: Duration,
    /// Settle wait after reaching the bottom before checking loaded state.
    #[serde(default = "default_settle_wait", with = "humantime_serde")]
    pub settle_wait: Duration,
    /// Delay range before navigating to the next topic.
    #[serde(default = "default_nav_delay_min", with = "humantime_serde")]
    pub nav_delay_min: Duration,
    #[serde(default = "default_nav_delay_max", with = "humantime_serde")]
    pub nav_delay_max: Duration,
    /// Jitter before liking the root post.
    #[serde(default = "default_like_jitter_min", with = "humantime_serde")]
    pub like_jitter_min: Duration,
    #[serde(default = "default_like_jitter_max", with = "humantime_serde")]
    pub like_jitter_max: Duration,
    /// Shorter jitter between quick-liked replies.
    #[serde(default = "default_reply_jitter_min", with = "humantime_serde")]
    pub reply_jitter_min: Duration,
    #[serde(default = "default_reply_jitter_max", with = "humantime_serde")]
    pub reply_jitter_max: Duration,
    /// Navigation guard tick interval.
    #[serde(default = "default_guard_tick", with = "humantime_serde")]
    pub guard_tick: Duration,
    /// Time on an article page without scrolling before recovery kicks in.
    #[serde(default = "default_stale_article", with = "humantime_serde")]
    pub stale_article: Duration,
    /// Time on a non-article page before recovery kicks in.
    #[serde(default = "default_stale_other", with = "humantime_serde")]
    pub stale_other: Duration,
    /// Pause inside recovery before resuming.
    #[serde(default = "default_recover_wait", with = "humantime_serde")]
    pub recover_wait: Duration,
    /// Settle delay before scrolling starts on a freshly arrived page.
    #[serde(default = "default_resume_wait", with = "humantime_serde")]
    pub resume_wait: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            scroll_min: default_scroll_min(),
            scroll_max: default_scroll_max(),
            skim_min: default_skim_min(),
            skim_max: default_skim_max(),
            skim_chance: default_skim_chance(),
            pause_chance: default_pause_chance(),
            pause_min: default_pause_min(),
            pause_max: default_pause_max(),
            scroll_tick: default_scroll_tick(),
            settle_wait: default_settle_wait(),
            nav_delay_min: default_nav_delay_min(),
            nav_delay_max: default_nav_delay_max(),
            like_jitter_min: default_like_jitter_min(),
            like_jitter_max: default_like_jitter_max(),
            reply_jitter_min: default_reply_jitter_min(),
            reply_jitter_max: default_reply_jitter_max(),
            guard_tick: default_guard_tick(),
            stale_article: default_stale_article(),
            stale_other: default_stale_other(),
            recover_wait: default_recover_wait(),
            resume_wait: default_resume_wait(),
        }
    }
}

impl PacingConfig {
    /// All delays zeroed; used by tests so ticks run without sleeping.
    pub fn instant() -> Self {
        Self {
            pause_chance: 0.0,
            pause_min: Duration::ZERO,
            pause_max: Duration::ZERO,
            scroll_tick: Duration::ZERO,
            settle_wait: Duration::ZERO,
            nav_delay_min: Duration::ZERO,
            nav_delay_max: Duration::ZERO,
            like_jitter_min: Duration::ZERO,
            like_jitter_max: Duration::ZERO,
            reply_jitter_min: Duration::ZERO,
            reply_jitter_max: Duration::ZERO,
            guard_tick: Duration::ZERO,
            recover_wait: Duration::ZERO,
            resume_wait: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn default_scroll_min() -> u32 {
    80
}

fn default_scroll_max() -> u32 {
    150
}

fn default_skim_min() -> u32 {
    200
}

fn default_skim_max() -> u32 {
    400
}

fn default_skim_chance() -> f64 {
    0.15
}

fn default_pause_chance() -> f64 {
    0.1
}

fn default_pause_min() -> Duration {
    Duration::from_millis(100)
}

fn default_pause_max() -> Duration {
    Duration::from_millis(300)
}

fn default_scroll_tick() -> Duration {
    Duration::from_millis(200)
}

fn default_settle_wait() -> Duration {
    Duration::from_millis(800)
}

fn default_nav_delay_min() -> Duration {
    Duration::from_millis(1000)
}

fn default_nav_delay_max() -> Duration {
    Duration::from_millis(2000)
}

fn default_like_jitter_min() -> Duration {
    Duration::from_millis(500)
}

fn default_like_jitter_max() -> Duration {
    Duration::from_millis(1500)
}

fn default_reply_jitter_min() -> Duration {
    Duration::from_millis(300)
}

fn default_reply_jitter_max() -> Duration {
    Duration::from_millis(800)
}

fn default_guard_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_article() -> Duration {
    Duration::from_secs(60)
}

fn default_stale_other() -> Duration {
    Duration::from_secs(30)
}

fn default_recover_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_resume_wait() -> Duration {
    Duration::from_secs(1)
}

/// Like-quota and like-filter shape configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LikeConfig {
    /// Daily like quota per trust level (index = level 0..4).
    #[serde(default = "default_daily_limits")]
    pub daily_limits: Vec<u32>,
    /// Fallback quota when the trust level is unknown.
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit: u32,
    /// Probability-filter curve: min(cap, base + slope * log10(n)).
    #[serde(default)]
    pub curve: ProbabilityCurve,
    /// Category labels where auto-like is allowed. Empty means all allowed.
    #[serde(default)]
    pub allowed_categories: Vec<String>,
    /// Category labels where auto-like is never applied.
    #[serde(default)]
    pub excluded_categories: Vec<String>,
}

impl Default for LikeConfig {
    fn default() -> Self {
        Self {
            daily_limits: default_daily_limits(),
            fallback_limit: default_fallback_limit(),
            curve: ProbabilityCurve::default(),
            allowed_categories: Vec::new(),
            excluded_categories: Vec::new(),
        }
    }
}

fn default_daily_limits() -> Vec<u32> {
    vec![50, 50, 75, 100, 150]
}

fn default_fallback_limit() -> u32 {
    50
}

impl LikeConfig {
    pub fn limit_for(&self, trust_level: Option<u8>) -> u32 {
        trust_level
            .and_then(|level| self.daily_limits.get(level as usize).copied())
            .unwrap_or(self.fallback_limit)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProbabilityCurve {
    #[serde(default = "default_curve_base")]
    pub base: f64,
    #[serde(default = "default_curve_slope")]
    pub slope: f64,
    #[serde(default = "default_curve_cap")]
    pub cap: f64,
}

impl Default for ProbabilityCurve {
    fn default() -> Self {
        Self {
            base: default_curve_base(),
            slope: default_curve_slope(),
            cap: default_curve_cap(),
        }
    }
}

fn default_curve_base() -> f64 {
    0.2
}

fn default_curve_slope() -> f64 {
    0.35
}

fn default_curve_cap() -> f64 {
    0.95
}

impl ProbabilityCurve {
    /// Probability of liking a post with `n` visible likes. Posts with one
    /// like or fewer are never liked in probability mode.
    pub fn probability(&self, n: u32) -> f64 {
        if n <= 1 {
            return 0.0;
        }
        (self.base + self.slope * (n as f64).log10()).min(self.cap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = read_config_file(path)?;
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "forum.base_url" => cfg.forum.base_url = value,
        "forum.user_agent" => cfg.forum.user_agent = value,
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        "likes.fallback_limit" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.likes.fallback_limit = parsed;
            }
        }
        "likes.allowed_categories" => {
            cfg.likes.allowed_categories = split_list(&value);
        }
        "likes.excluded_categories" => {
            cfg.likes.excluded_categories = split_list(&value);
        }
        "pacing.scroll_tick" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.pacing.scroll_tick = duration;
            }
        }
        "pacing.guard_tick" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.pacing.guard_tick = duration;
            }
        }
        _ => {}
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lurker").join("config.yaml"))
}

/// How posts are filtered before an auto-like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LikeFilterMode {
    #[default]
    Off,
    Threshold,
    Probability,
}

/// User-adjustable run settings, persisted as one blob in the store and
/// surfaced to the control panel one field at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    #[serde(default)]
    pub auto_like: bool,
    #[serde(default)]
    pub quick_like: bool,
    #[serde(default)]
    pub read_unread: bool,
    #[serde(default)]
    pub random_order: bool,
    #[serde(default = "default_true")]
    pub skip_read: bool,
    #[serde(default)]
    pub stop_on_like_limit: bool,
    #[serde(default)]
    pub stop_after_read: bool,
    #[serde(default = "default_stop_after_read_count")]
    pub stop_after_read_count: u64,
    #[serde(default = "default_topic_limit")]
    pub topic_limit: usize,
    #[serde(default)]
    pub like_filter: LikeFilterMode,
    #[serde(default = "default_like_min_threshold")]
    pub like_min_threshold: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            auto_like: false,
            quick_like: false,
            read_unread: false,
            random_order: false,
            skip_read: default_true(),
            stop_on_like_limit: false,
            stop_after_read: false,
            stop_after_read_count: default_stop_after_read_count(),
            topic_limit: default_topic_limit(),
            like_filter: LikeFilterMode::Off,
            like_min_threshold: default_like_min_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stop_after_read_count() -> u64 {
    10
}

fn default_topic_limit() -> usize {
    100
}

fn default_like_min_threshold() -> u32 {
    3
}

impl RunSettings {
    pub fn load(store: &Store) -> Self {
        store.get(SETTINGS_KEY, RunSettings::default())
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.set(SETTINGS_KEY, self)
    }

    /// Apply a single panel-originated setting change. Unknown keys and
    /// mistyped values are ignored.
    pub fn apply(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            "auto_like" => apply_bool(&mut self.auto_like, value),
            "quick_like" => apply_bool(&mut self.quick_like, value),
            "read_unread" => apply_bool(&mut self.read_unread, value),
            "random_order" => apply_bool(&mut self.random_order, value),
            "skip_read" => apply_bool(&mut self.skip_read, value),
            "stop_on_like_limit" => apply_bool(&mut self.stop_on_like_limit, value),
            "stop_after_read" => apply_bool(&mut self.stop_after_read, value),
            "stop_after_read_count" => {
                if let Some(parsed) = value.as_u64() {
                    self.stop_after_read_count = parsed;
                }
            }
            "topic_limit" => {
                if let Some(parsed) = value.as_u64() {
                    self.topic_limit = parsed as usize;
                }
            }
            "like_filter" => {
                if let Some(mode) = value.as_str() {
                    match mode {
                        "off" => self.like_filter = LikeFilterMode::Off,
                        "threshold" => self.like_filter = LikeFilterMode::Threshold,
                        "probability" => self.like_filter = LikeFilterMode::Probability,
                        _ => {}
                    }
                }
            }
            "like_min_threshold" => {
                if let Some(parsed) = value.as_u64() {
                    self.like_min_threshold = parsed as u32;
                }
            }
            _ => {}
        }
    }
}

fn apply_bool(slot: &mut bool, value: &serde_json::Value) {
    if let Some(parsed) = value.as_bool() {
        *slot = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            env_prefix: Some("LURKER_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.likes.fallback_limit, 50);
        assert_eq!(cfg.pacing.scroll_tick, Duration::from_millis(200));
    }

    #[test]
    fn env_overrides() {
        env::set_var("LURKER_CFGTEST_FORUM__BASE_URL", "https://forum.test");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            env_prefix: Some("LURKER_CFGTEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.forum.base_url, "https://forum.test");
        env::remove_var("LURKER_CFGTEST_FORUM__BASE_URL");
    }

    #[test]
    fn limit_for_trust_level() {
        let likes = LikeConfig::default();
        assert_eq!(likes.limit_for(Some(0)), 50);
        assert_eq!(likes.limit_for(Some(2)), 75);
        assert_eq!(likes.limit_for(Some(4)), 150);
        assert_eq!(likes.limit_for(Some(9)), 50);
        assert_eq!(likes.limit_for(None), 50);
    }

    #[test]
    fn probability_curve_shape() {
        let curve = ProbabilityCurve::default();
        assert_eq!(curve.probability(0), 0.0);
        assert_eq!(curve.probability(1), 0.0);
        // Monotone non-decreasing above 1, capped at 0.95.
        let mut last = 0.0;
        for n in 2..2000u32 {
            let p = curve.probability(n);
            assert!(p >= last, "curve dipped at n={n}");
            assert!(p <= 0.95 + f64::EPSILON);
            last = p;
        }
        assert!((curve.probability(10) - 0.55).abs() < 1e-9);
        assert_eq!(curve.probability(1_000_000), 0.95);
    }

    #[test]
    fn settings_roundtrip_through_store() {
        let store = Store::open_in_memory().unwrap();
        let mut settings = RunSettings::load(&store);
        assert!(settings.skip_read);
        assert_eq!(settings.stop_after_read_count, 10);

        settings.apply("auto_like", &json!(true));
        settings.apply("like_filter", &json!("threshold"));
        settings.apply("like_min_threshold", &json!(5));
        settings.apply("bogus_key", &json!("ignored"));
        settings.apply("auto_like", &json!("not a bool"));
        settings.save(&store).unwrap();

        let reloaded = RunSettings::load(&store);
        assert!(reloaded.auto_like);
        assert_eq!(reloaded.like_filter, LikeFilterMode::Threshold);
        assert_eq!(reloaded.like_min_threshold, 5);
    }
}
