//! Shared scaffolding for unit tests: a scriptable forum API.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use url::Url;

use crate::discourse::{
    CurrentUser, ForumApi, LikeObserver, ToggleOutcome, TopicSource, TopicSummary, TopicView,
    UserAction, UserLookup,
};

/// Scriptable [`ForumApi`]: listings, topic views, action-history pages, and
/// toggle outcomes are all injected; every call is recorded. Toggle outcomes
/// default to `Liked` when nothing is scripted.
pub struct MockApi {
    pub base: Url,
    pub topics: Mutex<Vec<TopicSummary>>,
    pub topic_views: Mutex<HashMap<u64, TopicView>>,
    pub action_pages: Mutex<Vec<Vec<UserAction>>>,
    pub user: Mutex<UserLookup>,
    pub toggle_script: Mutex<VecDeque<ToggleOutcome>>,
    pub toggled: Mutex<Vec<u64>>,
    pub fail_topics: Mutex<bool>,
    pub observers: Mutex<Vec<Arc<dyn LikeObserver>>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            base: Url::parse("https://forum.test").unwrap(),
            topics: Mutex::new(Vec::new()),
            topic_views: Mutex::new(HashMap::new()),
            action_pages: Mutex::new(Vec::new()),
            user: Mutex::new(UserLookup::Anonymous),
            toggle_script: Mutex::new(VecDeque::new()),
            toggled: Mutex::new(Vec::new()),
            fail_topics: Mutex::new(false),
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl MockApi {
    pub fn with_user(username: &str, trust_level: Option<u8>) -> Self {
        let api = Self::default();
        *api.user.lock() = UserLookup::Found(CurrentUser {
            username: username.into(),
            trust_level,
        });
        api
    }

    pub fn add_observer(&self, observer: Arc<dyn LikeObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn script_toggle(&self, outcome: ToggleOutcome) {
        self.toggle_script.lock().push_back(outcome);
    }

    pub fn toggled_posts(&self) -> Vec<u64> {
        self.toggled.lock().clone()
    }

    fn notify(&self, outcome: &ToggleOutcome) {
        for observer in self.observers.lock().iter() {
            observer.observe(outcome);
        }
    }
}

impl ForumApi for MockApi {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn topics(&self, _source: TopicSource, per_page: usize) -> Result<Vec<TopicSummary>> {
        if *self.fail_topics.lock() {
            bail!("mock: topic listing unavailable");
        }
        let topics = self.topics.lock();
        Ok(topics.iter().take(per_page).cloned().collect())
    }

    fn topic(&self, topic_id: u64) -> Result<TopicView> {
        match self.topic_views.lock().get(&topic_id) {
            Some(view) => Ok(view.clone()),
            None => bail!("mock: unknown topic {topic_id}"),
        }
    }

    fn user_actions(&self, _username: &str, offset: usize) -> Result<Vec<UserAction>> {
        let pages = self.action_pages.lock();
        Ok(pages.get(offset / 50).cloned().unwrap_or_default())
    }

    fn current_user(&self) -> Result<UserLookup> {
        Ok(self.user.lock().clone())
    }

    fn toggle_like(&self, post_id: u64) -> Result<ToggleOutcome> {
        self.toggled.lock().push(post_id);
        let outcome = self
            .toggle_script
            .lock()
            .pop_front()
            .unwrap_or(ToggleOutcome::Liked { post_id });
        self.notify(&outcome);
        Ok(outcome)
    }
}
