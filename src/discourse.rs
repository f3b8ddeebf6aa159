use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

const CSRF_HEADER: &str = "X-CSRF-Token";
const REQUESTED_WITH_HEADER: &str = "X-Requested-With";
const LIKE_ACTION_ID: u64 = 2;

/// Observer notified synchronously after every like-toggle response, success
/// or rate-limit. This is the explicit interception seam: anything that
/// toggles a like through the client is seen by every observer, no global
/// request patching involved.
pub trait LikeObserver: Send + Sync {
    fn observe(&self, outcome: &ToggleOutcome);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Liked { post_id: u64 },
    Unliked { post_id: u64 },
    RateLimited { wait: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TopicSource {
    #[default]
    Latest,
    Unread,
}

impl TopicSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicSource::Latest => "latest",
            TopicSource::Unread => "unread",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    pub id: u64,
    pub title: String,
    pub category_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserAction {
    pub post_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub username: String,
    #[serde(default)]
    pub trust_level: Option<u8>,
}

/// Outcome of a current-user probe. A 429 is surfaced distinctly so callers
/// can back off instead of hammering the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Found(CurrentUser),
    Anonymous,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostView {
    pub id: u64,
    pub like_count: u32,
    pub acted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicView {
    pub id: u64,
    pub title: String,
    pub category: Option<String>,
    pub posts: Vec<PostView>,
}

/// The network collaborator, trait-shaped so the controller and ledger can
/// be exercised against mocks.
pub trait ForumApi: Send + Sync {
    fn base_url(&self) -> &Url;
    fn topics(&self, source: TopicSource, per_page: usize) -> Result<Vec<TopicSummary>>;
    fn topic(&self, topic_id: u64) -> Result<TopicView>;
    fn user_actions(&self, username: &str, offset: usize) -> Result<Vec<UserAction>>;
    fn current_user(&self) -> Result<UserLookup>;
    fn toggle_like(&self, post_id: u64) -> Result<ToggleOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    csrf_token: Mutex<Option<String>>,
    categories: Mutex<Option<HashMap<u64, String>>>,
    observers: Mutex<Vec<Arc<dyn LikeObserver>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("discourse client user agent required");
        }
        let base_url = Url::parse(&config.base_url).context("discourse: parse base url")?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .cookie_store(true)
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            csrf_token: Mutex::new(None),
            categories: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn LikeObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify(&self, outcome: &ToggleOutcome) {
        for observer in self.observers.lock().iter() {
            observer.observe(outcome);
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        let resp = self
            .http
            .request(Method::GET, url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            bail!("discourse: api error {} for {}", status, path);
        }
        Ok(resp.json()?)
    }

    fn csrf_token(&self) -> Result<String> {
        if let Some(token) = self.csrf_token.lock().clone() {
            return Ok(token);
        }
        let payload: CsrfEnvelope = {
            let url = self.base_url.join("/session/csrf.json")?;
            let resp = self
                .http
                .request(Method::GET, url)
                .header(USER_AGENT, self.user_agent.clone())
                .header(REQUESTED_WITH_HEADER, "XMLHttpRequest")
                .send()?;
            if !resp.status().is_success() {
                bail!("discourse: csrf fetch failed with {}", resp.status());
            }
            resp.json()?
        };
        if payload.csrf.is_empty() {
            bail!("discourse: empty csrf token");
        }
        *self.csrf_token.lock() = Some(payload.csrf.clone());
        Ok(payload.csrf)
    }

    fn category_names(&self) -> HashMap<u64, String> {
        if let Some(cached) = self.categories.lock().clone() {
            return cached;
        }
        let fetched: Result<CategoryEnvelope> = self.get_json("/categories.json", &[]);
        let map = match fetched {
            Ok(envelope) => envelope
                .category_list
                .categories
                .into_iter()
                .map(|c| (c.id, c.name))
                .collect(),
            Err(err) => {
                tracing::debug!("category list unavailable: {err:#}");
                HashMap::new()
            }
        };
        *self.categories.lock() = Some(map.clone());
        map
    }
}

impl ForumApi for Client {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn topics(&self, source: TopicSource, per_page: usize) -> Result<Vec<TopicSummary>> {
        let path = format!("/{}.json", source.as_str());
        let envelope: TopicListEnvelope =
            self.get_json(&path, &[("per_page", per_page.to_string())])?;
        Ok(envelope
            .topic_list
            .topics
            .into_iter()
            .map(|t| TopicSummary {
                id: t.id,
                title: t.title,
                category_id: t.category_id,
            })
            .collect())
    }

    fn topic(&self, topic_id: u64) -> Result<TopicView> {
        let envelope: TopicEnvelope = self.get_json(&format!("/t/{topic_id}.json"), &[])?;
        let category = envelope
            .category_id
            .and_then(|id| self.category_names().get(&id).cloned());
        let posts = envelope
            .post_stream
            .posts
            .into_iter()
            .map(|p| {
                let like = p
                    .actions_summary
                    .iter()
                    .find(|a| a.id == LIKE_ACTION_ID);
                PostView {
                    id: p.id,
                    like_count: like.map(|a| a.count).unwrap_or(0),
                    acted: like.map(|a| a.acted).unwrap_or(false),
                }
            })
            .collect();
        Ok(TopicView {
            id: envelope.id,
            title: envelope.title,
            category,
            posts,
        })
    }

    fn user_actions(&self, username: &str, offset: usize) -> Result<Vec<UserAction>> {
        let envelope: UserActionsEnvelope = self.get_json(
            "/user_actions.json",
            &[
                ("limit", "50".to_string()),
                ("username", username.to_string()),
                ("filter", LIKE_ACTION_ID.to_string()),
                ("offset", offset.to_string()),
            ],
        )?;
        Ok(envelope
            .user_actions
            .into_iter()
            .filter_map(|a| {
                Some(UserAction {
                    post_id: a.post_id?,
                    created_at: a.created_at?,
                })
            })
            .collect())
    }

    fn current_user(&self) -> Result<UserLookup> {
        let url = self.base_url.join("/session/current.json")?;
        let resp = self
            .http
            .request(Method::GET, url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Ok(UserLookup::RateLimited);
        }
        if status.as_u16() == 404 || status.as_u16() == 403 {
            return Ok(UserLookup::Anonymous);
        }
        if !status.is_success() {
            bail!("discourse: session/current failed with {status}");
        }
        let envelope: CurrentUserEnvelope = resp.json()?;
        Ok(match envelope.current_user {
            Some(user) => UserLookup::Found(user),
            None => UserLookup::Anonymous,
        })
    }

    fn toggle_like(&self, post_id: u64) -> Result<ToggleOutcome> {
        let token = self.csrf_token()?;
        let url = self.base_url.join(&format!(
            "/discourse-reactions/posts/{post_id}/custom-reactions/heart/toggle.json"
        ))?;
        let resp = self
            .http
            .request(Method::PUT, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(CSRF_HEADER, token)
            .header(REQUESTED_WITH_HEADER, "XMLHttpRequest")
            .send()?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .with_context(|| format!("discourse: decode toggle response ({status})"))?;
        let outcome = parse_toggle_response(post_id, &body)
            .ok_or_else(|| anyhow!("discourse: unexpected toggle response ({status}): {body}"))?;
        self.notify(&outcome);
        Ok(outcome)
    }
}

/// Decode a toggle response body into an outcome. A structured rate-limit
/// payload is domain data, not an error; anything else unrecognized is None.
pub fn parse_toggle_response(post_id: u64, body: &serde_json::Value) -> Option<ToggleOutcome> {
    if body.get("errors").is_some() {
        if body.get("error_type").and_then(|v| v.as_str()) == Some("rate_limit") {
            let wait_seconds = body
                .get("extras")
                .and_then(|e| e.get("wait_seconds"))
                .and_then(|w| w.as_u64())
                .unwrap_or(0);
            return Some(ToggleOutcome::RateLimited {
                wait: Duration::from_secs(wait_seconds),
            });
        }
        return None;
    }
    let affected = body
        .get("resource_post_id")
        .or_else(|| body.get("id"))
        .and_then(|v| v.as_u64());
    affected?;
    let reacted = body
        .get("current_user_reaction")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    Some(if reacted {
        ToggleOutcome::Liked { post_id }
    } else {
        ToggleOutcome::Unliked { post_id }
    })
}

#[derive(Debug, Deserialize)]
struct CsrfEnvelope {
    #[serde(default)]
    csrf: String,
}

#[derive(Debug, Deserialize)]
struct TopicListEnvelope {
    #[serde(default)]
    topic_list: TopicListBody,
}

#[derive(Debug, Deserialize, Default)]
struct TopicListBody {
    #[serde(default)]
    topics: Vec<TopicEntry>,
}

#[derive(Debug, Deserialize)]
struct TopicEntry {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    category_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TopicEnvelope {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    category_id: Option<u64>,
    #[serde(default)]
    post_stream: PostStream,
}

#[derive(Debug, Deserialize, Default)]
struct PostStream {
    #[serde(default)]
    posts: Vec<PostEntry>,
}

#[derive(Debug, Deserialize)]
struct PostEntry {
    id: u64,
    #[serde(default)]
    actions_summary: Vec<ActionSummary>,
}

#[derive(Debug, Deserialize)]
struct ActionSummary {
    id: u64,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    acted: bool,
}

#[derive(Debug, Deserialize)]
struct UserActionsEnvelope {
    #[serde(default)]
    user_actions: Vec<UserActionEntry>,
}

#[derive(Debug, Deserialize)]
struct UserActionEntry {
    #[serde(default)]
    post_id: Option<u64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CurrentUserEnvelope {
    #[serde(default)]
    current_user: Option<CurrentUser>,
}

#[derive(Debug, Deserialize)]
struct CategoryEnvelope {
    #[serde(default)]
    category_list: CategoryListBody,
}

#[derive(Debug, Deserialize, Default)]
struct CategoryListBody {
    #[serde(default)]
    categories: Vec<CategoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    id: u64,
    #[serde(default)]
    name: String,
}
