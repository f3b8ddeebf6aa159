use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::discourse::{ForumApi, TopicView};

/// Pixel height budgeted per post when deriving a topic's content height.
const POST_HEIGHT: u32 = 600;
/// Simulated viewport height.
const VIEWPORT_HEIGHT: u32 = 900;
/// "Near bottom" margin, matching the 200px the scroll check uses.
const BOTTOM_MARGIN: u32 = 200;

static TOPIC_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/t/(?:[^/]+/)?(\d+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Article { topic_id: u64 },
    Listing,
    Other,
}

impl PageKind {
    pub fn is_article(&self) -> bool {
        matches!(self, PageKind::Article { .. })
    }

    pub fn classify(url: &Url) -> PageKind {
        let path = url.path();
        if let Some(caps) = TOPIC_PATH.captures(path) {
            if let Ok(topic_id) = caps[1].parse() {
                return PageKind::Article { topic_id };
            }
        }
        if path == "/"
            || path.starts_with("/latest")
            || path.starts_with("/unread")
            || path.starts_with("/new")
            || path.starts_with("/top")
            || path.starts_with("/c/")
            || path.starts_with("/categories")
        {
            return PageKind::Listing;
        }
        PageKind::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostHandle {
    pub post_id: u64,
    pub like_count: u32,
    pub already_liked: bool,
}

/// The rendered-page collaborator. The controller only ever talks to a page
/// through this surface; production uses [`RemotePage`], tests use
/// [`MockPage`].
pub trait PageSurface: Send {
    fn current_url(&self) -> Url;
    fn kind(&self) -> PageKind;
    fn scroll_by(&mut self, distance: u32);
    fn near_bottom(&self) -> bool;
    /// True once no loading/infinite-scroll indicator remains.
    fn content_settled(&self) -> bool;
    fn posts(&self) -> Vec<PostHandle>;
    fn category_label(&self) -> Option<String>;
    /// Full top-level navigation. Discards all scroll state.
    fn navigate_to(&mut self, url: &Url) -> Result<()>;
    /// Short-lived user-visible notice.
    fn notice(&self, message: &str);
}

/// Headless page: models an article as the topic's post stream fetched over
/// the API, with a simulated viewport scrolled across a derived content
/// height. Navigation refetches and resets the viewport, which is the
/// headless equivalent of a full page load.
pub struct RemotePage {
    api: Arc<dyn ForumApi>,
    url: Url,
    view: Option<TopicView>,
    scroll_top: u32,
    content_height: u32,
}

impl RemotePage {
    pub fn new(api: Arc<dyn ForumApi>, start_url: Url) -> Self {
        let mut page = Self {
            api,
            url: start_url.clone(),
            view: None,
            scroll_top: 0,
            content_height: 0,
        };
        // Best effort; a failed initial load is recovered by the guard.
        if let Err(err) = page.navigate_to(&start_url) {
            tracing::warn!("initial page load failed: {err:#}");
        }
        page
    }
}

impl PageSurface for RemotePage {
    fn current_url(&self) -> Url {
        self.url.clone()
    }

    fn kind(&self) -> PageKind {
        PageKind::classify(&self.url)
    }

    fn scroll_by(&mut self, distance: u32) {
        let max = self.content_height.saturating_sub(VIEWPORT_HEIGHT);
        self.scroll_top = (self.scroll_top + distance).min(max);
    }

    fn near_bottom(&self) -> bool {
        self.scroll_top + VIEWPORT_HEIGHT + BOTTOM_MARGIN >= self.content_height
    }

    fn content_settled(&self) -> bool {
        match self.kind() {
            // Settled once the post stream is materialized.
            PageKind::Article { .. } => self.view.is_some(),
            _ => true,
        }
    }

    fn posts(&self) -> Vec<PostHandle> {
        self.view
            .as_ref()
            .map(|view| {
                view.posts
                    .iter()
                    .map(|p| PostHandle {
                        post_id: p.id,
                        like_count: p.like_count,
                        already_liked: p.acted,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn category_label(&self) -> Option<String> {
        self.view.as_ref().and_then(|view| view.category.clone())
    }

    fn navigate_to(&mut self, url: &Url) -> Result<()> {
        self.url = url.clone();
        self.view = None;
        self.scroll_top = 0;
        self.content_height = 0;

        if let PageKind::Article { topic_id } = PageKind::classify(url) {
            let view = self
                .api
                .topic(topic_id)
                .with_context(|| format!("page: load topic {topic_id}"))?;
            self.content_height = (view.posts.len() as u32).max(1) * POST_HEIGHT;
            self.view = Some(view);
        }
        Ok(())
    }

    fn notice(&self, message: &str) {
        tracing::info!(target: "lurker::notice", "{message}");
    }
}

/// Scripted page surface for tests, in the same spirit as the mock services
/// the data layer ships.
#[cfg(test)]
#[derive(Default)]
pub struct MockPage {
    pub url: Option<Url>,
    pub posts: Vec<PostHandle>,
    pub category: Option<String>,
    pub content_height: u32,
    pub scroll_top: u32,
    pub settled: bool,
    pub scrolls: Vec<u32>,
    pub navigations: Vec<Url>,
    pub notices: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockPage {
    pub fn article(topic_id: u64, posts: Vec<PostHandle>) -> Self {
        let url = Url::parse(&format!("https://forum.test/t/topic/{topic_id}")).unwrap();
        Self {
            url: Some(url),
            content_height: (posts.len() as u32).max(1) * POST_HEIGHT,
            posts,
            settled: true,
            ..Self::default()
        }
    }

    pub fn listing() -> Self {
        Self {
            url: Some(Url::parse("https://forum.test/latest").unwrap()),
            settled: true,
            ..Self::default()
        }
    }

    pub fn taken_notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

#[cfg(test)]
impl PageSurface for MockPage {
    fn current_url(&self) -> Url {
        self.url
            .clone()
            .unwrap_or_else(|| Url::parse("https://forum.test/").unwrap())
    }

    fn kind(&self) -> PageKind {
        PageKind::classify(&self.current_url())
    }

    fn scroll_by(&mut self, distance: u32) {
        self.scrolls.push(distance);
        let max = self.content_height.saturating_sub(VIEWPORT_HEIGHT);
        self.scroll_top = (self.scroll_top + distance).min(max);
    }

    fn near_bottom(&self) -> bool {
        self.scroll_top + VIEWPORT_HEIGHT + BOTTOM_MARGIN >= self.content_height
    }

    fn content_settled(&self) -> bool {
        self.settled
    }

    fn posts(&self) -> Vec<PostHandle> {
        self.posts.clone()
    }

    fn category_label(&self) -> Option<String> {
        self.category.clone()
    }

    fn navigate_to(&mut self, url: &Url) -> Result<()> {
        self.navigations.push(url.clone());
        self.url = Some(url.clone());
        self.scroll_top = 0;
        Ok(())
    }

    fn notice(&self, message: &str) {
        self.notices.lock().push(message.to_string());
    }
}
