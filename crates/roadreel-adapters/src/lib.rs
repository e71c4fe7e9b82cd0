//! Search and media-lookup contracts + the Reddit JSON implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use roadreel_core::CandidatePost;
use roadreel_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "roadreel-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
const POST_LOCATOR_ORIGIN: &str = "https://reddit.com";

const VIDEO_PLATFORMS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "v.redd.it",
    "streamable.com",
    "gfycat.com",
    "imgur.com",
];

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov", ".avi", ".mkv", ".flv"];
const DIRECT_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov", ".avi"];

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("subreddit r/{category} not found")]
    CategoryNotFound { category: String },
    #[error(transparent)]
    Fetch(FetchError),
    #[error("parsing error: search response is not a listing: {0}")]
    Parse(String),
    /// Anything the provider did not expect; the orchestrator tags it with the tier.
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing error: post payload: {0}")]
    Parse(String),
}

/// Finds posts in a community. An empty `Ok` means the search ran and matched nothing.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        category: &str,
        terms: &[String],
    ) -> Result<Vec<CandidatePost>, SearchError>;
}

/// Best-effort lookup of playable media attached to a post.
#[async_trait]
pub trait MediaLocator: Send + Sync {
    async fn locate_media(&self, locator: &str) -> Result<Vec<MediaLink>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaKind {
    Youtube { video_id: Option<String> },
    Direct,
    RedditVideo,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLink {
    pub url: String,
    pub platform: String,
    pub kind: MediaKind,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: PostData,
}

#[derive(Debug, Default, Deserialize)]
struct PostData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: u64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    selftext_html: Option<String>,
    #[serde(default)]
    media: Option<PostMedia>,
    #[serde(default)]
    secure_media: Option<PostMedia>,
}

#[derive(Debug, Deserialize)]
struct PostMedia {
    #[serde(default)]
    reddit_video: Option<RedditVideo>,
}

#[derive(Debug, Deserialize)]
struct RedditVideo {
    fallback_url: String,
}

/// Children without a permalink cannot be turned into a post locator and are skipped.
pub fn parse_search_listing(body: &[u8]) -> Result<Vec<CandidatePost>, SearchError> {
    let listing: Listing =
        serde_json::from_slice(body).map_err(|e| SearchError::Parse(e.to_string()))?;
    Ok(listing
        .data
        .children
        .into_iter()
        .filter_map(|child| {
            let post = child.data;
            let permalink = post.permalink.trim();
            if permalink.is_empty() {
                debug!(title = %post.title, "listing child has no permalink; skipping");
                return None;
            }
            Some(CandidatePost {
                url: format!("{POST_LOCATOR_ORIGIN}{permalink}"),
                title: post.title,
                score: post.score,
                num_comments: post.num_comments,
            })
        })
        .collect())
}

/// Post payloads come either as `[post_listing, comments_listing]` or a bare listing.
pub fn parse_post_media(body: &[u8]) -> Result<Vec<MediaLink>, MediaError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| MediaError::Parse(e.to_string()))?;
    let listing_value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    let listing: Listing =
        serde_json::from_value(listing_value).map_err(|e| MediaError::Parse(e.to_string()))?;
    let post = listing
        .data
        .children
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::Parse("listing has no post".to_string()))?
        .data;
    media_links_for_post(&post)
}

fn media_links_for_post(post: &PostData) -> Result<Vec<MediaLink>, MediaError> {
    let mut candidates = Vec::new();
    if let Some(url) = &post.url {
        candidates.push(url.clone());
    }
    if let Some(html) = post.selftext_html.as_deref() {
        candidates.extend(links_in_html(html)?);
    }
    if let Some(text) = post.selftext.as_deref() {
        candidates.extend(links_in_text(text));
    }
    for media in [&post.media, &post.secure_media].into_iter().flatten() {
        if let Some(video) = &media.reddit_video {
            candidates.push(video.fallback_url.clone());
        }
    }

    let mut links: Vec<MediaLink> = Vec::new();
    for url in candidates {
        if links.iter().any(|l| l.url == url) {
            continue;
        }
        if let Some(link) = classify_media_link(&url) {
            links.push(link);
        }
    }
    Ok(links)
}

/// `selftext_html` arrives entity-escaped, so it is decoded once before the anchors are read.
fn links_in_html(escaped: &str) -> Result<Vec<String>, MediaError> {
    let decoded = Html::parse_fragment(escaped)
        .root_element()
        .text()
        .collect::<String>();
    let markup = if decoded.contains('<') { decoded } else { escaped.to_string() };
    let anchors = Selector::parse("a[href]").map_err(|e| MediaError::Parse(e.to_string()))?;
    Ok(Html::parse_fragment(&markup)
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.starts_with("http://") || href.starts_with("https://"))
        .map(ToString::to_string)
        .collect())
}

fn links_in_text(text: &str) -> Vec<String> {
    text.split(|c: char| {
        c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '<' | '>' | '"')
    })
    .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
    .map(|token| token.trim_end_matches(['.', ',', ';', '!', '?']))
    .filter(|token| Url::parse(token).is_ok())
    .map(ToString::to_string)
    .collect()
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn video_platform(host: &str) -> Option<&'static str> {
    VIDEO_PLATFORMS.iter().copied().find(|p| host_matches(host, p))
}

pub fn is_video_url(url: &str) -> bool {
    classify_media_link(url).is_some()
}

pub fn classify_media_link(url: &str) -> Option<MediaLink> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let path = parsed.path().to_ascii_lowercase();
    let platform = video_platform(&host);
    if platform.is_none() && !VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return None;
    }

    let kind = match platform {
        Some("youtube.com" | "youtu.be") => MediaKind::Youtube {
            video_id: youtube_video_id(url),
        },
        _ if DIRECT_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) => MediaKind::Direct,
        Some("v.redd.it") => MediaKind::RedditVideo,
        _ => MediaKind::Unknown,
    };

    Some(MediaLink {
        url: url.to_string(),
        platform: host,
        kind,
    })
}

/// `youtu.be/<id>`, `youtube.com/watch?v=<id>` and `youtube.com/embed/<id>`.
pub fn youtube_video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let raw = if host_matches(&host, "youtu.be") {
        segments.next()?.to_string()
    } else if host_matches(&host, "youtube.com") {
        match segments.next()? {
            "watch" => parsed
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())?,
            "embed" => segments.next()?.to_string(),
            _ => return None,
        }
    } else {
        return None;
    };
    let id: String = raw
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(11)
        .collect();
    (id.len() == 11).then_some(id)
}

/// The JSON view of a post locator: `.json` appended to the path, query kept.
pub fn post_json_url(locator: &str) -> String {
    let Ok(mut url) = Url::parse(locator) else {
        return locator.to_string();
    };
    let on_reddit = url.host_str().is_some_and(|host| host_matches(host, "reddit.com"));
    if !on_reddit || url.path().ends_with(".json") {
        return locator.to_string();
    }
    let path = format!("{}.json", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.to_string()
}

/// Live Reddit search + post lookups over the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct RedditClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    search_limit: usize,
}

impl RedditClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    pub fn search_url(&self, category: &str) -> String {
        format!("{}/r/{}/search.json", self.base_url, category)
    }
}

#[async_trait]
impl SearchProvider for RedditClient {
    async fn search(
        &self,
        category: &str,
        terms: &[String],
    ) -> Result<Vec<CandidatePost>, SearchError> {
        let url = self.search_url(category);
        let query = terms.join(" ");
        let limit = self.search_limit.to_string();
        let resp = self
            .http
            .fetch(
                &url,
                &[
                    ("q", query.as_str()),
                    ("restrict_sr", "1"),
                    ("sort", "top"),
                    ("limit", limit.as_str()),
                ],
            )
            .await
            .map_err(|err| match err {
                FetchError::NotFound { .. } => SearchError::CategoryNotFound {
                    category: category.to_string(),
                },
                other => SearchError::Fetch(other),
            })?;
        let posts = parse_search_listing(&resp.body)?;
        debug!(category, query = %query, posts = posts.len(), "reddit search complete");
        Ok(posts)
    }
}

#[async_trait]
impl MediaLocator for RedditClient {
    async fn locate_media(&self, locator: &str) -> Result<Vec<MediaLink>, MediaError> {
        let resp = self.http.fetch(&post_json_url(locator), &[]).await?;
        parse_post_media(&resp.body)
    }
}

/// Offline provider answering searches from captured listings under
/// `<root>/<category>.json`. A post is returned when its title contains any search term.
#[derive(Debug, Clone)]
pub struct FixtureSearchProvider {
    root: PathBuf,
}

impl FixtureSearchProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn listing_path(&self, category: &str) -> PathBuf {
        self.root.join(format!("{}.json", category.to_ascii_lowercase()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SearchProvider for FixtureSearchProvider {
    async fn search(
        &self,
        category: &str,
        terms: &[String],
    ) -> Result<Vec<CandidatePost>, SearchError> {
        let path = self.listing_path(category);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SearchError::CategoryNotFound {
                    category: category.to_string(),
                });
            }
            Err(err) => {
                return Err(SearchError::Internal(format!("reading {}: {err}", path.display())));
            }
        };
        let needles = terms.iter().map(|t| t.to_ascii_lowercase()).collect::<Vec<_>>();
        Ok(parse_search_listing(&body)?
            .into_iter()
            .filter(|post| {
                let title = post.title.to_ascii_lowercase();
                needles.iter().any(|n| title.contains(n.as_str()))
            })
            .collect())
    }
}

#[async_trait]
impl MediaLocator for FixtureSearchProvider {
    async fn locate_media(&self, _locator: &str) -> Result<Vec<MediaLink>, MediaError> {
        Ok(Vec::new())
    }
}
