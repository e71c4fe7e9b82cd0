//! Story database persistence + rate-limited HTTP fetching for roadreel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use roadreel_core::StoryDatabase;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roadreel-storage";

#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SavedDatabase {
    pub content_hash: String,
    pub byte_size: usize,
    pub unchanged: bool,
    pub backup: Option<StoredBackup>,
}

/// The story database JSON file. Every write goes through a temp file and a rename,
/// and the bytes being replaced are first copied into a hash-addressed backup.
#[derive(Debug, Clone)]
pub struct StoryStore {
    path: PathBuf,
    backups_root: PathBuf,
}

impl StoryStore {
    pub fn new(path: impl Into<PathBuf>, backups_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backups_root: backups_root.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn backup_relative_path(taken_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(taken_at.format("%Y%m%d_%H%M%S").to_string())
            .join(format!("story_database.{}.json", &content_hash[..content_hash.len().min(16)]))
    }

    pub async fn load(&self) -> anyhow::Result<StoryDatabase> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Persist `db`, skipping the write entirely when the serialized bytes match what is on disk.
    pub async fn save(
        &self,
        db: &StoryDatabase,
        taken_at: DateTime<Utc>,
    ) -> anyhow::Result<SavedDatabase> {
        let mut bytes = serde_json::to_vec_pretty(db).context("serializing story database")?;
        bytes.push(b'\n');
        let content_hash = Self::sha256_hex(&bytes);

        let previous = match fs::read(&self.path).await {
            Ok(previous) => Some(previous),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        if previous.as_deref().map(Self::sha256_hex).as_deref() == Some(content_hash.as_str()) {
            debug!(path = %self.path.display(), "story database unchanged; skipping write");
            return Ok(SavedDatabase {
                content_hash,
                byte_size: bytes.len(),
                unchanged: true,
                backup: None,
            });
        }

        let backup = match &previous {
            Some(previous) => Some(self.store_backup(taken_at, previous).await?),
            None => None,
        };

        write_atomically(&self.path, &bytes).await?;
        info!(path = %self.path.display(), bytes = bytes.len(), "story database saved");

        Ok(SavedDatabase {
            content_hash,
            byte_size: bytes.len(),
            unchanged: false,
            backup,
        })
    }

    async fn store_backup(
        &self,
        taken_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBackup> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::backup_relative_path(taken_at, &content_hash);
        let absolute_path = self.backups_root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking backup path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes).await?;
        }

        Ok(StoredBackup {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

/// Token bucket spreading requests evenly over time.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(requests, Duration::from_secs(60) / requests)
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if !self.refill_every.is_zero() {
                    let earned =
                        state.last_refill.elapsed().as_nanos() / self.refill_every.as_nanos();
                    if earned > 0 {
                        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                        state.tokens = state.tokens.saturating_add(earned).min(self.capacity);
                        state.last_refill += self.refill_every * earned.min(self.capacity);
                        if state.tokens == self.capacity {
                            state.last_refill = Instant::now();
                        }
                    }
                } else {
                    state.tokens = self.capacity;
                }

                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some("VideoGeneration/1.0".to_string()),
            max_in_flight: 4,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Single-shot HTTP failures. Messages carry the words failure classification keys on
/// (`network`, `timeout`, `api error`, `not found`).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network timeout after {timeout_secs}s fetching {url}")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("network connection error fetching {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} not found (http 404)")]
    NotFound { url: String },
    #[error("api error: http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("network error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http client unavailable: request slots closed")]
    Closed,
}

/// Shared HTTP client. Requests are not retried; the caller decides what a failure means.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            token_bucket: config
                .requests_per_minute
                .map(|rpm| Arc::new(TokenBucket::per_minute(rpm))),
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url);
        async move {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| self.classify(url, err))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound { url: final_url });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await.map_err(|err| self.classify(url, err))?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else if err.is_connect() {
            FetchError::Connect {
                url: url.to_string(),
                source: err,
            }
        } else {
            FetchError::Request(err)
        }
    }
}
