use crate::error::UpdateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const GITHUB_API_HEADER: &str = "X-GitHub-Api-Version";
const GITHUB_API_VERSION: &str = "2022-11-28";
const GITHUB_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const GITHUB_RATELIMIT_RESET: &str = "x-ratelimit-reset";
const USER_AGENT: &str = concat!("geode-launcher/", env!("CARGO_PKG_VERSION"));

pub const NIGHTLY_TAG: &str = "nightly";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub url: String,
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub url: String,
    pub id: u64,
    pub target_commitish: String,
    pub tag_name: String,
    pub created_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Release {
    /// Human readable version. Nightly builds are named after the commit
    /// embedded in their asset names (`geode-<commit>-...`).
    pub fn description(&self) -> String {
        if self.tag_name == NIGHTLY_TAG {
            if let Some(commit) = self.assets.first().and_then(|a| a.name.get(6..13)) {
                return format!("nightly-{}", commit);
            }
        }
        self.tag_name.clone()
    }

    /// Value compared against the installed build to detect a new release.
    pub fn descriptor(&self) -> i64 {
        self.created_at.timestamp()
    }

    pub fn download_for(&self, platform: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name.contains(platform))
    }
}

/// Release channel followed by the updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    #[default]
    Stable,
    Nightly,
}

/// A download in progress: total size if known, and the body chunks.
pub struct Download {
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, UpdateError>>,
}

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_release(&self, channel: ReleaseChannel) -> Result<Option<Release>, UpdateError>;

    async fn download(&self, asset: &Asset) -> Result<Download, UpdateError>;
}

/// Release queries against the GitHub releases API.
pub struct ReleaseRepository {
    client: reqwest::Client,
    api_base: String,
}

impl ReleaseRepository {
    pub fn new(api_base: impl Into<String>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_latest_release(&self) -> Result<Option<Release>, UpdateError> {
        self.get_release_by_url(&format!("{}/releases/latest", self.api_base)).await
    }

    pub async fn get_latest_nightly_release(&self) -> Result<Option<Release>, UpdateError> {
        self.get_release_by_tag(NIGHTLY_TAG).await
    }

    pub async fn get_release_by_tag(&self, tag: &str) -> Result<Option<Release>, UpdateError> {
        self.get_release_by_url(&format!("{}/releases/tags/{}", self.api_base, tag)).await
    }

    async fn get_release_by_url(&self, url: &str) -> Result<Option<Release>, UpdateError> {
        debug!("Fetching release from {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header(GITHUB_API_HEADER, GITHUB_API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            let body = response.bytes().await?;
            return Ok(Some(serde_json::from_slice(&body)?));
        }

        check_status(status, response.headers(), Utc::now()).map(|()| None)
    }
}

/// Maps a non-200 response: 404 is "no release", a 403 with an exhausted
/// rate limit is reported with the wait time, anything else is an error.
fn check_status(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> Result<(), UpdateError> {
    match status {
        StatusCode::NOT_FOUND => Ok(()),
        StatusCode::FORBIDDEN => {
            let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
            let remaining = header(GITHUB_RATELIMIT_REMAINING).and_then(|v| v.parse::<u64>().ok());
            let reset = header(GITHUB_RATELIMIT_RESET).and_then(|v| v.parse::<i64>().ok());

            match (remaining, reset) {
                (Some(0), Some(reset)) => Err(UpdateError::RateLimited {
                    minutes: (reset - now.timestamp()).max(0) / 60,
                }),
                _ => Err(UpdateError::UnexpectedStatus(status.as_u16())),
            }
        }
        _ => Err(UpdateError::UnexpectedStatus(status.as_u16())),
    }
}

#[async_trait]
impl ReleaseSource for ReleaseRepository {
    async fn latest_release(&self, channel: ReleaseChannel) -> Result<Option<Release>, UpdateError> {
        match channel {
            ReleaseChannel::Stable => self.get_latest_release().await,
            ReleaseChannel::Nightly => self.get_latest_nightly_release().await,
        }
    }

    async fn download(&self, asset: &Asset) -> Result<Download, UpdateError> {
        let response = self
            .client
            .get(&asset.browser_download_url)
            .send()
            .await?
            .error_for_status()?;

        let content_length = response.content_length().or(Some(asset.size));
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(UpdateError::from))
            .boxed();

        Ok(Download { content_length, chunks })
    }
}
