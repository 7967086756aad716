use crate::error::UpdateError;
use crate::release::{Release, ReleaseChannel, ReleaseSource};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zip::result::ZipError;
use zip::ZipArchive;

/// Automatic checks closer together than this reuse the previous result.
const CHECK_CACHE_MINUTES: i64 = 15;

/// Observable progress of an update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    InUpdateCheck,
    Failure(String),
    InDownload { downloaded: u64, out_of: Option<u64> },
    Finished { has_updated: bool },
    Cancelled { is_cancelling: bool },
}

impl Default for UpdateState {
    fn default() -> Self {
        UpdateState::Finished { has_updated: false }
    }
}

impl UpdateState {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            UpdateState::InUpdateCheck
                | UpdateState::InDownload { .. }
                | UpdateState::Cancelled { is_cancelling: true }
        )
    }

    /// Whether `next` may directly follow this state.
    pub fn can_transition_to(&self, next: &UpdateState) -> bool {
        use UpdateState::*;
        match (self, next) {
            (InUpdateCheck, Failure(_) | InDownload { .. } | Finished { .. }) => true,
            (
                InDownload { downloaded, out_of },
                InDownload { downloaded: next_downloaded, out_of: next_out_of },
            ) => next_downloaded >= downloaded && next_out_of == out_of,
            (InDownload { .. }, Failure(_) | Finished { .. }) => true,
            (InUpdateCheck | InDownload { .. }, Cancelled { is_cancelling: true }) => true,
            (Cancelled { is_cancelling: true }, Cancelled { is_cancelling: false }) => true,
            (current, InUpdateCheck) => !current.is_in_progress(),
            _ => false,
        }
    }
}

/// What is known about the installed mod core, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMetadata {
    pub current_version_tag: Option<String>,
    pub current_version_timestamp: Option<i64>,
    pub file_crc32: Option<String>,
    pub last_check_time: Option<DateTime<Utc>>,
}

impl InstallMetadata {
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable install metadata {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub channel: ReleaseChannel,
    pub platform: String,
    /// Name of the mod core library inside release archives.
    pub library_name: String,
    pub install_path: PathBuf,
    pub metadata_path: PathBuf,
    pub developer_mode: bool,
}

/// Checks for, downloads and installs mod core releases.
///
/// Each cycle starts at [`UpdateState::InUpdateCheck`]. States from a cycle
/// that has been cancelled or superseded are never published.
pub struct UpdateManager {
    inner: Arc<Inner>,
    job: Option<JoinHandle<()>>,
}

struct Inner {
    settings: UpdateSettings,
    source: Arc<dyn ReleaseSource>,
    state: watch::Sender<UpdateState>,
    cycle: AtomicU64,
}

impl UpdateManager {
    pub fn new(settings: UpdateSettings, source: Arc<dyn ReleaseSource>) -> Self {
        let (state, _) = watch::channel(UpdateState::default());
        Self {
            inner: Arc::new(Inner {
                settings,
                source,
                state,
                cycle: AtomicU64::new(0),
            }),
            job: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> UpdateState {
        self.inner.state.borrow().clone()
    }

    pub fn is_in_update(&self) -> bool {
        self.inner.state.borrow().is_in_progress()
    }

    /// Starts a new cycle unless one is already running.
    pub fn check_for_updates(&mut self, is_manual: bool) -> watch::Receiver<UpdateState> {
        if self.is_in_update() {
            debug!("Update check already in progress");
            return self.subscribe();
        }

        let cycle = self.inner.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_modify(|s| *s = UpdateState::InUpdateCheck);

        let inner = Arc::clone(&self.inner);
        self.job = Some(tokio::spawn(async move {
            inner.run_cycle(cycle, is_manual).await;
        }));

        self.subscribe()
    }

    /// Cancels the running cycle and waits for it to stop.
    pub async fn cancel(&mut self) {
        self.inner.cycle.fetch_add(1, Ordering::SeqCst);
        self.inner
            .state
            .send_modify(|s| *s = UpdateState::Cancelled { is_cancelling: true });

        if let Some(job) = self.job.take() {
            job.abort();
            let _ = job.await;
        }

        info!("Update cancelled");
        self.inner
            .state
            .send_modify(|s| *s = UpdateState::Cancelled { is_cancelling: false });
    }

    /// Waits for the running cycle, if any, to reach its end.
    pub async fn wait(&mut self) {
        if let Some(job) = self.job.take() {
            let _ = job.await;
        }
    }
}

impl Drop for UpdateManager {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.abort();
        }
    }
}

impl Inner {
    /// Publishes `next` if `cycle` is still current and the move is legal.
    fn publish(&self, cycle: u64, next: UpdateState) -> bool {
        self.state.send_if_modified(|current| {
            if self.cycle.load(Ordering::SeqCst) != cycle {
                return false;
            }
            if !current.can_transition_to(&next) {
                warn!("Ignoring update state {:?} after {:?}", next, current);
                return false;
            }
            *current = next;
            true
        })
    }

    async fn run_cycle(&self, cycle: u64, is_manual: bool) {
        let outcome = self.check_for_new_release(cycle, is_manual).await;
        let next = match outcome {
            Ok(has_updated) => UpdateState::Finished { has_updated },
            Err(e) => {
                error!("Release update has failed: {}", e);
                UpdateState::Failure(e.to_string())
            }
        };
        self.publish(cycle, next);
    }

    async fn check_for_new_release(&self, cycle: u64, is_manual: bool) -> Result<bool, UpdateError> {
        let settings = &self.settings;
        let mut metadata = InstallMetadata::load(&settings.metadata_path).await;

        if !is_manual && self.should_use_cache(&metadata).await {
            info!("Checked for updates recently, skipping");
            return Ok(false);
        }

        let release = self.source.latest_release(settings.channel).await?;

        metadata.last_check_time = Some(Utc::now());
        if let Err(e) = metadata.save(&settings.metadata_path).await {
            warn!("Failed to record update check time: {}", e);
        }

        let Some(release) = release else {
            info!("No release found for channel {:?}", settings.channel);
            return Ok(false);
        };

        let up_to_date = metadata.current_version_timestamp == Some(release.descriptor());
        if up_to_date && !self.file_was_externally_modified(&metadata, false).await {
            info!("Mod core is up to date ({})", release.description());
            return Ok(false);
        }

        let allow_overwriting = !settings.developer_mode || is_manual;
        if !allow_overwriting && self.file_was_externally_modified(&metadata, true).await {
            return Err(UpdateError::ExternalFileInUse);
        }

        self.perform_update(cycle, &release, metadata).await?;
        Ok(true)
    }

    async fn should_use_cache(&self, metadata: &InstallMetadata) -> bool {
        let Some(last_check) = metadata.last_check_time else {
            return false;
        };
        let recent = last_check > Utc::now() - Duration::minutes(CHECK_CACHE_MINUTES);
        recent && !self.file_was_externally_modified(metadata, false).await
    }

    /// Compares the installed file against the fingerprint recorded at
    /// install time. A missing file counts as modified unless
    /// `modified_only` is set.
    async fn file_was_externally_modified(&self, metadata: &InstallMetadata, modified_only: bool) -> bool {
        let data = match tokio::fs::read(&self.settings.install_path).await {
            Ok(data) => data,
            Err(_) => return !modified_only,
        };

        match &metadata.file_crc32 {
            Some(expected) => *expected != format!("{:08x}", crc32fast::hash(&data)),
            None => false,
        }
    }

    async fn perform_update(
        &self,
        cycle: u64,
        release: &Release,
        mut metadata: InstallMetadata,
    ) -> Result<(), UpdateError> {
        let settings = &self.settings;
        let asset = release
            .download_for(&settings.platform)
            .ok_or_else(|| UpdateError::MissingAsset(settings.platform.clone()))?;

        info!("Downloading {} ({})", asset.name, release.description());
        let download = self.source.download(asset).await?;
        let out_of = download.content_length;

        let archive = PartialDownload::new(&settings.install_path, "download");
        if let Some(parent) = archive.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&archive.path).await?;
        self.publish(cycle, UpdateState::InDownload { downloaded: 0, out_of });

        let mut downloaded = 0u64;
        let mut chunks = download.chunks;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            self.publish(cycle, UpdateState::InDownload { downloaded, out_of });
        }
        file.flush().await?;
        drop(file);

        let extracted = PartialDownload::new(&settings.install_path, "extract");
        let archive_path = archive.path.clone();
        let output_path = extracted.path.clone();
        let entry_name = settings.library_name.clone();
        let checksum = tokio::task::spawn_blocking(move || extract_entry(&archive_path, &entry_name, &output_path))
            .await
            .map_err(io::Error::other)??;

        tokio::fs::rename(&extracted.path, &settings.install_path).await?;

        metadata.current_version_tag = Some(release.description());
        metadata.current_version_timestamp = Some(release.descriptor());
        metadata.file_crc32 = Some(format!("{:08x}", checksum));
        metadata.save(&settings.metadata_path).await?;

        info!("Installed {} to {}", release.description(), settings.install_path.display());
        Ok(())
    }
}

/// Copies `entry_name` out of the zip archive at `archive_path` into
/// `output` and returns the CRC32 of the extracted bytes.
fn extract_entry(archive_path: &Path, entry_name: &str, output: &Path) -> Result<u32, UpdateError> {
    let mut archive = ZipArchive::new(std::fs::File::open(archive_path)?)?;
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(UpdateError::MissingArchiveEntry(entry_name.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    debug!("Extracting {} ({} bytes)", entry_name, entry.size());

    let mut out = std::fs::File::create(output)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = entry.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        out.write_all(&buffer[..read])?;
    }
    out.flush()?;
    Ok(hasher.finalize())
}

/// Scratch file next to the install path (`<install>.<suffix>`), removed
/// unless it was moved into place.
struct PartialDownload {
    path: PathBuf,
}

impl PartialDownload {
    fn new(install_path: &Path, suffix: &str) -> Self {
        let mut name = install_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(suffix);
        Self {
            path: install_path.with_file_name(name),
        }
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Runs one cycle to completion, logging each state as it is observed.
pub async fn run_to_completion(manager: &mut UpdateManager, is_manual: bool) -> anyhow::Result<UpdateState> {
    let mut rx = manager.check_for_updates(is_manual);
    loop {
        let state = rx.borrow_and_update().clone();
        match &state {
            UpdateState::InDownload { downloaded, out_of: Some(total) } => {
                info!("Downloading... {}/{} bytes", downloaded, total)
            }
            UpdateState::InDownload { downloaded, out_of: None } => {
                info!("Downloading... {} bytes", downloaded)
            }
            other => debug!("Update state: {:?}", other),
        }
        if !state.is_in_progress() {
            manager.wait().await;
            return Ok(state);
        }
        rx.changed().await.context("Update manager went away")?;
    }
}

/// Runs one cycle until it ends or `cancel` resolves with `Ok`. A `cancel`
/// future that fails (for example a signal handler that could not be
/// installed) never cancels the cycle.
pub async fn run_until_cancelled<F>(manager: &mut UpdateManager, is_manual: bool, cancel: F) -> anyhow::Result<UpdateState>
where
    F: Future<Output = io::Result<()>>,
{
    let outcome = tokio::select! {
        state = run_to_completion(manager, is_manual) => Some(state?),
        Ok(()) = cancel => None,
    };

    match outcome {
        Some(state) => Ok(state),
        None => {
            manager.cancel().await;
            Ok(manager.state())
        }
    }
}
