use crate::directory_list::{modified_time, regular_files, DirectoryList, DirectorySource, ListedFile};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Marker left behind by the mod core when the last session crashed.
pub const CRASH_INDICATOR_NAME: &str = "lastSessionDidCrash";
/// Written by older mod core versions; never a crash dump.
pub const LEGACY_PID_NAME: &str = "last-pid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashDump {
    pub filename: String,
    pub last_modified: DateTime<Utc>,
}

impl ListedFile for CrashDump {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }
}

pub struct CrashDumpSource;

impl DirectorySource for CrashDumpSource {
    type Item = CrashDump;
    type Key = String;

    fn list_items(&self, base: &Path) -> io::Result<Vec<CrashDump>> {
        Ok(regular_files(base)?
            .into_iter()
            .filter(|(name, _)| name != CRASH_INDICATOR_NAME && name != LEGACY_PID_NAME)
            .map(|(filename, metadata)| CrashDump {
                filename,
                last_modified: modified_time(&metadata),
            })
            .collect())
    }

    fn item_key(&self, item: &CrashDump) -> String {
        item.filename.clone()
    }
}

pub type CrashDumpList = DirectoryList<CrashDumpSource>;

pub fn crash_dump_list(crash_directory: impl Into<PathBuf>) -> CrashDumpList {
    DirectoryList::new(crash_directory, CrashDumpSource)
}

fn indicator_path(list: &CrashDumpList) -> PathBuf {
    list.base_directory().join(CRASH_INDICATOR_NAME)
}

pub async fn has_indicator(list: &CrashDumpList) -> bool {
    tokio::fs::try_exists(indicator_path(list))
        .await
        .unwrap_or(false)
}

/// Records that a crash happened and has not been looked at yet.
pub async fn create_indicator(list: &CrashDumpList) -> Result<()> {
    tokio::fs::create_dir_all(list.base_directory())
        .await
        .with_context(|| format!("Failed to create {:?}", list.base_directory()))?;

    let path = indicator_path(list);
    tokio::fs::write(&path, b"")
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;

    info!("Crash indicator set");
    Ok(())
}

pub async fn clear_indicator(list: &CrashDumpList) -> Result<()> {
    let path = indicator_path(list);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!("Crash indicator cleared");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}
