use crate::directory_list::{modified_time, regular_files, DirectoryList, DirectorySource, ListedFile};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

pub const MISSING_FILE_LINE: &str = "File does not exist!";

/// A log file written by the mod core for one game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModLog {
    pub filename: String,
    pub last_modified: DateTime<Utc>,
    pub file_size: u64,
}

impl ListedFile for ModLog {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }
}

pub struct ModLogSource;

impl DirectorySource for ModLogSource {
    type Item = ModLog;
    type Key = String;

    fn list_items(&self, base: &Path) -> io::Result<Vec<ModLog>> {
        Ok(regular_files(base)?
            .into_iter()
            .map(|(filename, metadata)| ModLog {
                filename,
                last_modified: modified_time(&metadata),
                file_size: metadata.len(),
            })
            .collect())
    }

    fn item_key(&self, item: &ModLog) -> String {
        item.filename.clone()
    }
}

pub type ModLogList = DirectoryList<ModLogSource>;

pub fn mod_log_list(logs_directory: impl Into<PathBuf>) -> ModLogList {
    DirectoryList::new(logs_directory, ModLogSource)
}

/// Lines of one log file. A missing file gives a single placeholder line,
/// an unreadable one gives nothing.
pub async fn get_file_text(list: &ModLogList, filename: &str) -> Vec<String> {
    if filename.contains(['/', '\\']) || filename == ".." {
        return vec![MISSING_FILE_LINE.to_string()];
    }

    let path = list.base_directory().join(filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return vec![MISSING_FILE_LINE.to_string()];
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
