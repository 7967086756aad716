use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fs;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// An item backed by a single file in a listed directory.
pub trait ListedFile: Clone + Send + Sync + 'static {
    fn filename(&self) -> &str;
    fn last_modified(&self) -> DateTime<Utc>;
}

/// Per-kind behavior plugged into a [`DirectoryList`].
pub trait DirectorySource: Send + Sync + 'static {
    type Item: ListedFile;
    type Key: Eq + Hash + Clone;

    /// Scans `base` and maps each relevant file to an item. Runs on the
    /// blocking pool.
    fn list_items(&self, base: &Path) -> io::Result<Vec<Self::Item>>;

    fn item_key(&self, item: &Self::Item) -> Self::Key;
}

/// Snapshot observed by list consumers.
#[derive(Debug, Clone)]
pub struct ListState<T> {
    pub items: Vec<T>,
    pub is_loading: bool,
}

impl<T> Default for ListState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            is_loading: false,
        }
    }
}

/// A directory of dump files presented as a list, newest first.
///
/// At most one scan runs at a time; starting another one, removing a file
/// or clearing the directory cancels the scan in flight and guarantees its
/// result is never published.
pub struct DirectoryList<S: DirectorySource> {
    base_directory: PathBuf,
    source: Arc<S>,
    state: Arc<watch::Sender<ListState<S::Item>>>,
    generation: Arc<AtomicU64>,
    scan: Option<JoinHandle<()>>,
}

impl<S: DirectorySource> DirectoryList<S> {
    pub fn new(base_directory: impl Into<PathBuf>, source: S) -> Self {
        let (state, _) = watch::channel(ListState::default());
        Self {
            base_directory: base_directory.into(),
            source: Arc::new(source),
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            scan: None,
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<S::Item>> {
        self.state.subscribe()
    }

    pub fn items(&self) -> Vec<S::Item> {
        self.state.borrow().items.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn item_key(&self, item: &S::Item) -> S::Key {
        self.source.item_key(item)
    }

    /// The listed item with the given key, if the last scan found it.
    pub fn find(&self, key: &S::Key) -> Option<S::Item> {
        self.state
            .borrow()
            .items
            .iter()
            .find(|item| self.item_key(item) == *key)
            .cloned()
    }

    /// Waits until no scan is in flight and returns the published items.
    pub async fn loaded_items(&self) -> Vec<S::Item> {
        if !self.is_loading() {
            return self.items();
        }
        let mut rx = self.subscribe();
        let items = match rx.wait_for(|s| !s.is_loading).await {
            Ok(state) => state.items.clone(),
            Err(_) => Vec::new(),
        };
        items
    }

    /// Stops the scan in flight, if any. Returns the generation that any
    /// newer work must carry to be allowed to publish.
    fn cancel_scan(&mut self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
        generation
    }

    /// Starts a fresh scan in the background, replacing any scan in flight.
    pub fn load(&mut self) {
        let generation = self.cancel_scan();
        self.state.send_modify(|s| s.is_loading = true);

        let base = self.base_directory.clone();
        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);

        self.scan = Some(tokio::spawn(async move {
            let scanned = tokio::task::spawn_blocking(move || scan_sorted(&*source, &base)).await;
            let items = match scanned {
                Ok(Ok(items)) => items,
                Ok(Err(e)) => {
                    warn!("Directory scan failed: {}", e);
                    Vec::new()
                }
                Err(e) => {
                    warn!("Directory scan task failed: {}", e);
                    Vec::new()
                }
            };

            // Checked under the channel lock so a cancellation that already
            // published cannot be overwritten by this stale result.
            state.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) != generation {
                    return false;
                }
                debug!("Directory scan found {} items", items.len());
                s.items = items;
                s.is_loading = false;
                true
            });
        }));
    }

    /// Waits for the scan in flight, if any, to finish or be cancelled.
    #[cfg(test)]
    pub async fn wait_for_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            let _ = scan.await;
        }
    }

    /// Deletes `filename` from the base directory and rescans.
    pub async fn remove_file(&mut self, filename: &str) -> Result<()> {
        self.cancel_scan();
        let path = self.resolve(filename)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} already gone", path.display())
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }

        self.load();
        Ok(())
    }

    /// Empties the list at once, then deletes every file in the base
    /// directory. Returns how many files were removed.
    pub async fn clear_all_files(&mut self) -> Result<usize> {
        self.cancel_scan();
        self.state.send_modify(|s| {
            s.items.clear();
            s.is_loading = false;
        });

        let base = self.base_directory.clone();
        let removed = tokio::task::spawn_blocking(move || remove_all_files(&base))
            .await
            .context("File removal task failed")?;

        info!("Cleared {} files from {}", removed, self.base_directory.display());
        Ok(removed)
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let is_plain = !filename.is_empty()
            && filename != "."
            && filename != ".."
            && !filename.contains(['/', '\\']);
        if !is_plain {
            anyhow::bail!("Invalid file name: {:?}", filename);
        }
        Ok(self.base_directory.join(filename))
    }
}

impl<S: DirectorySource> Drop for DirectoryList<S> {
    fn drop(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
    }
}

fn scan_sorted<S: DirectorySource>(source: &S, base: &Path) -> io::Result<Vec<S::Item>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut items = source.list_items(base)?;
    items.sort_by(|a, b| {
        b.last_modified()
            .cmp(&a.last_modified())
            .then_with(|| a.filename().cmp(b.filename()))
    });
    Ok(items)
}

/// Regular files directly under `base` with their metadata. Entries that
/// vanish or cannot be inspected while scanning are skipped.
pub fn regular_files(base: &Path) -> io::Result<Vec<(String, fs::Metadata)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(base)? {
        let Ok(entry) = entry else { continue };
        let Ok(metadata) = fs::metadata(entry.path()) else {
            debug!("Skipping unreadable entry {}", entry.path().display());
            continue;
        };
        if metadata.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), metadata));
        }
    }
    Ok(files)
}

/// Best-effort removal of every regular file directly under `base`.
fn remove_all_files(base: &Path) -> usize {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Nothing to clear in {}: {}", base.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    removed
}

/// Modification time from `metadata`, or the epoch when the platform
/// cannot report it.
pub fn modified_time(metadata: &fs::Metadata) -> DateTime<Utc> {
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    DateTime::<Utc>::from(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    struct Dump {
        name: String,
        modified: DateTime<Utc>,
    }

    impl ListedFile for Dump {
        fn filename(&self) -> &str {
            &self.name
        }

        fn last_modified(&self) -> DateTime<Utc> {
            self.modified
        }
    }

    struct AllFiles;

    impl DirectorySource for AllFiles {
        type Item = Dump;
        type Key = String;

        fn list_items(&self, base: &Path) -> io::Result<Vec<Dump>> {
            Ok(regular_files(base)?
                .into_iter()
                .map(|(name, metadata)| Dump {
                    name,
                    modified: modified_time(&metadata),
                })
                .collect())
        }

        fn item_key(&self, item: &Dump) -> String {
            item.name.clone()
        }
    }

    fn write_aged(dir: &Path, name: &str, age_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    async fn loaded(list: &mut DirectoryList<AllFiles>) -> Vec<String> {
        list.wait_for_scan().await;
        assert!(!list.is_loading());
        list.items().into_iter().map(|d| d.name).collect()
    }

    #[tokio::test]
    async fn load_sorts_newest_first() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "old.txt", 300);
        write_aged(dir.path(), "new.txt", 10);
        write_aged(dir.path(), "mid.txt", 100);

        let mut list = DirectoryList::new(dir.path(), AllFiles);
        list.load();
        assert!(list.is_loading());

        assert_eq!(loaded(&mut list).await, ["new.txt", "mid.txt", "old.txt"]);
    }

    #[tokio::test]
    async fn missing_directory_loads_empty() {
        let dir = TempDir::new().unwrap();
        let mut list = DirectoryList::new(dir.path().join("absent"), AllFiles);
        list.load();
        assert!(loaded(&mut list).await.is_empty());
    }

    #[tokio::test]
    async fn remove_file_deletes_and_reloads() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "a.txt", 20);
        write_aged(dir.path(), "b.txt", 10);

        let mut list = DirectoryList::new(dir.path(), AllFiles);
        list.load();
        loaded(&mut list).await;

        list.remove_file("a.txt").await.unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(loaded(&mut list).await, ["b.txt"]);
    }

    #[tokio::test]
    async fn remove_file_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("inner");
        fs::create_dir(&inner).unwrap();
        write_aged(dir.path(), "outside.txt", 10);

        let mut list = DirectoryList::new(&inner, AllFiles);
        assert!(list.remove_file("../outside.txt").await.is_err());
        assert!(list.remove_file("..").await.is_err());
        assert!(dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn clear_all_files_empties_list_immediately() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "a.txt", 20);
        write_aged(dir.path(), "b.txt", 10);

        let mut list = DirectoryList::new(dir.path(), AllFiles);
        list.load();
        loaded(&mut list).await;
        assert_eq!(list.items().len(), 2);

        let rx = list.subscribe();
        // a scan is in flight when the clear starts
        list.load();
        let removed = list.clear_all_files().await.unwrap();

        assert_eq!(removed, 2);
        assert!(rx.borrow().items.is_empty());
        assert!(!rx.borrow().is_loading);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        // the cancelled scan never publishes
        list.wait_for_scan().await;
        assert!(list.items().is_empty());
    }

    #[tokio::test]
    async fn item_key_uses_source() {
        let list = DirectoryList::new("/tmp", AllFiles);
        let dump = Dump {
            name: "x.log".to_string(),
            modified: Utc::now(),
        };
        assert_eq!(list.item_key(&dump), "x.log");
    }

    #[tokio::test]
    async fn find_and_loaded_items() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "a.txt", 20);
        write_aged(dir.path(), "b.txt", 20);

        let mut list = DirectoryList::new(dir.path(), AllFiles);
        list.load();
        let names: Vec<_> = list.loaded_items().await.into_iter().map(|d| d.name).collect();
        // equal times fall back to name order
        assert_eq!(names, ["a.txt", "b.txt"]);

        assert_eq!(list.find(&"b.txt".to_string()).unwrap().name, "b.txt");
        assert!(list.find(&"c.txt".to_string()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vanished_entries_do_not_fail_the_scan() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "kept.txt", 10);
        // a dangling link looks like a file deleted between listing and stat
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("ghost.txt")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut list = DirectoryList::new(dir.path(), AllFiles);
        list.load();
        assert_eq!(loaded(&mut list).await, ["kept.txt"]);
    }

    /// Scans the directory, then holds the result until released.
    struct GatedFiles {
        scanned: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        returned: Mutex<mpsc::Sender<()>>,
    }

    impl DirectorySource for GatedFiles {
        type Item = Dump;
        type Key = String;

        fn list_items(&self, base: &Path) -> io::Result<Vec<Dump>> {
            let items = AllFiles.list_items(base)?;
            let _ = self.scanned.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            let _ = self.returned.lock().unwrap().send(());
            Ok(items)
        }

        fn item_key(&self, item: &Dump) -> String {
            item.name.clone()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_scan_result_is_discarded() {
        let dir = TempDir::new().unwrap();
        write_aged(dir.path(), "a.txt", 10);

        let (scanned_tx, scanned_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let (returned_tx, returned_rx) = mpsc::channel();
        let mut list = DirectoryList::new(
            dir.path(),
            GatedFiles {
                scanned: Mutex::new(scanned_tx),
                release: Mutex::new(release_rx),
                returned: Mutex::new(returned_tx),
            },
        );

        list.load();
        // the scan has already seen a.txt when the clear starts
        tokio::task::spawn_blocking(move || scanned_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(list.clear_all_files().await.unwrap(), 1);

        release_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || returned_rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = list.subscribe().borrow().clone();
        assert!(state.items.is_empty());
        assert!(!state.is_loading);
    }
}
