use libloading::Library;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Queries that native code may make about the host it runs in.
pub trait PlatformContext: Send + Sync {
    fn is_network_metered(&self) -> bool;

    fn device_identifier(&self) -> String;
}

/// Host implementation backed by the machine id and launcher config.
pub struct HostContext {
    metered: bool,
    machine_id_path: PathBuf,
}

impl HostContext {
    pub fn new(metered: bool) -> Self {
        Self {
            metered,
            machine_id_path: PathBuf::from("/etc/machine-id"),
        }
    }

    pub fn with_machine_id_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.machine_id_path = path.into();
        self
    }
}

impl PlatformContext for HostContext {
    fn is_network_metered(&self) -> bool {
        self.metered
    }

    fn device_identifier(&self) -> String {
        fs::read_to_string(&self.machine_id_path)
            .map(|id| id.trim().to_string())
            .unwrap_or_default()
    }
}

/// The installed game, located by its native library directory.
#[derive(Debug, Clone)]
pub struct GamePackage {
    library_dir: PathBuf,
    library_name: String,
}

impl GamePackage {
    pub fn new(library_dir: impl Into<PathBuf>, library_name: impl Into<String>) -> Self {
        Self {
            library_dir: library_dir.into(),
            library_name: library_name.into(),
        }
    }

    pub fn native_library_dir(&self) -> &Path {
        &self.library_dir
    }

    /// Path of `lib<name>.so` inside the game's library directory.
    pub fn library_path(&self, name: &str) -> PathBuf {
        self.library_dir.join(format!("lib{}.so", name))
    }

    pub fn main_library(&self) -> PathBuf {
        self.library_path(&self.library_name)
    }

    pub fn is_installed(&self) -> bool {
        self.main_library().is_file()
    }
}

/// Keeps loaded libraries resident for the life of the launcher.
pub struct ModCoreLoader<'a> {
    context: &'a dyn PlatformContext,
    loaded: Vec<Library>,
}

impl<'a> ModCoreLoader<'a> {
    pub fn new(context: &'a dyn PlatformContext) -> Self {
        Self {
            context,
            loaded: Vec::new(),
        }
    }

    pub fn context(&self) -> &dyn PlatformContext {
        self.context
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Loads the shared library at `path`. Failure is logged and reported
    /// as `false` so the caller can show a notice instead of aborting.
    pub fn load(&mut self, path: &Path) -> bool {
        if !path.is_file() {
            warn!("Library {} does not exist", path.display());
            return false;
        }

        // SAFETY: the game and mod core libraries are trusted by the user
        // who installed them; their initializers run as part of launching.
        match unsafe { Library::new(path) } {
            Ok(library) => {
                info!("Loaded {}", path.display());
                self.loaded.push(library);
                true
            }
            Err(e) => {
                error!("Failed to load {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Outcome of preparing a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub game_loaded: bool,
    pub mod_core_loaded: bool,
}

impl LaunchReport {
    /// User-facing notice, if anything went wrong.
    pub fn notice(&self) -> Option<&'static str> {
        match (self.game_loaded, self.mod_core_loaded) {
            (false, _) => Some("The game could not be loaded."),
            (true, false) => Some("Geode could not be loaded. The game will start without mods."),
            (true, true) => None,
        }
    }
}

/// Loads the game library, then the mod core on top of it.
pub fn prepare_launch(loader: &mut ModCoreLoader<'_>, game: &GamePackage, mod_core: &Path) -> LaunchReport {
    info!(
        "Preparing launch (device {}, metered network: {})",
        loader.context().device_identifier(),
        loader.context().is_network_metered()
    );

    if !game.is_installed() {
        error!("Game is not installed in {}", game.native_library_dir().display());
        return LaunchReport {
            game_loaded: false,
            mod_core_loaded: false,
        };
    }

    let game_loaded = loader.load(&game.main_library());
    let mod_core_loaded = game_loaded && loader.load(mod_core);

    LaunchReport {
        game_loaded,
        mod_core_loaded,
    }
}
