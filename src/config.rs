use crate::log_entry::LogPriority;
use crate::log_reader::DEFAULT_MIN_PRIORITY;
use crate::release::ReleaseChannel;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "geode-launcher", version, about)]
pub struct Cli {
    /// Path to configuration file
    #[clap(long, default_value = "./launcher.toml")]
    pub config: PathBuf,

    /// Override launcher data directory
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Override release channel
    #[clap(long, value_enum, global = true)]
    pub channel: Option<ReleaseChannel>,

    /// Log debug output
    #[clap(long, short)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the system log
    Logs {
        /// Read the crash buffer instead of the main buffer
        #[clap(long)]
        crash_buffer: bool,
        /// Decode a saved binary log instead of running logcat
        #[clap(long)]
        input: Option<PathBuf>,
        /// Lowest priority to show
        #[clap(long, default_value_t = DEFAULT_MIN_PRIORITY)]
        min_priority: LogPriority,
        /// Print entries as JSON lines
        #[clap(long)]
        json: bool,
        /// Clear the buffer instead of showing it
        #[clap(long)]
        clear: bool,
    },
    /// Manage crash dumps
    Crashes {
        #[clap(subcommand)]
        action: CrashAction,
    },
    /// Manage mod core session logs
    ModLogs {
        #[clap(subcommand)]
        action: ModLogAction,
    },
    /// Check for and install mod core updates
    Update {
        /// Ignore the recent-check cache
        #[clap(long)]
        manual: bool,
    },
    /// Load the game and the mod core
    Launch,
}

#[derive(Subcommand, Debug)]
pub enum CrashAction {
    List,
    Remove { name: String },
    Clear,
    Indicator {
        #[clap(subcommand)]
        action: IndicatorAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum IndicatorAction {
    Status,
    Set,
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum ModLogAction {
    List,
    Show { name: String },
    Remove { name: String },
    Clear,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub logcat: String,
    pub release_api: String,
    pub channel: ReleaseChannel,
    pub platform: String,
    pub developer_mode: bool,
    pub metered_network: bool,
    pub machine_id_path: PathBuf,
    pub game_library_dir: PathBuf,
    pub game_library_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./geode-data"),
            log_level: "info".to_string(),
            logcat: "logcat".to_string(),
            release_api: "https://api.github.com/repos/geode-sdk/geode".to_string(),
            channel: ReleaseChannel::Stable,
            platform: default_platform().to_string(),
            developer_mode: false,
            metered_network: false,
            machine_id_path: PathBuf::from("/etc/machine-id"),
            game_library_dir: PathBuf::from("./game/lib"),
            game_library_name: "cocos2dcpp".to_string(),
        }
    }
}

fn default_platform() -> &'static str {
    if cfg!(target_pointer_width = "32") {
        "android32"
    } else {
        "android64"
    }
}

impl Config {
    pub fn crash_dir(&self) -> PathBuf {
        self.data_dir.join("game/geode/crashlogs")
    }

    pub fn mod_logs_dir(&self) -> PathBuf {
        self.data_dir.join("game/geode/logs")
    }

    pub fn mod_core_filename(&self) -> String {
        format!("Geode.{}.so", self.platform)
    }

    pub fn mod_core_path(&self) -> PathBuf {
        self.data_dir.join(self.mod_core_filename())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("update-state.json")
    }
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config: Config = if cli.config.exists() {
        let config_content = fs::read_to_string(&cli.config)
            .with_context(|| format!("Failed to read config file: {:?}", cli.config))?;
        toml::from_str(&config_content).context("Failed to parse config file")?
    } else {
        info!("No config file at {:?}, using defaults", cli.config);
        Config::default()
    };

    // Apply CLI overrides
    if let Some(ref data_dir) = cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    if let Some(channel) = cli.channel {
        config.channel = channel;
    }

    if cli.verbose {
        config.log_level = "debug".to_string();
    }

    Ok(config)
}
