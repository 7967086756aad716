mod config;
mod crash_dumps;
mod directory_list;
mod error;
mod log_decoder;
mod log_entry;
mod log_reader;
mod mod_core;
mod mod_logs;
mod release;
mod update_manager;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Command, Config, CrashAction, IndicatorAction, ModLogAction};
use log::{error, info, warn, LevelFilter};
use log_entry::{LogEntry, LogPriority};
use mod_core::{GamePackage, HostContext, ModCoreLoader, PlatformContext};
use release::ReleaseRepository;
use simple_logger::SimpleLogger;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use update_manager::{UpdateManager, UpdateSettings, UpdateState};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = config::Cli::parse();

    SimpleLogger::new().with_level(LevelFilter::Trace).init()?;
    log::set_max_level(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info });

    // Load configuration
    let config = config::load_config(&cli)?;
    let level: LevelFilter = config
        .log_level
        .parse()
        .with_context(|| format!("Invalid log level: {}", config.log_level))?;
    log::set_max_level(level);
    info!("Using data directory {:?}", config.data_dir);

    match cli.command {
        Command::Logs {
            crash_buffer,
            input,
            min_priority,
            json,
            clear,
        } => {
            if clear {
                clear_logs(&config, crash_buffer).await
            } else if let Some(input) = input {
                show_log_file(&input, min_priority, json)
            } else {
                show_logs(&config, crash_buffer, min_priority, json).await
            }
        }
        Command::Crashes { action } => manage_crashes(&config, action).await,
        Command::ModLogs { action } => manage_mod_logs(&config, action).await,
        Command::Update { manual } => update(&config, manual).await.map(|_| ()),
        Command::Launch => launch(&config).await,
    }
}

fn print_entries(entries: impl IntoIterator<Item = LogEntry>, json: bool) -> Result<()> {
    for entry in entries {
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!("{}", entry.as_simple_string());
        }
    }
    Ok(())
}

fn log_view(config: &Config, crash_buffer: bool, min_priority: LogPriority) -> log_reader::LogView {
    let mut source = log_reader::LogcatSource::new(&config.logcat);
    source.crash_buffer = crash_buffer;
    log_reader::LogView::new(source, min_priority)
}

async fn show_logs(config: &Config, crash_buffer: bool, min_priority: LogPriority, json: bool) -> Result<()> {
    let mut view = log_view(config, false, min_priority);

    let mut loading = view.subscribe_loading();
    let progress = tokio::spawn(async move {
        while loading.changed().await.is_ok() {
            if *loading.borrow_and_update() {
                info!("Reading system log...");
            }
        }
    });

    if crash_buffer {
        view.toggle_crash_buffer().await;
    } else {
        view.load().await;
    }
    progress.abort();

    let buffer = if view.crash_buffer() { "crash" } else { "main" };
    info!("Read {} entries from the {} buffer", view.entries().len(), buffer);
    if view.failed_to_load() {
        warn!("Binary log could not be fully decoded");
    }

    if json {
        print_entries(view.entries().iter().cloned(), true)
    } else {
        println!("{}", view.log_data().await);
        Ok(())
    }
}

fn show_log_file(path: &Path, min_priority: LogPriority, json: bool) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open log file: {:?}", path))?;
    let mut entries = log_reader::LogEntries::new(BufReader::new(file), min_priority);
    print_entries(entries.by_ref(), json)?;

    if entries.hit_error() {
        warn!("{:?} ends with an undecodable record", path);
    }
    Ok(())
}

async fn clear_logs(config: &Config, crash_buffer: bool) -> Result<()> {
    let mut view = log_view(config, crash_buffer, log_reader::DEFAULT_MIN_PRIORITY);
    view.clear_logs().await?;
    info!("Log buffer cleared");
    Ok(())
}

async fn manage_crashes(config: &Config, action: CrashAction) -> Result<()> {
    let mut list = crash_dumps::crash_dump_list(config.crash_dir());

    match action {
        CrashAction::List => {
            list.load();
            for dump in list.loaded_items().await {
                println!("{}\t{}", dump.last_modified.to_rfc3339(), dump.filename);
            }
        }
        CrashAction::Remove { name } => {
            list.load();
            list.loaded_items().await;
            if list.find(&name).is_none() {
                anyhow::bail!("No crash dump named {:?}", name);
            }
            list.remove_file(&name).await?
        }
        CrashAction::Clear => {
            let removed = list.clear_all_files().await?;
            println!("Removed {} crash dumps", removed);
        }
        CrashAction::Indicator { action } => match action {
            IndicatorAction::Status => {
                let crashed = crash_dumps::has_indicator(&list).await;
                println!("{}", if crashed { "crashed" } else { "clean" });
            }
            IndicatorAction::Set => crash_dumps::create_indicator(&list).await?,
            IndicatorAction::Clear => crash_dumps::clear_indicator(&list).await?,
        },
    }
    Ok(())
}

async fn manage_mod_logs(config: &Config, action: ModLogAction) -> Result<()> {
    let mut list = mod_logs::mod_log_list(config.mod_logs_dir());

    match action {
        ModLogAction::List => {
            list.load();
            for log in list.loaded_items().await {
                println!("{}\t{:>10}\t{}", log.last_modified.to_rfc3339(), log.file_size, log.filename);
            }
        }
        ModLogAction::Show { name } => {
            for line in mod_logs::get_file_text(&list, &name).await {
                println!("{}", line);
            }
        }
        ModLogAction::Remove { name } => {
            list.load();
            list.loaded_items().await;
            if list.find(&name).is_none() {
                anyhow::bail!("No mod log named {:?}", name);
            }
            list.remove_file(&name).await?
        }
        ModLogAction::Clear => {
            let removed = list.clear_all_files().await?;
            println!("Removed {} log files", removed);
        }
    }
    Ok(())
}

/// Runs one update cycle. Ctrl-C cancels it.
async fn update(config: &Config, manual: bool) -> Result<UpdateState> {
    let host = HostContext::new(config.metered_network);
    if !manual && host.is_network_metered() {
        info!("Network is metered, skipping automatic update check");
        return Ok(UpdateState::Finished { has_updated: false });
    }

    let settings = UpdateSettings {
        channel: config.channel,
        platform: config.platform.clone(),
        library_name: config.mod_core_filename(),
        install_path: config.mod_core_path(),
        metadata_path: config.metadata_path(),
        developer_mode: config.developer_mode,
    };
    let repository = ReleaseRepository::new(config.release_api.clone())?;
    let mut manager = UpdateManager::new(settings, Arc::new(repository));

    let state = update_manager::run_until_cancelled(&mut manager, manual, tokio::signal::ctrl_c()).await?;

    match &state {
        UpdateState::Finished { has_updated: true } => println!("Geode has been updated"),
        UpdateState::Finished { has_updated: false } => println!("Geode is up to date"),
        UpdateState::Failure(reason) => println!("Update failed: {}", reason),
        UpdateState::Cancelled { .. } => println!("Update cancelled"),
        other => warn!("Update ended in unexpected state {:?}", other),
    }
    Ok(state)
}

async fn launch(config: &Config) -> Result<()> {
    let crash_list = crash_dumps::crash_dump_list(config.crash_dir());
    if crash_dumps::has_indicator(&crash_list).await {
        warn!("The last session crashed, see `crashes list`");
        crash_dumps::clear_indicator(&crash_list).await?;
    }

    if let Err(e) = update(config, false).await {
        error!("Update check failed: {:#}", e);
    }

    let host = HostContext::new(config.metered_network).with_machine_id_path(&config.machine_id_path);
    let game = GamePackage::new(&config.game_library_dir, config.game_library_name.clone());
    let mut loader = ModCoreLoader::new(&host);

    let report = mod_core::prepare_launch(&mut loader, &game, &config.mod_core_path());
    if let Some(notice) = report.notice() {
        println!("{}", notice);
    }

    if !report.game_loaded {
        anyhow::bail!("Launch failed");
    }
    info!("Launched with {} libraries loaded", loader.loaded_count());
    Ok(())
}
