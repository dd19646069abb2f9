mod logging;
mod render;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tsa_adapters::ReleaseFeed;
use tsa_core::{is_newer_version, ApplicationDraft, OrgCity, SponsorFilter};
use tsa_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tsa_sync::settings::normalize_log_level;
use tsa_sync::{open_database, run_sync_once, Settings, SettingsStore, SyncOptions, TsaConfig};
use tsa_tracker::{ApplicationRepo, SponsorBrowser, TrackerError};

const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "tsa")]
#[command(about = "Track Sponsored Applications: browse the UK sponsor register and log applications")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to $TSA_HOME, then ~/TSA).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the sponsor register if the cached copy is outdated.
    Sync {
        #[arg(long)]
        force: bool,
    },
    /// Print one page of sponsors.
    Sponsors {
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        org: Option<String>,
        /// 1-based page number.
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    #[command(subcommand)]
    Apps(AppsCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Ask the release feed whether a newer version exists.
    CheckRelease,
    /// Print the log file.
    Logs {
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Debug, Args)]
struct SponsorKey {
    #[arg(long)]
    org: String,
    #[arg(long)]
    city: String,
}

#[derive(Debug, Args)]
struct DraftArgs {
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    contact: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

impl DraftArgs {
    /// Overlays the supplied fields on `base`.
    fn apply(self, mut base: ApplicationDraft) -> ApplicationDraft {
        if let Some(role) = self.role {
            base.role = role;
        }
        if let Some(date) = self.date {
            base.date = date;
        }
        if let Some(contact) = self.contact {
            base.contact = contact;
        }
        if let Some(note) = self.note {
            base.note = note;
        }
        base
    }
}

#[derive(Debug, Subcommand)]
enum AppsCommand {
    /// Applications recorded for one sponsor, newest first.
    List(SponsorKey),
    Add {
        #[command(flatten)]
        key: SponsorKey,
        #[command(flatten)]
        fields: DraftArgs,
    },
    /// Change the given fields of an existing application.
    Edit {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        fields: DraftArgs,
    },
    Delete {
        #[arg(long)]
        id: i64,
    },
    /// Every (organisation, city) with at least one application.
    Pairs,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    SetLogLevel { level: String },
    SetRotation { limit: u32 },
    SetReleaseCheck {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TsaConfig::from_env(cli.home);
    config.ensure_dirs()?;
    let store = SettingsStore::new(config.settings_path.clone());
    let loaded = store.read()?;
    let settings = loaded.settings.clone();

    logging::rotate_if_needed(&config.log_file, settings.log_rotation_limit, logging::MAX_LOG_BYTES)?;
    logging::init(&config.log_file, settings.filter_directive())?;
    info!(version = CURRENT_VERSION, home = %config.home_dir.display(), "[APP] started");
    loaded.report();

    match cli.command {
        None => {
            sync(&config, false).await?;
            sponsors(&config, SponsorFilter::default(), 1).await?;
            if settings.check_for_release {
                // startup check never blocks the listing on failure
                if let Err(err) = check_release(&config, true).await {
                    warn!(error = %err, "release check failed");
                }
            }
        }
        Some(Commands::Sync { force }) => sync(&config, force).await?,
        Some(Commands::Sponsors { city, org, page }) => {
            sponsors(&config, SponsorFilter::new(city, org), page).await?
        }
        Some(Commands::Apps(command)) => apps(&config, command).await?,
        Some(Commands::Settings(command)) => settings_command(&store, command)?,
        Some(Commands::CheckRelease) => check_release(&config, false).await?,
        Some(Commands::Logs { tail }) => {
            let text = std::fs::read_to_string(&config.log_file)
                .with_context(|| format!("reading {}", config.log_file.display()))?;
            print!("{}", render::tail(&text, tail));
        }
    }

    Ok(())
}

async fn sync(config: &TsaConfig, force: bool) -> Result<()> {
    let summary = run_sync_once(config, SyncOptions { force }).await?;
    println!("{}", render::sync_summary(&summary));
    Ok(())
}

async fn sponsors(config: &TsaConfig, filter: SponsorFilter, page: u32) -> Result<()> {
    if page == 0 {
        bail!("--page starts at 1");
    }
    let pool = open_database(&config.db_path).await?;
    let repo = ApplicationRepo::open(pool.clone()).await?;
    let browser = SponsorBrowser::new(pool.clone(), config.page_size);

    let applied = repo.org_city_pairs().await?;
    let result = browser.page(&filter, page - 1, &applied).await;
    pool.close().await;
    match result {
        Ok(page) => {
            print!("{}", render::sponsor_page(&page));
            Ok(())
        }
        Err(TrackerError::NoSponsorTable) => bail!("no sponsor data yet; run `tsa sync` first"),
        Err(err) => Err(err.into()),
    }
}

async fn apps(config: &TsaConfig, command: AppsCommand) -> Result<()> {
    let pool = open_database(&config.db_path).await?;
    let repo = ApplicationRepo::open(pool.clone()).await?;

    match command {
        AppsCommand::List(key) => {
            let apps = repo.list_for(&OrgCity::new(key.org, key.city)).await?;
            print!("{}", render::applications(&apps));
        }
        AppsCommand::Add { key, fields } => {
            let draft = fields.apply(ApplicationDraft::default());
            if draft.role.trim().is_empty() {
                bail!("--role is required");
            }
            let id = repo.add(&OrgCity::new(key.org, key.city), &draft).await?;
            println!("added application {id}");
        }
        AppsCommand::Edit { id, fields } => {
            let Some(existing) = repo.get(id).await? else {
                bail!("no application with id {id}");
            };
            let draft = fields.apply(existing.to_draft());
            repo.update(id, &draft).await?;
            let key = existing.org_city();
            println!("updated application {id} ({} | {})", key.organisation_name, key.city);
        }
        AppsCommand::Delete { id } => {
            if !repo.delete(id).await? {
                bail!("no application with id {id}");
            }
            println!("deleted application {id}");
        }
        AppsCommand::Pairs => {
            let mut pairs: Vec<_> = repo.org_city_pairs().await?.into_iter().collect();
            pairs.sort();
            for pair in pairs {
                println!("{} | {}", pair.organisation_name, pair.city);
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn settings_command(store: &SettingsStore, command: SettingsCommand) -> Result<()> {
    let updated: Settings = match command {
        SettingsCommand::Show => store.load()?,
        SettingsCommand::SetLogLevel { level } => {
            let Some(level) = normalize_log_level(&level) else {
                bail!("unknown log level {level:?}; expected DEBUG, INFO, WARNING, ERROR or CRITICAL");
            };
            store.update(|s| s.log_level = level.to_string())?
        }
        SettingsCommand::SetRotation { limit } => store.update(|s| s.log_rotation_limit = limit)?,
        SettingsCommand::SetReleaseCheck { enabled } => store.update(|s| s.check_for_release = enabled)?,
        SettingsCommand::Reset => store.reset_to_defaults()?,
    };
    print!("{}", render::settings(&updated));
    Ok(())
}

/// `quiet` suppresses the "up to date" line, for the startup check.
async fn check_release(config: &TsaConfig, quiet: bool) -> Result<()> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Some(Duration::from_secs(config.release_timeout_secs)),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..Default::default()
    })?;
    let feed = ReleaseFeed::new(config.release_url.clone());

    match feed.latest(&http).await? {
        Some(release) if is_newer_version(&release.tag, CURRENT_VERSION) => {
            info!(tag = %release.tag, "[RELEASE] update available");
            print!("{}", render::release_notice(&release, CURRENT_VERSION));
        }
        Some(release) => {
            if !quiet {
                println!("up to date (v{CURRENT_VERSION}, latest {})", release.tag);
            }
        }
        None => {
            if !quiet {
                println!("release feed unavailable");
            }
        }
    }
    Ok(())
}
