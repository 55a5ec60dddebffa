//! Administrative commands.
//!
//! `init` bootstraps the schema and default tenant, `scan` lists watched
//! folders, `process` runs pending items, `worker` runs the scheduler loop
//! and `models` shows how every task type resolves.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fs4::FileExt;
use tokio_util::sync::CancellationToken;

use crate::app::{AppBuilder, AppContext, connect_database};
use crate::config::{ConfigLoader, ModelsConfig, Settings};
use crate::control_plane::{Credentials, ModelResolver, TASK_TYPES, describe};
use crate::error::{ConfigError, DatabaseError, Error, ErrorKind, PipelineError};
use crate::models::ContentStatus;
use crate::watcher::WatcherError;

/// How long `process` waits for one item before moving on.
const PROCESS_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(
    name = "alice",
    version,
    about = "Personal video and audio knowledge assistant",
    long_about = "Administrative tool for the agent core: schema bootstrap, folder scans, content processing and the background worker."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration root holding base/, <env>/ and local/
    #[arg(long, global = true, env = "ALICE_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    /// Configuration environment layer (defaults to ALICE_ENV or development)
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply migrations and create the default tenant
    Init,

    /// Scan every watched folder for new items
    Scan {
        /// Only scan this tenant's folders
        #[arg(long)]
        tenant: Option<i64>,
    },

    /// Process pending items through the pipeline
    Process {
        /// Maximum number of items to process
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Tenant whose items are processed (defaults to every tenant)
        #[arg(long)]
        tenant: Option<i64>,
    },

    /// Run the background scheduler until interrupted
    Worker,

    /// List model profiles and how each task type resolves
    Models,
}

impl Cli {
    pub fn loader(&self) -> ConfigLoader {
        let env = self.env.clone().unwrap_or_else(crate::config::current_env);
        ConfigLoader::new(&self.config_dir, env).with_process_env()
    }

    fn builder(&self) -> AppBuilder {
        let builder = AppBuilder::new(&self.config_dir);
        match &self.env {
            Some(env) => builder.with_env(env),
            None => builder,
        }
    }
}

/// Exit code for a failed command: 1 user error, 2 configuration error,
/// 3 infrastructure failure.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = if let Some(e) = err.downcast_ref::<Error>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<ConfigError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<DatabaseError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<WatcherError>() {
        e.kind()
    } else {
        ErrorKind::Internal
    };
    match kind {
        ErrorKind::Validation | ErrorKind::NotFound => 1,
        ErrorKind::Config => 2,
        _ => 3,
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Init => init(&cli).await,
        Command::Scan { tenant } => scan(&cli, tenant).await,
        Command::Process { limit, tenant } => process(&cli, limit, tenant).await,
        Command::Worker => worker(&cli).await,
        Command::Models => models(&cli).await,
    }
}

async fn init(cli: &Cli) -> anyhow::Result<()> {
    let settings = Settings::load(&cli.loader())?;
    if settings.database.url.is_none() {
        return Err(ConfigError::Invalid(
            "database.url is required for init (set ALICE__SETTINGS__DATABASE__URL)".into(),
        )
        .into());
    }
    let (db, _) = connect_database(&settings).await?;
    let tenant = db
        .ensure_tenant(&settings.default_tenant, &settings.default_tenant)
        .await?;
    println!("Schema is up to date");
    println!("Default tenant: {} (id {})", tenant.slug, tenant.id);
    Ok(())
}

async fn scan(cli: &Cli, tenant: Option<i64>) -> anyhow::Result<()> {
    let app = cli.builder().build().await?;
    let report = match tenant {
        Some(id) => app.watcher.scan_tenant(id).await?,
        None => app.watcher.scan_all().await?,
    };
    println!(
        "Scanned {} folder(s), {} new item(s)",
        report.folders_scanned,
        report.new_items.len()
    );
    for folder in &report.failed_folders {
        println!("  failed: {}", folder);
    }
    Ok(())
}

async fn pending_items(app: &AppContext, tenant: Option<i64>, limit: usize) -> anyhow::Result<Vec<i64>> {
    let tenants = match tenant {
        Some(id) => vec![id],
        None => app.db.list_tenants().await?.into_iter().map(|t| t.id).collect(),
    };
    let mut ids = Vec::new();
    for tenant_id in tenants {
        let remaining = limit.saturating_sub(ids.len());
        if remaining == 0 {
            break;
        }
        let items = app
            .db
            .list_content_items(tenant_id, Some(ContentStatus::Pending), remaining)
            .await?;
        ids.extend(items.into_iter().map(|i| i.id));
    }
    Ok(ids)
}

async fn process(cli: &Cli, limit: usize, tenant: Option<i64>) -> anyhow::Result<()> {
    if limit == 0 {
        return Err(Error::Validation("--limit must be at least 1".into()).into());
    }
    let app = cli.builder().build().await?;
    let ids = pending_items(&app, tenant, limit).await?;
    if ids.is_empty() {
        println!("No pending items");
        return Ok(());
    }

    for &id in &ids {
        app.queue.submit(id, None);
    }
    let mut done = 0;
    let mut failed = 0;
    for &id in &ids {
        match app.queue.wait_for(id, PROCESS_WAIT).await {
            Some(crate::pipeline::QueueStatus::Completed) => {
                done += 1;
                println!("  {}: done", id);
            }
            status => {
                failed += 1;
                let reason = app.queue.error(id).unwrap_or_else(|| format!("{:?}", status));
                println!("  {}: {}", id, reason);
            }
        }
    }
    println!("Processed {} item(s): {} done, {} failed", ids.len(), done, failed);
    app.queue.shutdown(app.settings.queue.shutdown_wait()).await;
    Ok(())
}

/// Exclusive lock so only one worker runs per data directory.
fn worker_lock(settings: &Settings) -> anyhow::Result<File> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let path = settings.data_dir.join("worker.lock");
    let file = File::create(&path)?;
    file.try_lock_exclusive().map_err(|_| {
        Error::Validation(format!("another worker holds {}", path.display()))
    })?;
    Ok(file)
}

async fn worker(cli: &Cli) -> anyhow::Result<()> {
    let app = cli.builder().build().await?;
    let _lock = worker_lock(&app.settings)?;
    let mut scheduler = app.scheduler()?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
        }
        signal.cancel();
    });

    scheduler.run(shutdown).await;
    app.queue.shutdown(app.settings.queue.shutdown_wait()).await;
    Ok(())
}

async fn models(cli: &Cli) -> anyhow::Result<()> {
    let config: ModelsConfig = cli.loader().load("models")?;
    let resolver = ModelResolver::new(config, Credentials::from_env());

    println!("Profiles:");
    let profiles = resolver.list_profiles(None);
    let width = profiles.iter().map(|(id, _)| id.len()).max().unwrap_or(0);
    for (id, profile) in &profiles {
        println!(
            "  {:width$}  {:?}  {}/{}",
            id,
            profile.kind,
            profile.provider,
            profile.model,
            width = width
        );
    }

    println!();
    println!("Task types:");
    for task in TASK_TYPES {
        match resolver.resolve(task, None, None).await {
            Ok(model) => println!("  {:10}  {}", task, describe(&model)),
            Err(e) => println!("  {:10}  unresolved: {}", task, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_process_command() {
        let cli = Cli::try_parse_from(["alice", "process", "--limit", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Process { limit: 3, tenant: None }));
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_exit_codes() {
        let user: anyhow::Error = Error::Validation("bad".into()).into();
        assert_eq!(exit_code(&user), 1);
        let config: anyhow::Error = ConfigError::Invalid("bad".into()).into();
        assert_eq!(exit_code(&config), 2);
        let infra: anyhow::Error = DatabaseError::Pool("down".into()).into();
        assert_eq!(exit_code(&infra), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 3);
    }

    #[test]
    fn test_worker_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let _first = worker_lock(&settings).unwrap();
        let second = worker_lock(&settings).unwrap_err();
        assert_eq!(exit_code(&second), 1);
    }
}
