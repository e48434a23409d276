use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use syncline::config::EngineConfig;
use syncline::model::FieldPatch;
use syncline::reachability::{
    HttpLinkProbe, HttpServiceProbe, ReachabilityMonitor, ReachabilitySnapshot, TcpPlatformWatch,
};
use syncline::remote::{HttpRemote, MemoryRemote, RemoteStore};
use syncline::storage::{Database, LegacyMigrator, LocalStore, MutationQueue, SqliteNamespace};
use syncline::sync::{EntityRepository, SaveOutcome, SyncManager, SyncReconciler};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "syncline")]
#[command(about = "Local-first entity cache with an offline mutation queue", long_about = None)]
struct Args {
    /// Directory holding syncline.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Owner collection to work on (overrides the configured one)
    #[arg(long)]
    owner: Option<String>,

    /// Treat the platform as offline: every mutation is queued
    #[arg(long)]
    offline: bool,

    /// Use an in-process remote store instead of HTTP
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show queue and cache counters
    Status,
    /// List the entities of the owner collection
    List,
    /// Show one entity
    Get { id: String },
    /// Patch fields of an entity, e.g. `save r1 '{"name":"Soup"}'`
    Save { id: String, fields: String },
    /// Delete an entity
    Delete { id: String },
    /// Run one reconciliation pass
    Sync,
    /// List mutations dropped after their last retry
    DeadLetters {
        /// Purge the log after printing it
        #[arg(long)]
        clear: bool,
    },
    /// Monitor connectivity and reconcile on every reconnect until Ctrl+C
    Watch,
}

struct Engine {
    config: EngineConfig,
    owner: String,
    db: Arc<Database>,
    local: LocalStore,
    queue: MutationQueue,
    remote: Arc<dyn RemoteStore>,
}

impl Engine {
    fn open(args: &Args) -> anyhow::Result<Self> {
        let config = EngineConfig::load(&args.config_dir)
            .with_context(|| format!("loading config from {}", args.config_dir.display()))?;

        let owner = args
            .owner
            .clone()
            .or_else(|| config.owner.clone())
            .ok_or_else(|| anyhow!("no owner collection: pass --owner or set SYNCLINE_OWNER"))?;

        let db = Arc::new(Database::new(config.storage.database_path()));
        let remote: Arc<dyn RemoteStore> = if args.memory {
            Arc::new(MemoryRemote::new())
        } else {
            Arc::new(HttpRemote::from_config(&config.remote)?)
        };

        Ok(Self {
            local: LocalStore::new(db.clone()),
            queue: MutationQueue::new(db.clone()),
            config,
            owner,
            db,
            remote,
        })
    }

    fn platform_watch(&self) -> anyhow::Result<TcpPlatformWatch> {
        let reach = &self.config.reachability;
        Ok(TcpPlatformWatch::for_url(
            &self.config.remote.base_url,
            reach.platform_poll(),
            reach.probe_timeout(),
        )?)
    }

    /// One-shot platform check for the non-watch commands
    async fn initially_online(&self, args: &Args) -> anyhow::Result<bool> {
        if args.offline {
            return Ok(false);
        }
        if args.memory {
            return Ok(true);
        }
        Ok(self.platform_watch()?.check().await)
    }

    fn repository(&self, connectivity: watch::Receiver<ReachabilitySnapshot>) -> EntityRepository {
        let migrator = LegacyMigrator::new(
            Arc::new(SqliteNamespace::new(self.db.clone())),
            self.local.clone(),
            &self.config.storage.legacy_key_prefix,
        );

        EntityRepository::new(
            &self.owner,
            self.local.clone(),
            self.queue.clone(),
            self.remote.clone(),
            connectivity,
        )
        .with_migrator(migrator)
        .with_request_timeout(self.config.remote.request_timeout())
    }

    fn reconciler(&self) -> SyncReconciler {
        SyncReconciler::new(
            self.queue.clone(),
            self.local.clone(),
            self.remote.clone(),
            self.config.sync.clone(),
            self.config.remote.request_timeout(),
        )
    }
}

fn parse_fields(raw: &str) -> anyhow::Result<FieldPatch> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("fields must be a JSON object")?;
    match value {
        serde_json::Value::Object(fields) => Ok(fields),
        other => bail!("fields must be a JSON object, got {}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = Engine::open(&args)?;
    let online = engine.initially_online(&args).await?;
    let (_connectivity_tx, connectivity) = watch::channel(ReachabilitySnapshot::initial(online));

    match &args.command {
        Command::Status => {
            let stats = engine.queue.stats()?;
            let dead = engine.queue.dead_letters()?.len();
            let cached = engine.local.count(&engine.owner)?;
            if let Some(path) = engine.db.path() {
                println!("database:     {}", path.display());
            }
            println!("owner:        {}", engine.owner);
            println!("online:       {}", online);
            println!("pending:      {}", stats.pending);
            println!("syncing:      {}", stats.syncing);
            println!("queued bytes: {}", stats.bytes);
            println!("dead letters: {}", dead);
            println!("cached:       {}", cached);
        }
        Command::List => {
            let repo = engine.repository(connectivity);
            for entity in repo.load().await? {
                println!("{}", serde_json::to_string(&entity)?);
            }
        }
        Command::Get { id } => {
            let repo = engine.repository(connectivity);
            repo.load().await?;
            println!("{}", serde_json::to_string_pretty(&repo.require(id)?)?);
        }
        Command::Save { id, fields } => {
            let fields = parse_fields(fields)?;
            let repo = engine.repository(connectivity);
            repo.reload_cached()?;
            report_outcome("save", id, repo.save(id, fields).await?);
        }
        Command::Delete { id } => {
            let repo = engine.repository(connectivity);
            repo.reload_cached()?;
            report_outcome("delete", id, repo.delete(id).await?);
        }
        Command::Sync => {
            if !online {
                bail!("offline: nothing can be reconciled now");
            }
            let report = engine.reconciler().run_pass(&[engine.owner.clone()]).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::DeadLetters { clear } => {
            for letter in engine.queue.dead_letters()? {
                println!(
                    "{} {} {} after {} attempts: {}",
                    letter.entry.id,
                    letter.entry.kind,
                    letter.entry.target_entity_id,
                    letter.entry.retry_count,
                    letter.last_error
                );
            }
            if *clear {
                let removed = engine.queue.clear_dead_letters()?;
                tracing::info!("Cleared {} dead letters", removed);
            }
        }
        Command::Watch => watch_until_shutdown(&engine, online, args.memory).await?,
    }

    Ok(())
}

fn report_outcome(action: &str, id: &str, outcome: SaveOutcome) {
    match outcome {
        SaveOutcome::Synced => println!("{} {}: synced", action, id),
        SaveOutcome::Queued => println!("{} {}: queued", action, id),
    }
}

async fn watch_until_shutdown(engine: &Engine, online: bool, memory: bool) -> anyhow::Result<()> {
    let reach = &engine.config.reachability;
    let remote_config = &engine.config.remote;

    let mut monitor = ReachabilityMonitor::new(reach.clone(), online);
    if !memory {
        monitor = monitor
            .with_link_probe(Arc::new(HttpLinkProbe::from_config(
                remote_config,
                reach.probe_timeout(),
            )?))
            .with_service_probes(
                Arc::new(HttpServiceProbe::data_api(remote_config, reach.probe_timeout())?),
                Arc::new(HttpServiceProbe::compute_api(remote_config, reach.probe_timeout())?),
            );
    }
    let monitor = Arc::new(monitor);

    let mut manager = SyncManager::new(Arc::new(engine.reconciler()), vec![engine.owner.clone()]);
    let mut reports = manager.subscribe_reports();
    let manager_handle = manager.start(monitor.events());
    let probe_handle = monitor.clone().spawn();
    let platform_handle = if memory {
        None
    } else {
        Some(engine.platform_watch()?.spawn(monitor.clone()))
    };

    if online {
        manager.sync_now().await;
    }
    tracing::info!("Watching {} (Ctrl+C to stop)", engine.owner);

    let mut snapshots = monitor.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(report) = reports.recv() => {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(()) = snapshots.changed() => {
                let snapshot = *snapshots.borrow_and_update();
                tracing::info!(
                    "link={:?} data_api={} compute_api={}{}",
                    snapshot.link,
                    snapshot.data_api_reachable,
                    snapshot.compute_api_reachable,
                    if snapshot.restored { " (restored)" } else { "" }
                );
            }
        }
    }

    tracing::info!("Shutdown signal received, stopping");
    manager.stop().await;
    let _ = manager_handle.await;
    probe_handle.abort();
    if let Some(handle) = platform_handle {
        handle.abort();
    }
    Ok(())
}
