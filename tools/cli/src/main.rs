//! DocSync CLI - drives the sync core against a filesystem root.
//!
//! Every invocation is a fresh client session: the application is registered
//! (or re-validated), the requested document is registered and the command
//! runs against the shared root.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use docsync_common::{ApplicationId, Attributes, ClientId, DocumentId, Error, ObjectId, SyncChange};
use docsync_sync::{
    ApplicationSyncManager, ApplicationSyncManagerDelegate, ConflictStrategy, DocumentSyncManager,
    DocumentSyncManagerDelegate, MemoryObjectStore, ObjectStore, SaveSet, StrategyResolver,
    SyncConfig, SynchronizedObject, SynchronizedObjectContext,
};
use docsync_transport::{create_default_registry, SyncTransport, TransportSettings};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "DocSync - document change-stream synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Client configuration file.
    #[arg(short, long, default_value = "docsync.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the application on a root, creating it if needed.
    Init {
        /// Shared root directory.
        #[arg(short, long)]
        root: PathBuf,

        /// Application identifier.
        #[arg(short, long)]
        app: String,

        /// Client identifier (default: generated).
        #[arg(long)]
        client: Option<String>,

        /// Client description.
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Register a document.
    Register {
        #[arg(short, long)]
        root: PathBuf,

        #[arg(short, long)]
        app: String,

        /// Document identifier.
        #[arg(short, long)]
        doc: String,

        /// Human readable description.
        #[arg(long, default_value = "")]
        description: String,

        /// Helper location (default: helpers/<doc>).
        #[arg(long)]
        helper: Option<PathBuf>,
    },

    /// Save one object change and print the assigned sequence numbers.
    Record {
        #[arg(short, long)]
        root: PathBuf,

        #[arg(short, long)]
        app: String,

        #[arg(short, long)]
        doc: String,

        /// Object identifier.
        #[arg(short, long)]
        object: String,

        /// Entity name.
        #[arg(short, long)]
        entity: String,

        /// Delete the object.
        #[arg(long)]
        delete: bool,

        /// Attribute assignment, `name=value`; values are parsed as JSON
        /// and fall back to strings.
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        #[arg(long)]
        helper: Option<PathBuf>,
    },

    /// Print change records as JSON lines.
    Log {
        #[arg(short, long)]
        root: PathBuf,

        #[arg(short, long)]
        doc: String,

        /// Only this client's stream.
        #[arg(long)]
        origin: Option<String>,

        /// Only records after this sequence number.
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Replay change streams into a fresh store and print the objects.
    Replay {
        #[arg(short, long)]
        root: PathBuf,

        #[arg(short, long)]
        doc: String,

        /// Only this client's stream.
        #[arg(long)]
        origin: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            root,
            app,
            client,
            description,
        } => cmd_init(&cli.config, &root, &app, client, &description).await,

        Commands::Register {
            root,
            app,
            doc,
            description,
            helper,
        } => cmd_register(&cli.config, &root, &app, &doc, &description, helper).await,

        Commands::Record {
            root,
            app,
            doc,
            object,
            entity,
            delete,
            set,
            helper,
        } => {
            let change = ObjectChange {
                object,
                entity,
                delete,
                set,
            };
            cmd_record(&cli.config, &root, &app, &doc, change, helper).await
        }

        Commands::Log {
            root,
            doc,
            origin,
            since,
        } => cmd_log(&root, &doc, origin, since).await,

        Commands::Replay { root, doc, origin } => cmd_replay(&root, &doc, origin).await,
    }
}

struct ObjectChange {
    object: String,
    entity: String,
    delete: bool,
    set: Vec<String>,
}

/// Logs application registration progress.
struct LoggingApplicationDelegate;

impl ApplicationSyncManagerDelegate for LoggingApplicationDelegate {
    fn registration_error(&self, _manager: &ApplicationSyncManager, error: &Error) {
        eprintln!("warning: {}", error);
    }
}

/// Answers the pause with a fixed helper location and forwards save outcomes.
struct CliDocumentDelegate {
    helper: PathBuf,
    saves: mpsc::UnboundedSender<std::result::Result<(), String>>,
}

impl DocumentSyncManagerDelegate for CliDocumentDelegate {
    fn registration_error(&self, _manager: &DocumentSyncManager, error: &Error) {
        eprintln!("warning: {}", error);
    }

    fn paused_awaiting_remote_structure(
        &self,
        _manager: &DocumentSyncManager,
        document: &DocumentId,
        _description: &str,
        _metadata: &BTreeMap<String, Value>,
    ) -> Option<PathBuf> {
        info!("Creating structure of {} with helper {}", document, self.helper.display());
        Some(self.helper.clone())
    }

    fn helper_location(&self, _manager: &DocumentSyncManager, _document: &DocumentId) -> Option<PathBuf> {
        Some(self.helper.clone())
    }

    fn save_processing_began(&self, _manager: &DocumentSyncManager, _context: &SynchronizedObjectContext) {
        let _ = self.saves.send(Ok(()));
    }

    fn save_processing_failed(
        &self,
        _manager: &DocumentSyncManager,
        _context: &SynchronizedObjectContext,
        error: &Error,
    ) {
        let _ = self.saves.send(Err(error.to_string()));
    }
}

fn open_transport(root: &Path) -> Result<Arc<dyn SyncTransport>> {
    create_default_registry()
        .open(&TransportSettings::file(root))
        .with_context(|| format!("Failed to open file transport at {}", root.display()))
}

async fn load_config(path: &Path) -> Result<SyncConfig> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}; run `docsync init` first", path.display()))?;
    SyncConfig::from_json(&json).context("Invalid client configuration")
}

async fn register_application(
    config: SyncConfig,
    root: &Path,
    app: &str,
) -> Result<Arc<ApplicationSyncManager>> {
    let application = ApplicationId::new(app).context("Invalid application id")?;
    let manager = ApplicationSyncManager::new(
        config,
        application,
        open_transport(root)?,
        Arc::new(LoggingApplicationDelegate),
    );
    manager
        .register()
        .await
        .context("Application registration failed")?;
    Ok(manager)
}

/// Register a document whose pause is answered with `helper`.
async fn register_document(
    application: &ApplicationSyncManager,
    doc: &str,
    description: &str,
    store: Arc<dyn ObjectStore>,
    helper: Option<PathBuf>,
) -> Result<(
    Arc<DocumentSyncManager>,
    mpsc::UnboundedReceiver<std::result::Result<(), String>>,
)> {
    let document = DocumentId::new(doc).context("Invalid document id")?;
    let helper = helper.unwrap_or_else(|| PathBuf::from("helpers").join(doc));
    let (saves_tx, saves_rx) = mpsc::unbounded_channel();

    let manager = application.document_sync_manager(
        document,
        description,
        BTreeMap::new(),
        store,
        Arc::new(CliDocumentDelegate {
            helper,
            saves: saves_tx,
        }),
    )?;
    manager
        .register()
        .await
        .context("Document registration failed")?;
    Ok((manager, saves_rx))
}

/// Read every requested stream, in the order its records must be applied.
async fn read_streams(
    transport: &dyn SyncTransport,
    document: &DocumentId,
    origin: Option<String>,
    since: u64,
) -> Result<Vec<SyncChange>> {
    let origins = match origin {
        Some(origin) => vec![ClientId::new(origin).context("Invalid origin")?],
        None => transport.change_origins(document).await?,
    };

    let mut records = Vec::new();
    for origin in &origins {
        records.extend(transport.read_changes_since(document, origin, since).await?);
    }
    records.sort_by_key(|record| record.stamp());
    Ok(records)
}

/// Apply every stream of `document` to `store`.
async fn replay_into(
    transport: &dyn SyncTransport,
    document: &DocumentId,
    origin: Option<String>,
    store: Arc<dyn ObjectStore>,
    client: ClientId,
) -> Result<usize> {
    let resolver = Arc::new(StrategyResolver::new(ConflictStrategy::default(), client));
    let context = SynchronizedObjectContext::new(document.clone(), store, resolver);

    let records = read_streams(transport, document, origin, 0).await?;
    for record in &records {
        context.apply_remote(record)?;
    }
    Ok(records.len())
}

fn parse_assignments(assignments: &[String]) -> Result<Attributes> {
    let mut attributes = Attributes::new();
    for assignment in assignments {
        let (name, raw) = assignment
            .split_once('=')
            .with_context(|| format!("Expected NAME=VALUE, got '{}'", assignment))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        attributes.insert(name.to_string(), value);
    }
    Ok(attributes)
}

/// Register the application and persist the client configuration.
async fn cmd_init(
    config_path: &Path,
    root: &Path,
    app: &str,
    client: Option<String>,
    description: &str,
) -> Result<()> {
    let client = match client {
        Some(client) => ClientId::new(client).context("Invalid client id")?,
        None => ClientId::generate(),
    };
    let config = SyncConfig::new(client)
        .with_description(description)
        .with_transport(TransportSettings::file(root));

    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("Failed to create {}", root.display()))?;
    let manager = register_application(config.clone(), root, app).await?;

    tokio::fs::write(config_path, config.to_json()?)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Application registered!");
    println!("  Application: {}", manager.application());
    println!("  Client: {}", config.client);
    println!("  Root: {}", root.display());
    println!("  Config: {}", config_path.display());

    Ok(())
}

async fn cmd_register(
    config_path: &Path,
    root: &Path,
    app: &str,
    doc: &str,
    description: &str,
    helper: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let application = register_application(config, root, app).await?;
    let (manager, _saves) = register_document(
        &application,
        doc,
        description,
        Arc::new(MemoryObjectStore::new()),
        helper,
    )
    .await?;

    println!("Document registered!");
    println!("  Document: {}", manager.document());
    if let Some(helper) = manager.helper_path() {
        println!("  Helper: {}", helper.display());
    }
    println!("  Last written: {}", manager.cursor().last_written);

    Ok(())
}

async fn cmd_record(
    config_path: &Path,
    root: &Path,
    app: &str,
    doc: &str,
    change: ObjectChange,
    helper: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let client = config.client.clone();
    let application = register_application(config, root, app).await?;

    let document = DocumentId::new(doc).context("Invalid document id")?;
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let replayed = replay_into(
        application.transport().as_ref(),
        &document,
        None,
        store.clone(),
        client.clone(),
    )
    .await?;
    debug!("Replayed {} record(s) before saving", replayed);

    let (manager, mut saves) = register_document(&application, doc, "", store.clone(), helper).await?;
    let log = manager
        .change_log()
        .context("Registered document has no change log")?;
    let before = log.last_written();

    let id = ObjectId::new(change.object).context("Invalid object id")?;
    let attributes = parse_assignments(&change.set)?;
    let existing = store.get(&id);
    let save = match (existing, change.delete) {
        (Some(object), true) => SaveSet::new().delete(object),
        (None, true) => anyhow::bail!("Object {} does not exist", id),
        (Some(_), false) => {
            SaveSet::new().update(SynchronizedObject::new(id, change.entity, attributes))
        }
        (None, false) => {
            SaveSet::new().insert(SynchronizedObject::new(id, change.entity, attributes))
        }
    };

    manager.context().save(save)?;
    match saves.recv().await {
        Some(Ok(())) => {}
        Some(Err(e)) => anyhow::bail!("Save failed: {}", e),
        None => anyhow::bail!("Save pipeline stopped"),
    }

    for record in log.read_since(&client, before).await? {
        println!("{}\t{:?}\t{}", record.sequence, record.kind, record.object);
    }

    Ok(())
}

async fn cmd_log(root: &Path, doc: &str, origin: Option<String>, since: u64) -> Result<()> {
    let transport = open_transport(root)?;
    let document = DocumentId::new(doc).context("Invalid document id")?;

    for record in read_streams(transport.as_ref(), &document, origin, since).await? {
        println!("{}", serde_json::to_string(&record)?);
    }

    Ok(())
}

async fn cmd_replay(root: &Path, doc: &str, origin: Option<String>) -> Result<()> {
    let transport = open_transport(root)?;
    let document = DocumentId::new(doc).context("Invalid document id")?;
    let store = Arc::new(MemoryObjectStore::new());

    let applied = replay_into(
        transport.as_ref(),
        &document,
        origin,
        store.clone(),
        ClientId::generate(),
    )
    .await?;
    info!("Replayed {} record(s)", applied);

    println!("{}", serde_json::to_string_pretty(&store.snapshot())?);

    Ok(())
}
