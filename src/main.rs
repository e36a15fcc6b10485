use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use termkeep::{
    migration::{MigrationEngine, MigrationEntry},
    project::ProjectRegistry,
    rollback::{VersionKeeper, DEFAULT_RETAIN},
    snapshot::SnapshotStore,
    store::{default_data_dir, DurableStore},
    TermKeepError,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "termkeep")]
#[command(about = "Inspect and maintain the terminal-session manager's durable state")]
#[command(version)]
struct Cli {
    /// Override the application data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the on-disk schema up to date
    Migrate,
    /// List known projects
    Projects,
    /// List snapshots for a project
    Snapshots {
        /// Project ID
        project_id: String,
    },
    /// List preserved application versions
    Versions,
    /// Inspect or clear the staged rollback instruction
    Rollback {
        #[command(subcommand)]
        action: RollbackAction,
    },
}

#[derive(Subcommand)]
enum RollbackAction {
    /// Show the pending rollback, if any
    Status,
    /// Stage a rollback to a preserved version
    Install { version: String },
    /// Discard the pending rollback
    Clear,
}

/// The application's migration registry. Versions already applied on a
/// given install are skipped via history.
fn registered_migrations() -> Vec<MigrationEntry> {
    vec![MigrationEntry {
        version: "0.2.0".to_string(),
        description: "stamp updated_at on terminal layouts".to_string(),
        apply: Box::new(|store| {
            Box::pin(async move {
                let projects: Vec<termkeep::Project> =
                    store.read_as("projects").await?.unwrap_or_default();
                for project in projects {
                    let key = format!("terminals/{}", project.id);
                    let Some(mut doc) = store.read(&key).await? else {
                        continue;
                    };
                    let Some(layout) = doc.as_object_mut() else {
                        continue;
                    };
                    if !layout.contains_key("updated_at") {
                        layout.insert(
                            "updated_at".to_string(),
                            json!(chrono::Utc::now()),
                        );
                        store.write(&key, &doc).await?;
                    }
                }
                Ok(())
            })
        }),
        rollback: None,
    }]
}

#[tokio::main]
async fn main() -> Result<(), TermKeepError> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    info!("Using data directory {}", data_dir.display());
    let store = Arc::new(DurableStore::new(data_dir));

    match cli.command {
        Commands::Migrate => migrate(store).await?,
        Commands::Projects => list_projects(store).await?,
        Commands::Snapshots { project_id } => list_snapshots(store, &project_id).await?,
        Commands::Versions => list_versions(store).await?,
        Commands::Rollback { action } => rollback(store, action).await?,
    }

    Ok(())
}

async fn migrate(store: Arc<DurableStore>) -> Result<(), TermKeepError> {
    let mut engine = MigrationEngine::new(store);
    for entry in registered_migrations() {
        engine.register(entry);
    }

    let before = engine.current_version().await?;
    let run = engine.run_migrations().await?;

    if run.records.is_empty() {
        println!("Schema already up to date at {}", before);
        return Ok(());
    }
    for record in &run.records {
        let status = if record.success { "ok" } else { "FAILED" };
        println!(
            "{}  {} ({} ms){}",
            status,
            record.version,
            record.duration_ms,
            record
                .error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
    }
    println!("Schema version: {}", engine.current_version().await?);
    Ok(())
}

async fn list_projects(store: Arc<DurableStore>) -> Result<(), TermKeepError> {
    let registry = ProjectRegistry::load(store).await?;
    println!("📁 Projects:");
    println!("{}", "─".repeat(50));
    for project in registry.projects() {
        let shell = project.shell.as_deref().unwrap_or("(default shell)");
        println!("{} - {} [{}] {}", project.id, project.name, shell, project.path);
    }
    Ok(())
}

async fn list_snapshots(store: Arc<DurableStore>, project_id: &str) -> Result<(), TermKeepError> {
    let mut snapshots = SnapshotStore::new(store);
    snapshots.load_project(project_id).await?;
    println!("🗂  Snapshots for {}:", project_id);
    println!("{}", "─".repeat(50));
    for snapshot in snapshots.snapshots(project_id) {
        println!(
            "{} - {} ({} terminal(s), {}){}",
            snapshot.id,
            snapshot.name,
            snapshot.terminals.len(),
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
            snapshot
                .tag
                .as_ref()
                .map(|t| format!(" #{}", t))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn list_versions(store: Arc<DurableStore>) -> Result<(), TermKeepError> {
    let keeper = VersionKeeper::new(store, DEFAULT_RETAIN);
    println!("🕰  Preserved versions:");
    println!("{}", "─".repeat(50));
    for version in keeper.preserved_versions().await? {
        println!(
            "{} - {} bytes, preserved {}",
            version.version,
            version.size_bytes,
            version.preserved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn rollback(store: Arc<DurableStore>, action: RollbackAction) -> Result<(), TermKeepError> {
    let keeper = VersionKeeper::new(store, DEFAULT_RETAIN);
    match action {
        RollbackAction::Status => match keeper.check_pending_rollback().await? {
            Some(pending) => println!(
                "Pending rollback to {} (from {}), requested {}",
                pending.target_version,
                pending.source_path,
                pending.requested_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("No rollback pending"),
        },
        RollbackAction::Install { version } => {
            let pending = keeper.install_rollback(&version).await?;
            println!(
                "✅ Rollback to {} staged; restart to complete",
                pending.target_version
            );
        }
        RollbackAction::Clear => {
            keeper.clear_pending_rollback().await?;
            println!("Pending rollback cleared");
        }
    }
    Ok(())
}
