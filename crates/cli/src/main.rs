//! mirrorsync command-line management tool.
//!
//! Provides subcommands for running a sync, inspecting cursors and run
//! history, reviewing conflict resolutions and the audit log, looking up
//! identity pairs, and generating / validating configuration files.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use mirrorsync_core::config::AppConfig;
use mirrorsync_core::db::Database;
use mirrorsync_core::models::{Cursor, PairStatus, RunDirection, Side, SyncRun};
use mirrorsync_core::schema::SchemaRegistry;
use mirrorsync_core::sync_engine::{EngineStatus, RunOptions, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// mirrorsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "mirrorsync",
    version,
    about = "Run and inspect document-store/relational-mirror synchronization"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/mirrorsync/config.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync now.
    Sync {
        /// primary_to_mirror, mirror_to_primary or bidirectional.
        #[arg(short, long, value_parser = parse_direction)]
        direction: Option<RunDirection>,

        /// Start from this time instead of the stored cursors (RFC 3339 or
        /// epoch milliseconds, inclusive).
        #[arg(long, value_parser = parse_since)]
        since: Option<i64>,

        /// Only sync these entities (repeatable).
        #[arg(short, long = "entity")]
        entities: Vec<String>,
    },

    /// Show sync state, cursors and the last run.
    Status,

    /// Show recent sync runs.
    Runs {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Show logged conflict resolutions.
    Conflicts {
        /// Only show conflicts of this entity.
        #[arg(short, long)]
        entity: Option<String>,

        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Print both sides and the merged record of each conflict.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Look up the counterpart of a record.
    Identity {
        /// Entity type, as named in the mapping file.
        entity: String,

        /// Record id.
        id: String,

        /// Treat `id` as a mirror id instead of a primary id.
        #[arg(long)]
        mirror: bool,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Generate a sample configuration and mapping file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./mirrorsync.toml")]
        output: PathBuf,
    },

    /// Validate the configuration and mapping files.
    Validate,
}

fn parse_direction(s: &str) -> Result<RunDirection, String> {
    s.parse()
}

fn parse_since(s: &str) -> Result<i64, String> {
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("'{s}' is neither epoch milliseconds nor RFC 3339: {e}"))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = expand_tilde(&cli.config);
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&config_path),
        command => {
            // All other commands need the config and database
            let config = load_config(&config_path)?;
            let db = open_database(&config)?;

            match command {
                Commands::Sync {
                    direction,
                    since,
                    entities,
                } => {
                    let direction = direction.unwrap_or(config.sync.default_direction);
                    let options = RunOptions {
                        direction,
                        since,
                        entities,
                    };
                    cmd_sync(&config, db, options).await
                }
                Commands::Status => cmd_status(&db),
                Commands::Runs { limit } => cmd_runs(&db, limit),
                Commands::Conflicts {
                    entity,
                    limit,
                    verbose,
                } => cmd_conflicts(&db, entity.as_deref(), limit, verbose),
                Commands::Identity { entity, id, mirror } => cmd_identity(&db, &entity, &id, mirror),
                Commands::Audit { limit } => cmd_audit(&db, limit),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db_path = config.daemon.database_path();
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).context("failed to create data directory")?;
    }
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_sync(config: &AppConfig, db: Database, options: RunOptions) -> Result<()> {
    let engine = SyncEngine::from_config(config, Arc::new(db))
        .context("failed to initialize sync engine")?;

    // Ctrl+C stops fetching; whatever was fetched still gets applied.
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style::warn("cancelling: finishing fetched batches"));
            flag.store(true, Ordering::SeqCst);
        }
    });

    println!(
        "{}",
        style::header(&format!("Syncing ({})", options.direction))
    );
    let run = engine
        .run(options, cancel)
        .await
        .context("sync run failed")?;

    println!("{}", pairs_table(&run));
    let totals = run.totals();
    println!(
        "{}",
        style::dim(&format!(
            "run {} {}: fetched {}, applied {}, conflicts {}, failed records {}",
            run.id, run.status, totals.fetched, totals.applied, totals.conflicted, totals.failed
        ))
    );

    let failures = failure_summary(&run);
    if failures.is_empty() {
        println!("{}", style::success("sync completed"));
        return Ok(());
    }

    println!();
    println!("{}", style::header("Failed pairs"));
    for line in &failures {
        println!("  {}", style::error(line));
    }
    anyhow::bail!("{} pair(s) failed", failures.len())
}

/// One line per failed pair: entity, direction, and the reason.
fn failure_summary(run: &SyncRun) -> Vec<String> {
    run.failed_pairs()
        .map(|p| {
            format!(
                "{} {}: {} (cursor at {})",
                p.entity,
                p.direction,
                p.error.as_deref().unwrap_or("failed"),
                p.cursor_after
            )
        })
        .collect()
}

fn pairs_table(run: &SyncRun) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Entity", "Direction", "Status", "Fetched", "Applied", "Conflicts", "Skipped", "Failed", "Cursor",
    ]);
    for p in &run.pairs {
        table.add_row(vec![
            Cell::new(&p.entity),
            Cell::new(p.direction.to_string()),
            style::pair_status_cell(p.status),
            Cell::new(p.counts.fetched),
            Cell::new(p.counts.applied),
            Cell::new(p.counts.conflicted),
            Cell::new(p.counts.skipped),
            Cell::new(p.counts.failed),
            Cell::new(cursor_label(&p.cursor_after)),
        ]);
    }
    table
}

fn cursor_label(cursor: &Cursor) -> String {
    if cursor.is_epoch() {
        return "-".to_string();
    }
    let when = DateTime::<Utc>::from_timestamp_millis(cursor.timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| cursor.timestamp.to_string());
    format!("{} {}", when, truncate(&cursor.record_id, 24))
}

fn cmd_status(db: &Database) -> Result<()> {
    let status = EngineStatus::load(db).context("failed to read sync status")?;

    println!("{}", style::header("mirrorsync status"));
    println!();
    println!("  Sync state       : {}", status.state);
    println!(
        "  Last sync at     : {}",
        status
            .last_sync_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Identity pairs   : {}", status.identities);
    println!("  Logged conflicts : {}", status.conflicts);
    println!("  Errors           : {}", status.errors);
    println!();

    if status.cursors.is_empty() {
        println!("{}", style::dim("No cursors yet; nothing has been synced."));
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Entity", "Direction", "Cursor", "Generation", "Updated"]);
        for c in &status.cursors {
            table.add_row(vec![
                Cell::new(&c.entity_type),
                Cell::new(&c.direction),
                Cell::new(cursor_label(&c.cursor)),
                Cell::new(c.cursor.generation),
                Cell::new(&c.updated_at[..19.min(c.updated_at.len())]),
            ]);
        }
        println!("{}", table);
    }

    if let Some(run) = &status.last_run {
        println!();
        println!(
            "{}",
            style::header(&format!("Last run {} ({})", run.id, run.status))
        );
        println!("{}", pairs_table(run));
        for line in failure_summary(run) {
            println!("  {}", style::error(&line));
        }
    }

    Ok(())
}

fn cmd_runs(db: &Database, limit: u32) -> Result<()> {
    let runs = db.list_sync_runs(limit).context("failed to list sync runs")?;
    if runs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "ID", "Started", "Direction", "Status", "Pairs", "Applied", "Conflicts", "Failed",
    ]);
    for run in &runs {
        let totals = run.totals();
        let id_short = if run.id.len() > 8 { &run.id[..8] } else { &run.id };
        table.add_row(vec![
            Cell::new(id_short),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(run.direction.to_string()),
            style::run_status_cell(run.status),
            Cell::new(run.pairs.len()),
            Cell::new(totals.applied),
            Cell::new(totals.conflicted),
            Cell::new(run.pairs.iter().filter(|p| p.status == PairStatus::Failed).count()),
        ]);
    }
    println!("{}", table);
    println!("{} run(s) shown", runs.len());
    Ok(())
}

fn cmd_conflicts(db: &Database, entity: Option<&str>, limit: u32, verbose: bool) -> Result<()> {
    let conflicts = db
        .list_conflict_log(entity, limit)
        .context("failed to list conflicts")?;

    if conflicts.is_empty() {
        println!("{}", style::success("No conflicts logged"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Entity", "Primary", "Mirror", "Outcome", "Created"]);
    for c in &conflicts {
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(&c.entity_type),
            Cell::new(truncate(&c.primary_id, 24)),
            Cell::new(truncate(&c.mirror_id, 24)),
            Cell::new(&c.outcome),
            Cell::new(&c.created_at[..19.min(c.created_at.len())]),
        ]);
    }
    println!("{}", table);

    if verbose {
        for c in &conflicts {
            println!();
            println!(
                "{}",
                style::header(&format!("Conflict {} ({} {})", c.id, c.entity_type, c.primary_id))
            );
            for (label, raw) in [
                ("primary", &c.primary_json),
                ("mirror", &c.mirror_json),
                ("resolved", &c.resolved_json),
            ] {
                println!("{}:", style::dim(label));
                println!("{}", pretty_json(raw));
            }
        }
    }

    println!();
    println!("{} conflict(s) shown", conflicts.len());
    Ok(())
}

fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

fn cmd_identity(db: &Database, entity: &str, id: &str, mirror: bool) -> Result<()> {
    let side = if mirror { Side::Mirror } else { Side::Primary };
    let entry = db
        .find_identity(entity, side, id)
        .context("failed to look up identity")?;

    match entry {
        Some(e) => {
            println!("Entity     : {}", e.entity_type);
            println!("Primary id : {}", e.primary_id);
            println!("Mirror id  : {}", e.mirror_id);
            println!(
                "Last write to primary : {}",
                e.primary_written_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!(
                "Last write to mirror  : {}",
                e.mirror_written_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        None => println!(
            "{}",
            style::warn(&format!("No counterpart recorded for {entity} {side} id '{id}'"))
        ),
    }
    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!("{:<22} {:<14} {:<14} DETAILS", "TIMESTAMP", "ACTION", "ENTITY");
    println!("{}", "-".repeat(90));

    for entry in &entries {
        let details = truncate(entry.details.as_deref().unwrap_or(""), 60);
        println!(
            "{:<22} {:<14} {:<14} {}",
            &entry.created_at[..19.min(entry.created_at.len())],
            entry.action,
            entry.entity_type.as_deref().unwrap_or("-"),
            if entry.success { details } else { style::error(&details) },
        );
    }

    println!();
    println!("{} entries shown", entries.len());

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# mirrorsync configuration

[daemon]
poll_interval_secs = 60
log_level = "info"
data_dir = "/var/lib/mirrorsync"
# log_file = "/var/log/mirrorsync/mirrorsync.log"

[primary]
base_url = "https://docs.example.com/api"
token_env = "MIRRORSYNC_PRIMARY_TOKEN"
timeout_secs = 30
# requests_per_second = 20

[mirror]
base_url = "https://rows.example.com/api"
token_env = "MIRRORSYNC_MIRROR_TOKEN"
timeout_secs = 30

[schema]
mapping_file = "mappings.toml"

[sync]
default_direction = "bidirectional"
concurrency = 4
page_size = 100
max_in_flight_batches = 4
request_timeout_secs = 30

[sync.retry]
max_attempts = 5
initial_delay_ms = 200
max_delay_ms = 30000
multiplier = 2.0
jitter = true
"#;

const SAMPLE_MAPPING: &str = r#"# Entity mappings: primary document paths <-> mirror columns.

[[entities]]
name = "Account"
primary_collection = "accounts"
mirror_table = "accounts"

[[entities.fields]]
source = "name"
target = "name"

[[entities]]
name = "Contact"
primary_collection = "contacts"
mirror_table = "contacts"
identity = "mapped"

[[entities.fields]]
source = "profile.email"
target = "email"

[[entities.fields]]
source = "profile.phone"
target = "phone"

[[entities.fields]]
source = "account"
target = "account_id"
coercion = { kind = "reference", entity = "Account", required = true }

[[entities.fields]]
source = "status"
target = "status_code"
coercion = { kind = "enum_remap", values = { active = "A", archived = "X" } }
"#;

fn cmd_init(output: &Path) -> Result<()> {
    let mapping = output.with_file_name("mappings.toml");
    for path in [output, mapping.as_path()] {
        if path.exists() {
            anyhow::bail!(
                "file already exists: {}. Use a different path or remove the existing file.",
                path.display()
            );
        }
    }

    std::fs::write(output, SAMPLE_CONFIG).context("failed to write config file")?;
    std::fs::write(&mapping, SAMPLE_MAPPING).context("failed to write mapping file")?;

    println!(
        "{}",
        style::success(&format!("Configuration written to {}", output.display()))
    );
    println!(
        "{}",
        style::success(&format!("Mappings written to {}", mapping.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Edit the store URLs and the entity mappings");
    println!("  2. Set MIRRORSYNC_PRIMARY_TOKEN and MIRRORSYNC_MIRROR_TOKEN");
    println!(
        "  3. Validate with: mirrorsync validate --config {}",
        output.display()
    );
    println!(
        "  4. Start the daemon: mirrorsync-daemon --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    // Missing tokens are reported below, not fatal here.
    if let Err(e) = config.resolve_env_vars() {
        println!("  {}", style::warn(&e.to_string()));
    }

    match config.validate() {
        Ok(()) => println!("  {}", style::success("All required fields are valid")),
        Err(e) => {
            println!("  {}", style::error(&format!("Validation error: {}", e)));
            anyhow::bail!("configuration validation failed");
        }
    }

    let registry = match SchemaRegistry::load(&config.schema.mapping_file) {
        Ok(registry) => {
            println!(
                "  {}",
                style::success(&format!("Mapping file is valid ({} entities)", registry.len()))
            );
            registry
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Mapping error: {}", e)));
            anyhow::bail!("mapping validation failed");
        }
    };

    println!();
    println!("Configuration summary:");
    println!("  Primary store : {}", config.primary.base_url);
    println!(
        "  Primary token : {}",
        if config.primary.token.is_some() { "set" } else { "NOT SET" }
    );
    println!("  Mirror store  : {}", config.mirror.base_url);
    println!(
        "  Mirror token  : {}",
        if config.mirror.token.is_some() { "set" } else { "NOT SET" }
    );
    println!("  Direction     : {}", config.sync.default_direction);
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!("  Sync order    :");
    for (i, layer) in registry.dependency_layers().iter().enumerate() {
        println!("    {}. {}", i + 1, layer.join(", "));
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
