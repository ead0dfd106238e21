use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use walseq_kernel::invariants::InvariantEngine;
use walseq_kernel::log::Txn;
use walseq_kernel::metadata::{read_table_id, SequencerMetadata};
use walseq_kernel::pool::{InMemoryTableRegistry, PoolConfig, SequencerPool};
use walseq_kernel::replay::replay_ledger;
use walseq_kernel::schema::{ColumnType, SchemaChange, TableSchema};
use walseq_kernel::sequencer::{sequencer_dir, META_FILE_NAME, SEQ_DIR};
use walseq_kernel::{SequencerError, SystemClock, TableIdentity};

/// WAL sequencer CLI
#[derive(Parser, Debug)]
#[command(name = "walseq")]
#[command(about = "Inspect and drive WAL table sequencers", long_about = None)]
struct Cli {
    /// Directory holding one sub-directory per table
    #[arg(long, conflicts_with = "config")]
    root: Option<PathBuf>,

    /// Path to pool config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create sequencer files for a new table
    Create {
        name: String,
        #[arg(long)]
        id: i32,
        /// Column as `name:type`, repeatable
        #[arg(long = "column", value_parser = parse_column)]
        columns: Vec<(String, ColumnType)>,
        /// Designated timestamp column, appended last
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Commit a data transaction
    Commit {
        table: String,
        #[arg(long)]
        structure_version: u64,
        #[arg(long)]
        wal_id: u32,
        #[arg(long, default_value_t = 0)]
        segment_id: u32,
        #[arg(long, default_value_t = 0)]
        segment_txn: u64,
    },
    /// Allocate a WAL id
    WalId { table: String },
    /// Commit a structure change
    Alter {
        table: String,
        #[arg(long)]
        structure_version: u64,
        #[command(subcommand)]
        change: AlterCommand,
    },
    /// Append the drop marker
    Drop { table: String },
    Suspend { table: String },
    Resume { table: String },
    /// Print ledger records as JSON lines
    Log {
        table: String,
        #[arg(long, default_value_t = 1)]
        from: Txn,
    },
    /// Print metadata changes as JSON lines
    Changes {
        table: String,
        #[arg(long, default_value_t = 1)]
        from: u64,
    },
    /// Print the reader metadata of a table
    Meta {
        table: String,
        /// Tries while the metadata file is mid-write
        #[arg(long, default_value_t = 16)]
        attempts: u32,
    },
    /// Print id and last txn of every WAL table under root
    Scan,
    /// Check a table's ledger against the ledger invariants
    Verify { table: String },
}

#[derive(Subcommand, Debug)]
enum AlterCommand {
    Add {
        name: String,
        #[arg(value_parser = parse_column_type)]
        column_type: ColumnType,
    },
    Remove {
        name: String,
    },
    Rename {
        name: String,
        new_name: String,
    },
}

#[derive(Debug, Serialize)]
struct TxnOutput<'a> {
    table: &'a str,
    txn: Txn,
}

#[derive(Debug, Serialize)]
struct ScanOutput<'a> {
    table: &'a str,
    table_id: i32,
    last_txn: Txn,
}

fn parse_column_type(s: &str) -> Result<ColumnType, String> {
    ColumnType::parse(s).ok_or_else(|| format!("unknown column type `{s}`"))
}

fn parse_column(s: &str) -> Result<(String, ColumnType), String> {
    let (name, column_type) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:type, got `{s}`"))?;
    Ok((name.to_string(), parse_column_type(column_type)?))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Table directories are named `<name>~<id>`.
fn identity_for(root: &Path, dir_name: &str) -> Result<TableIdentity> {
    let logical_name = dir_name
        .split_once('~')
        .map_or(dir_name, |(name, _)| name);
    let lookup = TableIdentity::new(logical_name, dir_name, 0, true);
    let meta = sequencer_dir(root, &lookup).join(META_FILE_NAME);
    let table_id = read_table_id(&meta)
        .with_context(|| format!("no wal table `{dir_name}` under {}", root.display()))?;
    Ok(TableIdentity::new(logical_name, dir_name, table_id, true))
}

/// Every sub-directory of `root` holding sequencer files.
fn discover_tables(root: &Path) -> Result<InMemoryTableRegistry> {
    let registry = InMemoryTableRegistry::new();
    for dir in fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let dir = dir?;
        if !dir.path().join(SEQ_DIR).is_dir() {
            continue;
        }
        let dir_name = dir.file_name().to_string_lossy().into_owned();
        match identity_for(root, &dir_name) {
            Ok(identity) => registry.register(identity),
            // still scanned, so the pool reports it
            Err(e) => {
                warn!(table = %dir_name, error = %e, "unreadable table id");
                registry.register(TableIdentity::new(dir_name.clone(), dir_name, -1, true))
            }
        }
    }
    Ok(registry)
}

fn load_config(cli: &Cli) -> Result<PoolConfig> {
    match (&cli.config, &cli.root) {
        (Some(path), _) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(serde_json::from_str(&data)?)
        }
        (None, Some(root)) => Ok(PoolConfig::default_config(root)),
        (None, None) => Err(anyhow!("either --root or --config is required")),
    }
}

fn main() -> Result<()> {
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let root = config.root.clone();
    let pool = SequencerPool::new(config, Arc::new(SystemClock));

    let result = run(&pool, &root, cli.command);
    pool.close();
    result
}

fn run(pool: &SequencerPool, root: &Path, command: Command) -> Result<()> {
    match command {
        Command::Create {
            name,
            id,
            columns,
            timestamp,
        } => {
            let mut schema = TableSchema::new();
            for (column, column_type) in columns {
                schema = schema.column(column, column_type);
            }
            if let Some(ts) = timestamp {
                schema = schema.timestamp(ts);
            }
            let identity = TableIdentity::new(&name, format!("{name}~{id}"), id, true);
            if let Err(e) = pool.register_table(id, &schema, &identity) {
                // never drop a table that was already there
                if !matches!(e, SequencerError::AlreadyExists { .. }) {
                    pool.drop_table(&identity, true)?;
                }
                return Err(e.into());
            }
            print_json(&identity)
        }

        Command::Commit {
            table,
            structure_version,
            wal_id,
            segment_id,
            segment_txn,
        } => {
            let identity = identity_for(root, &table)?;
            let txn =
                pool.next_txn(&identity, structure_version, wal_id, segment_id, segment_txn)?;
            print_json(&TxnOutput { table: &table, txn })
        }

        Command::WalId { table } => {
            let identity = identity_for(root, &table)?;
            let wal_id = pool.next_wal_id(&identity)?;
            print_json(&serde_json::json!({ "table": table, "wal_id": wal_id }))
        }

        Command::Alter {
            table,
            structure_version,
            change,
        } => {
            let identity = identity_for(root, &table)?;
            let change = match change {
                AlterCommand::Add { name, column_type } => {
                    SchemaChange::AddColumn { name, column_type }
                }
                AlterCommand::Remove { name } => SchemaChange::RemoveColumn { name },
                AlterCommand::Rename { name, new_name } => {
                    SchemaChange::RenameColumn { name, new_name }
                }
            };
            let txn = pool.next_structure_txn(&identity, structure_version, &change)?;
            print_json(&TxnOutput { table: &table, txn })
        }

        Command::Drop { table } => {
            let identity = identity_for(root, &table)?;
            pool.drop_table(&identity, false)?;
            print_json(&serde_json::json!({ "table": table, "dropped": true }))
        }

        Command::Suspend { table } => {
            let identity = identity_for(root, &table)?;
            pool.suspend_table(&identity)?;
            print_json(&serde_json::json!({ "table": table, "suspended": true }))
        }

        Command::Resume { table } => {
            let identity = identity_for(root, &table)?;
            pool.resume_table(&identity)?;
            print_json(&serde_json::json!({ "table": table, "suspended": false }))
        }

        Command::Log { table, from } => {
            let identity = identity_for(root, &table)?;
            for record in pool.transaction_log_cursor(&identity, from)? {
                print_json(&record?)?;
            }
            Ok(())
        }

        Command::Changes { table, from } => {
            let identity = identity_for(root, &table)?;
            for change in pool.metadata_change_log_cursor(&identity, from)? {
                print_json(&change?)?;
            }
            Ok(())
        }

        Command::Meta { table, attempts } => {
            let identity = identity_for(root, &table)?;
            let path = sequencer_dir(root, &identity).join(META_FILE_NAME);
            let mut metadata = SequencerMetadata::read_committed(&path, attempts)?;
            metadata.set_table_name(identity.logical_name());
            print_json(&metadata.reader_view())
        }

        Command::Scan => {
            let tables = discover_tables(root)?;
            pool.for_all_wal_tables(&tables, |table_id, identity, last_txn| {
                let line = serde_json::to_string(&ScanOutput {
                    table: identity.dir_name(),
                    table_id,
                    last_txn,
                })?;
                println!("{line}");
                Ok(())
            });
            Ok(())
        }

        Command::Verify { table } => {
            let identity = identity_for(root, &table)?;
            let cursor = pool.transaction_log_cursor(&identity, 1)?;
            let summary = replay_ledger(cursor, &InvariantEngine::ledger_rules())?;
            print_json(&summary)
        }
    }
}
