//! Operator command line.
//!
//! Every subcommand reads its connection and topology settings from
//! [`CoordinatorSettings`]; `--database-url` overrides the configured URL.
//! Command output goes to stdout, logs go to stderr.

mod commands;
pub mod config;
mod serve;

use std::io::Write;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use mockable::DefaultClock;
use thiserror::Error;

use crate::domain::ports::RepositoryStoreError;
use crate::domain::{
    ConsistencyCheckError, ConsistencyCheckRequest, ConsistencyChecker, ListenerError,
};
use crate::outbound::persistence::{
    DbPool, DieselReplicationQueue, DieselRepositoryStore, PoolConfig, PoolError, SchemaError,
};

pub use self::config::{CoordinatorSettings, SettingsError, Topology, TopologyError};

/// Exit status for a successful command.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status for a failed command.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for malformed arguments.
pub const EXIT_USAGE: u8 = 2;
/// Exit status when interrupted by SIGINT.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Errors surfaced by coordinator commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] RepositoryStoreError),
    #[error(transparent)]
    ConsistencyCheck(#[from] ConsistencyCheckError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("{failed} of {total} storage nodes failed the health check")]
    UnhealthyNodes { failed: usize, total: usize },
    #[error("unknown virtual storage {virtual_storage}")]
    UnknownVirtualStorage { virtual_storage: String },
    #[error("metrics export failed: {message}")]
    Metrics { message: String },
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
    #[error("failed to wait for the shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
    #[error("HTTP server failed: {0}")]
    Http(#[source] std::io::Error),
}

/// Replicated repository coordinator.
#[derive(Debug, Parser)]
#[command(name = "coordinator", version, about)]
pub struct Cli {
    /// Database connection URL; overrides `COORDINATOR_DATABASE_URL`.
    #[arg(long = "database-url", value_name = "url", global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Operator subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check the database answers and runs a supported version.
    SqlPing,
    /// Apply pending schema migrations.
    SqlMigrate,
    /// Roll back the most recent migrations; dry run unless forced.
    SqlMigrateDown(MigrateDownArgs),
    /// Show applied and pending migrations.
    SqlMigrateStatus,
    /// Health-check every configured storage node.
    DialNodes,
    /// Compare a storage against a reference and repair divergences.
    Reconcile(ReconcileArgs),
    /// Report repositories with outdated copies.
    Dataloss(DatalossArgs),
    /// Make one storage's copy authoritative, accepting data loss elsewhere.
    AcceptDataloss(AcceptDatalossArgs),
    /// Allow writes on a virtual storage after a failover.
    EnableWrites(VirtualStorageArgs),
    /// Set how many storages should host a repository.
    SetReplicationFactor(ReplicationFactorArgs),
    /// Run the control plane: import, change listener, stale job reclaim,
    /// read routing and metrics over HTTP.
    Serve,
    /// Print Prometheus metrics.
    #[cfg(feature = "metrics")]
    Metrics,
}

#[derive(Debug, Args)]
pub struct MigrateDownArgs {
    /// Number of migrations to roll back.
    #[arg(value_name = "N")]
    pub count: usize,
    /// Roll back instead of printing what would be rolled back.
    #[arg(short = 'f', long = "force")]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Virtual storage to check.
    #[arg(long = "virtual", value_name = "name")]
    pub virtual_storage: String,
    /// Storage to compare and repair.
    #[arg(long = "target", value_name = "storage")]
    pub target: String,
    /// Storage holding the expected state; defaults to the primary.
    #[arg(long = "reference", value_name = "storage")]
    pub reference: Option<String>,
}

#[derive(Debug, Args)]
pub struct DatalossArgs {
    /// Only report this virtual storage.
    #[arg(long = "virtual-storage", value_name = "name")]
    pub virtual_storage: Option<String>,
    /// Include writable repositories with outdated secondaries.
    #[arg(long = "partially-replicated")]
    pub partially_replicated: bool,
}

#[derive(Debug, Args)]
pub struct AcceptDatalossArgs {
    #[arg(long = "virtual-storage", value_name = "name")]
    pub virtual_storage: String,
    /// Repository relative path.
    #[arg(long = "repository", value_name = "path")]
    pub repository: String,
    /// Storage whose copy becomes the latest.
    #[arg(long = "authoritative-storage", value_name = "storage")]
    pub authoritative_storage: String,
}

#[derive(Debug, Args)]
pub struct VirtualStorageArgs {
    #[arg(long = "virtual-storage", value_name = "name")]
    pub virtual_storage: String,
}

#[derive(Debug, Args)]
pub struct ReplicationFactorArgs {
    #[arg(long = "virtual-storage", value_name = "name")]
    pub virtual_storage: String,
    /// Repository relative path.
    #[arg(long = "repository", value_name = "path")]
    pub repository: String,
    /// Desired number of hosting storages, including the primary.
    #[arg(long = "replication-factor", value_name = "n")]
    pub replication_factor: usize,
}

/// Loaded settings plus the command line overrides.
struct Context {
    settings: CoordinatorSettings,
    database_url: Option<String>,
}

impl Context {
    fn database_url(&self) -> Result<String, CliError> {
        Ok(self.settings.database_url(self.database_url.as_deref())?)
    }

    fn topology(&self) -> Result<Topology, CliError> {
        Ok(Topology::load(self.settings.topology_path()?)?)
    }

    async fn pool(&self) -> Result<DbPool, CliError> {
        Ok(DbPool::new(PoolConfig::for_command(self.database_url()?)).await?)
    }

    async fn store(&self, topology: &Topology) -> Result<Arc<DieselRepositoryStore>, CliError> {
        Ok(Arc::new(DieselRepositoryStore::new(
            self.pool().await?,
            topology.configured_storages(),
            Arc::new(DefaultClock),
        )))
    }
}

/// Run `cli`, writing command output to `out`.
pub async fn run(cli: Cli, out: &mut (dyn Write + Send)) -> Result<(), CliError> {
    let context = Context {
        settings: CoordinatorSettings::load()?,
        database_url: cli.database_url,
    };

    match cli.command {
        Command::SqlPing => commands::sql_ping(&context.database_url()?, out).await,
        Command::SqlMigrate => commands::sql_migrate(&context.database_url()?, out).await,
        Command::SqlMigrateDown(args) => {
            commands::sql_migrate_down(&context.database_url()?, args.count, args.force, out).await
        }
        Command::SqlMigrateStatus => {
            commands::sql_migrate_status(&context.database_url()?, out).await
        }
        Command::DialNodes => {
            let topology = context.topology()?;
            commands::dial_nodes(&topology, &topology.filesystem_storages(), out).await
        }
        Command::Reconcile(args) => {
            let topology = context.topology()?;
            let storages = Arc::new(topology.filesystem_storages());
            let checker = ConsistencyChecker::new(
                Arc::clone(&storages),
                storages,
                Arc::new(DieselReplicationQueue::new(context.pool().await?)),
                context.store(&topology).await?,
            );
            let request = ConsistencyCheckRequest {
                virtual_storage: args.virtual_storage,
                target_storage: args.target,
                reference_storage: args.reference.unwrap_or_default(),
                disable_reconcile: false,
            };
            commands::reconcile(&checker, request, out).await
        }
        Command::Dataloss(args) => {
            let topology = context.topology()?;
            let configured = topology.configured_storages();
            let virtual_storages = commands::selected_virtual_storages(
                &configured,
                args.virtual_storage.as_deref(),
            )?;
            let store = context.store(&topology).await?;
            commands::dataloss(
                store.as_ref(),
                &virtual_storages,
                args.partially_replicated,
                context.settings.use_virtual_storage_primary(),
                out,
            )
            .await
        }
        Command::AcceptDataloss(args) => {
            let store = context.store(&context.topology()?).await?;
            commands::accept_dataloss(
                store.as_ref(),
                &args.virtual_storage,
                &args.repository,
                &args.authoritative_storage,
                out,
            )
            .await
        }
        Command::EnableWrites(args) => {
            let store = context.store(&context.topology()?).await?;
            commands::enable_writes(store.as_ref(), &args.virtual_storage, out).await
        }
        Command::SetReplicationFactor(args) => {
            let store = context.store(&context.topology()?).await?;
            commands::set_replication_factor(
                store.as_ref(),
                &args.virtual_storage,
                &args.repository,
                args.replication_factor,
                out,
            )
            .await
        }
        Command::Serve => {
            let topology = context.topology()?;
            serve::serve(&context.settings, &context.database_url()?, &topology).await
        }
        #[cfg(feature = "metrics")]
        Command::Metrics => {
            let topology = context.topology()?;
            let store = context.store(&topology).await?;
            commands::metrics(store, context.settings.use_virtual_storage_primary(), out).await
        }
    }
}
