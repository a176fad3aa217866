//! Handlers behind each operator subcommand.
//!
//! Handlers take the ports they need and a writer, so the same code runs
//! against the PostgreSQL adapters in production and the in-memory adapters
//! in tests.

use std::io::Write;
#[cfg(feature = "metrics")]
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::ports::{
    AssignmentStore, ChecksumSource, GenerationStore, NodeDialer, PrimaryGetter, QueueWriter,
    RepositoryStatusQuery, RepositoryWalker, ShardPrimaryStore,
};
use crate::domain::{
    ConfiguredStorages, ConsistencyCheckRequest, ConsistencyCheckResponse, ConsistencyChecker,
    OutdatedRepository,
};
use crate::outbound::persistence::{
    MigrationStatus, migration_status, ping, revert_migrations, run_migrations,
};

use super::CliError;
use super::config::Topology;

pub(super) async fn sql_ping(database_url: &str, out: &mut dyn Write) -> Result<(), CliError> {
    let version = ping(database_url).await?;
    writeln!(out, "reached database, server_version_num {version}")?;
    Ok(())
}

pub(super) async fn sql_migrate(database_url: &str, out: &mut dyn Write) -> Result<(), CliError> {
    let applied = run_migrations(database_url).await?;
    if applied.is_empty() {
        writeln!(out, "schema is up to date")?;
    }
    for version in &applied {
        writeln!(out, "applied {version}")?;
    }
    Ok(())
}

pub(super) async fn sql_migrate_down(
    database_url: &str,
    count: usize,
    force: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let versions = revert_migrations(database_url, count, force).await?;
    write_revert_report(&versions, force, out)
}

fn write_revert_report(
    versions: &[String],
    force: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if versions.is_empty() {
        writeln!(out, "no applied migrations to roll back")?;
        return Ok(());
    }
    if force {
        for version in versions {
            writeln!(out, "rolled back {version}")?;
        }
        return Ok(());
    }
    writeln!(out, "DRY RUN -- would roll back:")?;
    for version in versions {
        writeln!(out, "  {version}")?;
    }
    writeln!(out, "To roll back these migrations run with -f")?;
    Ok(())
}

pub(super) async fn sql_migrate_status(
    database_url: &str,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let statuses = migration_status(database_url).await?;
    write_migration_status(&statuses, out)
}

fn write_migration_status(
    statuses: &[MigrationStatus],
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let width = statuses
        .iter()
        .map(|status| status.version.len())
        .max()
        .unwrap_or(0)
        .max("MIGRATION".len());
    writeln!(out, "{:<width$}  APPLIED", "MIGRATION")?;
    for status in statuses {
        let applied = if status.applied { "yes" } else { "no" };
        writeln!(out, "{:<width$}  {applied}", status.version)?;
    }
    Ok(())
}

pub(super) async fn dial_nodes<D>(
    topology: &Topology,
    dialer: &D,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    D: NodeDialer + ?Sized,
{
    let mut total = 0;
    let mut failed = 0;
    for (virtual_storage, node) in topology.nodes() {
        total += 1;
        match dialer.dial(virtual_storage, &node.storage).await {
            Ok(()) => writeln!(out, "[{virtual_storage}] {}: ok", node.storage)?,
            Err(err) => {
                failed += 1;
                warn!(
                    virtual_storage,
                    storage = %node.storage,
                    error = %err,
                    "storage node dial failed"
                );
                writeln!(out, "[{virtual_storage}] {}: FAILED: {err}", node.storage)?;
            }
        }
    }
    if failed > 0 {
        return Err(CliError::UnhealthyNodes { failed, total });
    }
    writeln!(out, "all {total} storage nodes are healthy")?;
    Ok(())
}

pub(super) async fn reconcile<W, C, Q, P>(
    checker: &ConsistencyChecker<W, C, Q, P>,
    request: ConsistencyCheckRequest,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    W: RepositoryWalker,
    C: ChecksumSource,
    Q: QueueWriter,
    P: PrimaryGetter,
{
    let virtual_storage = request.virtual_storage.clone();
    let (sender, mut receiver) = mpsc::channel(32);
    let collect = async {
        let mut responses = Vec::new();
        while let Some(response) = receiver.recv().await {
            responses.push(response);
        }
        responses
    };
    let (outcome, responses) = tokio::join!(checker.check(request, sender), collect);

    write_reconcile_report(&virtual_storage, &responses, out)?;
    outcome?;
    Ok(())
}

fn write_reconcile_report(
    virtual_storage: &str,
    responses: &[ConsistencyCheckResponse],
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if let Some(first) = responses.first() {
        writeln!(
            out,
            "Checking consistency of virtual storage {virtual_storage}: target {}, reference {}",
            first.target_storage, first.reference_storage
        )?;
    }
    let mut divergent = 0;
    for response in responses.iter().filter(|response| response.is_divergent()) {
        divergent += 1;
        let target = if response.target_checksum.is_empty() {
            "absent"
        } else {
            response.target_checksum.as_str()
        };
        let job = response
            .repl_job_id
            .map_or_else(|| "none".to_owned(), |id| id.to_string());
        writeln!(
            out,
            "  {}: reference {} target {target} replication job {job}",
            response.relative_path, response.reference_checksum
        )?;
    }
    writeln!(
        out,
        "{} repositories checked, {divergent} divergent",
        responses.len()
    )?;
    Ok(())
}

/// Virtual storages to report on: `filter` when given, otherwise all.
pub(super) fn selected_virtual_storages(
    configured: &ConfiguredStorages,
    filter: Option<&str>,
) -> Result<Vec<String>, CliError> {
    match filter {
        Some(name) => {
            if configured.storages(name).is_err() {
                return Err(CliError::UnknownVirtualStorage {
                    virtual_storage: name.to_owned(),
                });
            }
            Ok(vec![name.to_owned()])
        }
        None => Ok(configured.virtual_storages().map(str::to_owned).collect()),
    }
}

pub(super) async fn dataloss<S>(
    status: &S,
    virtual_storages: &[String],
    include_partially_replicated: bool,
    use_virtual_storage_primary: bool,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    S: RepositoryStatusQuery + ?Sized,
{
    for virtual_storage in virtual_storages {
        let repositories: Vec<OutdatedRepository> = status
            .partially_replicated_repositories(virtual_storage, use_virtual_storage_primary)
            .await?
            .into_iter()
            .filter(|repository| include_partially_replicated || repository.read_only)
            .collect();
        write_dataloss_report(
            virtual_storage,
            &repositories,
            include_partially_replicated,
            out,
        )?;
    }
    Ok(())
}

fn changes(count: u64) -> String {
    if count == 1 {
        "1 change".to_owned()
    } else {
        format!("{count} changes")
    }
}

fn write_dataloss_report(
    virtual_storage: &str,
    repositories: &[OutdatedRepository],
    include_partially_replicated: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    writeln!(out, "Virtual storage: {virtual_storage}")?;
    if repositories.is_empty() {
        let message = if include_partially_replicated {
            "All repositories are fully replicated!"
        } else {
            "All repositories are writable!"
        };
        writeln!(out, "  {message}")?;
        return Ok(());
    }

    writeln!(out, "  Outdated repositories:")?;
    for repository in repositories {
        let mode = if repository.read_only { " (read-only)" } else { "" };
        writeln!(out, "    {}{mode}:", repository.relative_path)?;
        writeln!(
            out,
            "      Primary: {}",
            repository.primary.as_deref().unwrap_or("none")
        )?;
        writeln!(out, "      In Sync Storages:")?;
        for storage in repository.storages.iter().filter(|s| s.behind_by == 0) {
            let host = if storage.assigned { ", assigned host" } else { "" };
            writeln!(out, "        {}{host}", storage.name)?;
        }
        writeln!(out, "      Outdated Storages:")?;
        for storage in repository.storages.iter().filter(|s| s.behind_by > 0) {
            let host = if storage.assigned { ", assigned host" } else { "" };
            writeln!(
                out,
                "        {} is behind by {} or less{host}",
                storage.name,
                changes(storage.behind_by)
            )?;
        }
    }
    Ok(())
}

pub(super) async fn accept_dataloss<S>(
    store: &S,
    virtual_storage: &str,
    relative_path: &str,
    authoritative_storage: &str,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    S: GenerationStore + ?Sized,
{
    store
        .set_authoritative_replica(virtual_storage, relative_path, authoritative_storage)
        .await?;
    writeln!(
        out,
        "{authoritative_storage} is now authoritative for {relative_path} on {virtual_storage}"
    )?;
    Ok(())
}

pub(super) async fn enable_writes<S>(
    store: &S,
    virtual_storage: &str,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    S: ShardPrimaryStore + ?Sized,
{
    store.enable_writes(virtual_storage).await?;
    writeln!(out, "writes enabled on {virtual_storage}")?;
    Ok(())
}

pub(super) async fn set_replication_factor<S>(
    store: &S,
    virtual_storage: &str,
    relative_path: &str,
    factor: usize,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    S: AssignmentStore + ?Sized,
{
    let assigned = store
        .set_replication_factor(virtual_storage, relative_path, factor)
        .await?;
    writeln!(out, "current assignments: {}", assigned.join(", "))?;
    Ok(())
}

#[cfg(feature = "metrics")]
pub(super) async fn metrics(
    status: Arc<dyn RepositoryStatusQuery>,
    use_virtual_storage_primary: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    use crate::outbound::metrics::{ReadOnlyRepositoriesGauge, encode_text};

    let metrics_error = |err: prometheus::Error| CliError::Metrics {
        message: err.to_string(),
    };
    let registry = prometheus::Registry::new();
    let gauge = ReadOnlyRepositoriesGauge::new(&registry, status, use_virtual_storage_primary)
        .map_err(metrics_error)?;
    gauge.refresh().await?;
    write!(out, "{}", encode_text(&registry).map_err(metrics_error)?)?;
    Ok(())
}
