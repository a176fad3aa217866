//! Consistency check between a reference storage and a target storage.
//!
//! Three stages run concurrently, joined by bounded channels:
//!
//! 1. the walker streams repository paths from the reference storage;
//! 2. the checksummer asks both storages for each path's checksum;
//! 3. the reconciler reports every path and enqueues an update job for each
//!    divergent one.
//!
//! The first stage error aborts the whole check. Responses already sent stay
//! with the caller.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::ReplicationJob;
use crate::domain::ports::{
    BackendError, ChecksumSource, PrimaryGetter, QueueWriter, ReplicationQueueError,
    RepositoryStoreError, RepositoryWalker, define_port_error,
};

/// Capacity of the channels between stages.
const STAGE_BUFFER: usize = 32;

define_port_error! {
    /// Errors raised by a consistency check.
    pub enum ConsistencyCheckError {
        /// The request is malformed.
        InvalidArgument { message: String } => "invalid consistency check: {message}",
        /// The state store could not resolve the reference storage.
        Store { message: String } <- RepositoryStoreError =>
            "consistency check state lookup failed: {message}",
        /// A reconciliation job could not be enqueued.
        Queue { message: String } <- ReplicationQueueError =>
            "consistency check enqueue failed: {message}",
        /// A storage node failed.
        Backend { message: String } <- BackendError =>
            "consistency check backend failed: {message}",
        /// The response receiver went away.
        Cancelled => "consistency check cancelled",
    }
}

/// Parameters of one consistency check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyCheckRequest {
    /// Virtual storage to check.
    pub virtual_storage: String,
    /// Storage compared against the reference.
    pub target_storage: String,
    /// Storage holding the expected state; empty selects the current primary.
    pub reference_storage: String,
    /// Report divergences without enqueueing jobs.
    pub disable_reconcile: bool,
}

/// Outcome for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyCheckResponse {
    /// Repository path.
    pub relative_path: String,
    /// Checksum on the reference storage.
    pub reference_checksum: String,
    /// Checksum on the target storage; empty when the repository is absent.
    pub target_checksum: String,
    /// Id of the replication event enqueued to repair the target.
    pub repl_job_id: Option<u64>,
    /// Storage used as reference.
    pub reference_storage: String,
    /// Storage checked.
    pub target_storage: String,
}

impl ConsistencyCheckResponse {
    /// Whether the two copies differ.
    pub fn is_divergent(&self) -> bool {
        self.reference_checksum != self.target_checksum
    }
}

#[derive(Debug, Clone)]
struct CheckPlan {
    virtual_storage: String,
    reference: String,
    target: String,
    reconcile: bool,
}

#[derive(Debug)]
struct Checksums {
    relative_path: String,
    reference: String,
    target: String,
}

/// Consistency check service.
pub struct ConsistencyChecker<W, C, Q, P> {
    walker: Arc<W>,
    checksums: Arc<C>,
    queue: Arc<Q>,
    primaries: Arc<P>,
}

impl<W, C, Q, P> ConsistencyChecker<W, C, Q, P> {
    /// Create a checker over the given collaborators.
    pub fn new(walker: Arc<W>, checksums: Arc<C>, queue: Arc<Q>, primaries: Arc<P>) -> Self {
        Self {
            walker,
            checksums,
            queue,
            primaries,
        }
    }
}

impl<W, C, Q, P> ConsistencyChecker<W, C, Q, P>
where
    W: RepositoryWalker,
    C: ChecksumSource,
    Q: QueueWriter,
    P: PrimaryGetter,
{
    /// Run a check, streaming one response per reference repository.
    pub async fn check(
        &self,
        request: ConsistencyCheckRequest,
        responses: mpsc::Sender<ConsistencyCheckResponse>,
    ) -> Result<(), ConsistencyCheckError> {
        let plan = self.plan(request).await?;
        info!(
            virtual_storage = %plan.virtual_storage,
            reference = %plan.reference,
            target = %plan.target,
            reconcile = plan.reconcile,
            "consistency check started"
        );

        let (path_tx, path_rx) = mpsc::channel(STAGE_BUFFER);
        let (checksum_tx, checksum_rx) = mpsc::channel(STAGE_BUFFER);
        let (_, _, reported) = tokio::try_join!(
            self.walk(&plan, path_tx),
            self.checksum(&plan, path_rx, checksum_tx),
            self.reconcile(&plan, checksum_rx, responses),
        )?;

        info!(
            virtual_storage = %plan.virtual_storage,
            target = %plan.target,
            repositories = reported,
            "consistency check finished"
        );
        Ok(())
    }

    async fn plan(&self, request: ConsistencyCheckRequest) -> Result<CheckPlan, ConsistencyCheckError> {
        if request.virtual_storage.is_empty() {
            return Err(ConsistencyCheckError::invalid_argument(
                "virtual storage is required",
            ));
        }
        if request.target_storage.is_empty() {
            return Err(ConsistencyCheckError::invalid_argument(
                "target storage is required",
            ));
        }

        let reference = if request.reference_storage.is_empty() {
            self.primaries
                .get_primary(&request.virtual_storage)
                .await?
                .ok_or_else(|| {
                    ConsistencyCheckError::invalid_argument(format!(
                        "virtual storage {} has no primary; name a reference storage",
                        request.virtual_storage
                    ))
                })?
        } else {
            request.reference_storage
        };

        if reference == request.target_storage {
            return Err(ConsistencyCheckError::invalid_argument(format!(
                "target storage {} is the reference storage",
                request.target_storage
            )));
        }

        Ok(CheckPlan {
            virtual_storage: request.virtual_storage,
            reference,
            target: request.target_storage,
            reconcile: !request.disable_reconcile,
        })
    }

    async fn walk(
        &self,
        plan: &CheckPlan,
        paths: mpsc::Sender<String>,
    ) -> Result<(), ConsistencyCheckError> {
        let mut stream = self
            .walker
            .walk_repos(&plan.virtual_storage, &plan.reference)
            .await?;
        while let Some(path) = stream.next().await {
            if paths.send(path?).await.is_err() {
                // Downstream stopped; its error is reported by its own stage.
                break;
            }
        }
        Ok(())
    }

    async fn checksum(
        &self,
        plan: &CheckPlan,
        mut paths: mpsc::Receiver<String>,
        checksums: mpsc::Sender<Checksums>,
    ) -> Result<(), ConsistencyCheckError> {
        while let Some(relative_path) = paths.recv().await {
            let (reference, target) = tokio::try_join!(
                self.checksums
                    .checksum(&plan.virtual_storage, &plan.reference, &relative_path),
                self.target_checksum(plan, &relative_path),
            )?;
            let computed = Checksums {
                relative_path,
                reference,
                target,
            };
            if checksums.send(computed).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn target_checksum(
        &self,
        plan: &CheckPlan,
        relative_path: &str,
    ) -> Result<String, BackendError> {
        match self
            .checksums
            .checksum(&plan.virtual_storage, &plan.target, relative_path)
            .await
        {
            Err(err) if err.is_not_found() => Ok(String::new()),
            other => other,
        }
    }

    async fn reconcile(
        &self,
        plan: &CheckPlan,
        mut checksums: mpsc::Receiver<Checksums>,
        responses: mpsc::Sender<ConsistencyCheckResponse>,
    ) -> Result<usize, ConsistencyCheckError> {
        let mut reported = 0;
        while let Some(computed) = checksums.recv().await {
            let mut response = ConsistencyCheckResponse {
                relative_path: computed.relative_path,
                reference_checksum: computed.reference,
                target_checksum: computed.target,
                repl_job_id: None,
                reference_storage: plan.reference.clone(),
                target_storage: plan.target.clone(),
            };

            if plan.reconcile && response.is_divergent() {
                let job = ReplicationJob::update(
                    plan.virtual_storage.as_str(),
                    response.relative_path.as_str(),
                    plan.reference.as_str(),
                    plan.target.as_str(),
                );
                let event = self.queue.enqueue(job).await?;
                debug!(
                    relative_path = %response.relative_path,
                    event_id = event.id,
                    "reconciliation job enqueued"
                );
                response.repl_job_id = Some(event.id);
            }

            responses
                .send(response)
                .await
                .map_err(|_| ConsistencyCheckError::cancelled())?;
            reported += 1;
        }
        Ok(reported)
    }
}

#[cfg(test)]
mod tests;
