//! Consistency check validation and reconciliation behaviour.

use chrono::Utc;
use futures_util::stream;
use rstest::rstest;

use super::*;
use crate::domain::ports::{
    MockChecksumSource, MockPrimaryGetter, MockQueueWriter, MockRepositoryWalker,
    RepositoryStoreError,
};
use crate::domain::{JobState, ReplicationEvent};

type TestChecker =
    ConsistencyChecker<MockRepositoryWalker, MockChecksumSource, MockQueueWriter, MockPrimaryGetter>;

fn walker(paths: &'static [&'static str]) -> MockRepositoryWalker {
    let mut walker = MockRepositoryWalker::new();
    walker
        .expect_walk_repos()
        .withf(|vs, storage| vs == "default" && storage == "gitaly-1")
        .returning(move |_, _| {
            Ok(stream::iter(paths.iter().map(|path| Ok((*path).to_owned()))).boxed())
        });
    walker
}

/// Reference holds r1 and r2; the target holds an identical r1 only.
fn checksums() -> MockChecksumSource {
    let mut checksums = MockChecksumSource::new();
    checksums
        .expect_checksum()
        .returning(|_, storage, path| match (storage, path) {
            (_, "r1") => Ok("aaaa".to_owned()),
            ("gitaly-1", "r2") => Ok("bbbb".to_owned()),
            (storage, path) => Err(BackendError::not_found(storage, path)),
        });
    checksums
}

fn recording_queue() -> MockQueueWriter {
    let mut queue = MockQueueWriter::new();
    queue.expect_enqueue().times(1).returning(|job| {
        Ok(ReplicationEvent {
            id: 42,
            state: JobState::Ready,
            attempt: 3,
            lock_id: job.lock_id(),
            created_at: Utc::now(),
            updated_at: None,
            job,
        })
    });
    queue
}

fn checker(
    walker: MockRepositoryWalker,
    checksums: MockChecksumSource,
    queue: MockQueueWriter,
    primaries: MockPrimaryGetter,
) -> TestChecker {
    ConsistencyChecker::new(
        Arc::new(walker),
        Arc::new(checksums),
        Arc::new(queue),
        Arc::new(primaries),
    )
}

fn request(reference: &str) -> ConsistencyCheckRequest {
    ConsistencyCheckRequest {
        virtual_storage: "default".to_owned(),
        target_storage: "gitaly-2".to_owned(),
        reference_storage: reference.to_owned(),
        disable_reconcile: false,
    }
}

async fn collect(
    checker: &TestChecker,
    request: ConsistencyCheckRequest,
) -> (Result<(), ConsistencyCheckError>, Vec<ConsistencyCheckResponse>) {
    let (tx, mut rx) = mpsc::channel(8);
    let result = checker.check(request, tx).await;
    let mut responses = Vec::new();
    while let Some(response) = rx.recv().await {
        responses.push(response);
    }
    (result, responses)
}

#[tokio::test]
async fn divergent_repository_is_reconciled() {
    let checker = checker(
        walker(&["r1", "r2"]),
        checksums(),
        recording_queue(),
        MockPrimaryGetter::new(),
    );

    let (result, responses) = collect(&checker, request("gitaly-1")).await;

    result.expect("check succeeds");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].relative_path, "r1");
    assert_eq!(responses[0].repl_job_id, None);
    assert_eq!(responses[1].relative_path, "r2");
    assert_eq!(responses[1].target_checksum, "");
    assert_eq!(responses[1].repl_job_id, Some(42));
}

#[tokio::test]
async fn reference_defaults_to_primary() {
    let mut primaries = MockPrimaryGetter::new();
    primaries
        .expect_get_primary()
        .returning(|_| Ok(Some("gitaly-1".to_owned())));
    let checker = checker(walker(&["r1"]), checksums(), MockQueueWriter::new(), primaries);

    let (result, responses) = collect(&checker, request("")).await;

    result.expect("check succeeds");
    assert_eq!(responses[0].reference_storage, "gitaly-1");
}

#[tokio::test]
async fn disabled_reconcile_only_reports() {
    let checker = checker(
        walker(&["r1", "r2"]),
        checksums(),
        MockQueueWriter::new(),
        MockPrimaryGetter::new(),
    );
    let mut request = request("gitaly-1");
    request.disable_reconcile = true;

    let (result, responses) = collect(&checker, request).await;

    result.expect("check succeeds");
    assert!(responses[1].is_divergent());
    assert_eq!(responses[1].repl_job_id, None);
}

#[rstest]
#[case("", "gitaly-2", "gitaly-1")]
#[case("default", "", "gitaly-1")]
#[case("default", "gitaly-2", "gitaly-2")]
#[tokio::test]
async fn invalid_requests_are_rejected(
    #[case] virtual_storage: &str,
    #[case] target: &str,
    #[case] reference: &str,
) {
    let checker = checker(
        MockRepositoryWalker::new(),
        MockChecksumSource::new(),
        MockQueueWriter::new(),
        MockPrimaryGetter::new(),
    );
    let request = ConsistencyCheckRequest {
        virtual_storage: virtual_storage.to_owned(),
        target_storage: target.to_owned(),
        reference_storage: reference.to_owned(),
        disable_reconcile: false,
    };

    let (result, responses) = collect(&checker, request).await;

    assert!(matches!(
        result,
        Err(ConsistencyCheckError::InvalidArgument { .. })
    ));
    assert!(responses.is_empty());
}

#[tokio::test]
async fn primary_as_target_is_rejected() {
    let mut primaries = MockPrimaryGetter::new();
    primaries
        .expect_get_primary()
        .returning(|_| Ok(Some("gitaly-2".to_owned())));
    let checker = checker(
        MockRepositoryWalker::new(),
        MockChecksumSource::new(),
        MockQueueWriter::new(),
        primaries,
    );

    let (result, _) = collect(&checker, request("")).await;

    assert!(matches!(
        result,
        Err(ConsistencyCheckError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn primary_lookup_failure_is_a_store_error() {
    let mut primaries = MockPrimaryGetter::new();
    primaries
        .expect_get_primary()
        .returning(|_| Err(RepositoryStoreError::connection("db down")));
    let checker = checker(
        MockRepositoryWalker::new(),
        MockChecksumSource::new(),
        MockQueueWriter::new(),
        primaries,
    );

    let (result, _) = collect(&checker, request("")).await;

    assert!(matches!(result, Err(ConsistencyCheckError::Store { .. })));
}

#[tokio::test]
async fn reference_checksum_failure_aborts_the_check() {
    let mut checksums = MockChecksumSource::new();
    checksums
        .expect_checksum()
        .returning(|_, storage, _| Err(BackendError::rpc(storage, "disk full")));
    let checker = checker(
        walker(&["r1", "r2"]),
        checksums,
        MockQueueWriter::new(),
        MockPrimaryGetter::new(),
    );

    let (result, responses) = collect(&checker, request("gitaly-1")).await;

    assert!(matches!(result, Err(ConsistencyCheckError::Backend { .. })));
    assert!(responses.is_empty());
}

#[tokio::test]
async fn dropped_receiver_cancels_the_check() {
    let checker = checker(
        walker(&["r1"]),
        checksums(),
        MockQueueWriter::new(),
        MockPrimaryGetter::new(),
    );
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let result = checker.check(request("gitaly-1"), tx).await;

    assert_eq!(result, Err(ConsistencyCheckError::cancelled()));
}
