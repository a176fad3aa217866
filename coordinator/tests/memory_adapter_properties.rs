//! Property tests of the process-local queue and state store.
//!
//! Arbitrary operation sequences are replayed against the adapters and the
//! queue's locking and attempt rules plus the store's generation rules are
//! checked after every step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use coordinator::domain::ports::{GenerationStore, QueueReader, QueueWriter};
use coordinator::domain::{ConfiguredStorages, Generation, JobState, LockId, ReplicationJob};
use coordinator::outbound::memory::{MemoryReplicationQueue, MemoryRepositoryStore};
use mockable::DefaultClock;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tokio::runtime::{Builder, Runtime};

const VS: &str = "default";
const TARGETS: [&str; 2] = ["gitaly-2", "gitaly-3"];
const PATHS: [&str; 3] = ["a.git", "b.git", "@hashed/ab/cd.git"];
const ACKS: [JobState; 3] = [JobState::Completed, JobState::Failed, JobState::Cancelled];

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .build()
        .expect("current-thread runtime")
}

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue { target: usize, path: usize },
    Dequeue { target: usize, count: usize },
    AckInFlight { state: usize, take: usize },
    AckUntouched { state: usize, past_end: u64 },
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => (0..TARGETS.len(), 0..PATHS.len())
            .prop_map(|(target, path)| QueueOp::Enqueue { target, path }),
        2 => (0..TARGETS.len(), 1..4usize)
            .prop_map(|(target, count)| QueueOp::Dequeue { target, count }),
        2 => (0..ACKS.len(), 0..4usize).prop_map(|(state, take)| QueueOp::AckInFlight { state, take }),
        1 => (0..ACKS.len(), 0..4u64)
            .prop_map(|(state, past_end)| QueueOp::AckUntouched { state, past_end }),
    ]
}

/// What the test has observed of the queue so far.
#[derive(Default)]
struct Observed {
    enqueued: u64,
    dequeued: BTreeSet<u64>,
    in_flight: Vec<u64>,
    attempts: BTreeMap<u64, u32>,
}

async fn apply(
    queue: &MemoryReplicationQueue,
    observed: &mut Observed,
    op: QueueOp,
) -> Result<(), TestCaseError> {
    match op {
        QueueOp::Enqueue { target, path } => {
            let job = ReplicationJob::update(VS, PATHS[path], "gitaly-1", TARGETS[target]);
            let event = queue.enqueue(job).await.expect("enqueue");
            observed.enqueued = event.id;
        }
        QueueOp::Dequeue { target, count } => {
            let events = queue
                .dequeue(VS, TARGETS[target], count)
                .await
                .expect("dequeue");
            prop_assert!(events.len() <= count);
            for event in events {
                prop_assert_eq!(event.state, JobState::InProgress);
                observed.dequeued.insert(event.id);
                observed.in_flight.push(event.id);
            }
        }
        QueueOp::AckInFlight { state, take } => {
            let take = take.min(observed.in_flight.len());
            let mut ids: Vec<u64> = observed.in_flight.drain(..take).collect();
            let acknowledged = queue.acknowledge(ACKS[state], &ids).await.expect("ack");
            ids.sort_unstable();
            prop_assert_eq!(acknowledged, ids);
        }
        QueueOp::AckUntouched { state, past_end } => {
            let mut ids: Vec<u64> = (1..=observed.enqueued)
                .filter(|id| !observed.dequeued.contains(id))
                .collect();
            ids.push(observed.enqueued + 1 + past_end);
            let acknowledged = queue.acknowledge(ACKS[state], &ids).await.expect("ack");
            prop_assert!(acknowledged.is_empty(), "acknowledged {acknowledged:?}");
        }
    }
    Ok(())
}

fn check_events(
    queue: &MemoryReplicationQueue,
    observed: &mut Observed,
) -> Result<(), TestCaseError> {
    let mut in_progress: BTreeMap<LockId, usize> = BTreeMap::new();
    for id in 1..=observed.enqueued {
        let event = queue.event(id).expect("snapshot").expect("stored event");
        if event.state == JobState::InProgress {
            *in_progress.entry(event.lock_id.clone()).or_default() += 1;
        }
        if let Some(previous) = observed.attempts.insert(id, event.attempt) {
            prop_assert!(
                event.attempt <= previous,
                "event {id} went from {previous} to {} attempts",
                event.attempt
            );
        }
    }
    for (lock_id, count) in in_progress {
        prop_assert!(count <= 1, "{} holds {count} in-progress events", lock_id.as_str());
        prop_assert!(queue.is_locked(&lock_id).expect("lock snapshot"));
    }
    Ok(())
}

proptest! {
    #[test]
    fn queue_keeps_one_event_in_flight_per_lock(
        ops in proptest::collection::vec(queue_op(), 1..60),
    ) {
        let queue = MemoryReplicationQueue::new(Arc::new(DefaultClock));
        let mut observed = Observed::default();
        runtime().block_on(async {
            for op in ops {
                apply(&queue, &mut observed, op).await?;
                check_events(&queue, &mut observed)?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[derive(Debug, Clone)]
enum StoreOp {
    Set { storage: usize, generation: u64 },
    Increment { primary: usize, with_secondary: bool },
}

/// Storages written by the sequence; `gitaly-3` only reads the final state.
const WRITERS: [&str; 2] = ["gitaly-1", "gitaly-2"];

fn store_op() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        (0..WRITERS.len(), 0..20u64)
            .prop_map(|(storage, generation)| StoreOp::Set { storage, generation }),
        (0..WRITERS.len(), any::<bool>())
            .prop_map(|(primary, with_secondary)| StoreOp::Increment { primary, with_secondary }),
    ]
}

fn next_generation(current: Option<u64>) -> u64 {
    current.map_or(0, |generation| generation + 1)
}

proptest! {
    #[test]
    fn repository_generation_is_a_running_maximum(
        ops in proptest::collection::vec(store_op(), 1..40),
    ) {
        let store = MemoryRepositoryStore::new(
            ConfiguredStorages::new([(
                VS,
                vec!["gitaly-1".to_owned(), "gitaly-2".to_owned(), "gitaly-3".to_owned()],
            )]),
            Arc::new(DefaultClock),
        );
        runtime().block_on(async {
            let mut highest: Option<u64> = None;
            for op in ops {
                match op {
                    StoreOp::Set { storage, generation } => {
                        store
                            .set_generation(VS, "p.git", WRITERS[storage], Generation::new(generation))
                            .await
                            .expect("set generation");
                        highest = Some(highest.map_or(generation, |current| current.max(generation)));
                    }
                    StoreOp::Increment { primary, with_secondary } => {
                        let secondaries: Vec<String> = if with_secondary {
                            vec![WRITERS[1 - primary].to_owned()]
                        } else {
                            Vec::new()
                        };
                        store
                            .increment_generation(VS, "p.git", WRITERS[primary], &secondaries)
                            .await
                            .expect("increment");
                        let expected = next_generation(highest);
                        highest = Some(expected);

                        let primary_generation = store
                            .get_generation(VS, "p.git", WRITERS[primary])
                            .await
                            .expect("primary generation");
                        prop_assert_eq!(primary_generation, Generation::new(expected));
                    }
                }
            }

            store
                .increment_generation(VS, "p.git", "gitaly-3", &[])
                .await
                .expect("final increment");
            let reader = store
                .get_generation(VS, "p.git", "gitaly-3")
                .await
                .expect("reader generation");
            prop_assert_eq!(reader, Generation::new(next_generation(highest)));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
