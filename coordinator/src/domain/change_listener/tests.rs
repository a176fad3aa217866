//! Behaviour of the change listener against a scripted connector.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rstest::rstest;
use tokio::sync::mpsc;

use super::*;

type Delivery = Result<Notification, NotificationError>;

/// Connection fed by a test-held sender.
struct ScriptedConnection {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    ping_result: Result<(), NotificationError>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl NotificationConnection for ScriptedConnection {
    async fn recv(&mut self) -> Result<Notification, NotificationError> {
        match self.deliveries.recv().await {
            Some(delivery) => delivery,
            None => std::future::pending().await,
        }
    }

    async fn ping(&mut self) -> Result<(), NotificationError> {
        self.ping_result.clone()
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedConnector {
    attempts: Mutex<VecDeque<Result<ScriptedConnection, NotificationError>>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn push(&self, attempt: Result<ScriptedConnection, NotificationError>) {
        self.attempts.lock().expect("attempts lock").push_back(attempt);
    }
}

#[async_trait]
impl NotificationConnector for ScriptedConnector {
    async fn connect(
        &self,
        _channels: &[String],
    ) -> Result<Box<dyn NotificationConnection>, NotificationError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.attempts.lock().expect("attempts lock").pop_front();
        match next {
            Some(Ok(connection)) => Ok(Box::new(connection)),
            Some(Err(err)) => Err(err),
            None => Err(NotificationError::connection("no scripted connection left")),
        }
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }
}

impl ListenerHandler for RecordingHandler {
    fn notification(&self, notification: &Notification) {
        self.events
            .lock()
            .expect("events lock")
            .push(format!("{}:{}", notification.channel, notification.payload));
    }

    fn disconnect(&self, _error: &NotificationError) {
        self.events.lock().expect("events lock").push("disconnect".to_owned());
    }

    fn connected(&self) {
        self.events.lock().expect("events lock").push("connected".to_owned());
    }
}

fn connection(
    ping_result: Result<(), NotificationError>,
) -> (ScriptedConnection, mpsc::UnboundedSender<Delivery>, Arc<AtomicUsize>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicUsize::new(0));
    (
        ScriptedConnection {
            deliveries: rx,
            ping_result,
            closed: Arc::clone(&closed),
        },
        tx,
        closed,
    )
}

fn notification(payload: &str) -> Notification {
    Notification {
        channel: "repositories_updates".to_owned(),
        payload: payload.to_owned(),
    }
}

fn channels() -> Vec<String> {
    vec!["repositories_updates".to_owned()]
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[rstest]
#[case(Vec::new(), ListenerError::no_channels())]
#[case(
    vec!["a".to_owned(), "b".to_owned(), "a".to_owned()],
    ListenerError::duplicate_channel("a")
)]
#[tokio::test]
async fn invalid_channels_are_rejected_before_connecting(
    #[case] channels: Vec<String>,
    #[case] expected: ListenerError,
) {
    let connector = Arc::new(ScriptedConnector::default());
    let handler = Arc::new(RecordingHandler::default());

    let result = ChangeListener::start(
        Arc::clone(&connector),
        channels,
        handler,
        ListenerConfig::default(),
    )
    .await;

    assert_eq!(result.err(), Some(expected));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn initial_connect_error_is_surfaced() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.push(Err(NotificationError::connection("refused")));
    let handler = Arc::new(RecordingHandler::default());

    let result = ChangeListener::start(
        connector,
        channels(),
        handler.clone(),
        ListenerConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ListenerError::InitialConnect { .. })));
    assert!(handler.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_the_handler_and_close_runs_once() {
    let connector = Arc::new(ScriptedConnector::default());
    let (conn, tx, closed) = connection(Ok(()));
    connector.push(Ok(conn));
    let handler = Arc::new(RecordingHandler::default());

    let listener = ChangeListener::start(
        connector,
        channels(),
        handler.clone(),
        ListenerConfig::default(),
    )
    .await
    .expect("listener starts");

    tx.send(Ok(notification("[]"))).expect("send notification");
    settle().await;
    time::advance(Duration::from_secs(25)).await;
    settle().await;
    listener.close().await;

    assert_eq!(
        handler.events(),
        vec!["connected".to_owned(), "repositories_updates:[]".to_owned()]
    );
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_is_reported_and_reestablished_with_backoff() {
    let connector = Arc::new(ScriptedConnector::default());
    let (first, first_tx, first_closed) = connection(Ok(()));
    let (second, second_tx, second_closed) = connection(Ok(()));
    connector.push(Ok(first));
    connector.push(Err(NotificationError::connection("still down")));
    connector.push(Ok(second));
    let handler = Arc::new(RecordingHandler::default());
    let config = ListenerConfig {
        ping_period: Duration::from_secs(60),
        min_reconnect: Duration::from_secs(5),
        max_reconnect: Duration::from_secs(40),
    };

    let listener = ChangeListener::start(Arc::clone(&connector), channels(), handler.clone(), config)
        .await
        .expect("listener starts");

    first_tx
        .send(Err(NotificationError::connection("reset by peer")))
        .expect("send failure");
    settle().await;
    assert_eq!(handler.events(), vec!["connected".to_owned(), "disconnect".to_owned()]);
    assert_eq!(first_closed.load(Ordering::SeqCst), 1);

    time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    time::advance(Duration::from_secs(9)).await;
    settle().await;
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

    second_tx.send(Ok(notification("after"))).expect("send notification");
    settle().await;
    listener.close().await;

    assert_eq!(
        handler.events(),
        vec![
            "connected".to_owned(),
            "disconnect".to_owned(),
            "connected".to_owned(),
            "repositories_updates:after".to_owned(),
        ]
    );
    assert_eq!(second_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_ping_triggers_reconnect() {
    let connector = Arc::new(ScriptedConnector::default());
    let (first, _first_tx, first_closed) = connection(Err(NotificationError::protocol("no pong")));
    let (second, _second_tx, _second_closed) = connection(Ok(()));
    connector.push(Ok(first));
    connector.push(Ok(second));
    let handler = Arc::new(RecordingHandler::default());

    let listener = ChangeListener::start(
        Arc::clone(&connector),
        channels(),
        handler.clone(),
        ListenerConfig::default(),
    )
    .await
    .expect("listener starts");
    settle().await;

    time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(first_closed.load(Ordering::SeqCst), 1);

    time::advance(Duration::from_secs(5)).await;
    settle().await;
    listener.close().await;

    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        handler.events(),
        vec![
            "connected".to_owned(),
            "disconnect".to_owned(),
            "connected".to_owned(),
        ]
    );
}

#[rstest]
#[case(Duration::from_secs(5), Duration::from_secs(10))]
#[case(Duration::from_secs(30), Duration::from_secs(40))]
#[case(Duration::from_secs(40), Duration::from_secs(40))]
fn reconnect_delay_doubles_up_to_the_maximum(#[case] current: Duration, #[case] next: Duration) {
    assert_eq!(next_reconnect_delay(current, Duration::from_secs(40)), next);
}
