//! End-to-end consumer scenarios over scripted connections and recording
//! stores.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{future, stream};
use parking_lot::Mutex;
use relay_consumer::{
    ByteStream, CheckpointFailurePolicy, CheckpointOptions, Connection, Consumer, ConsumerConfig, ConsumerError, ConsumerState, Event,
    Reply, RetryPolicy, TransportError,
};
use relay_core::checkpoint::CHECKPOINT_KEY;
use relay_core::Checkpoint;
use relay_store::mock::RecordingStore;

type Chunk = Result<Bytes, TransportError>;

/// What the connector hands out on one call.
enum Step {
    Stream(Vec<Chunk>),
    PendingError(TransportError),
    /// A deferred connection that never settles.
    Hang,
}

/// Connector that replays a script and records the resume id of every call.
/// Once the script runs out, every call yields an empty stream.
#[derive(Clone, Default)]
struct ScriptedSource {
    steps: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            calls: Arc::default(),
        }
    }

    fn connector(&self) -> impl Fn(Option<&str>) -> Result<Connection, TransportError> {
        let source = self.clone();
        move |resume_id: Option<&str>| -> Result<Connection, TransportError> {
            source.calls.lock().push(resume_id.map(str::to_string));
            match source.steps.lock().pop_front() {
                Some(Step::Stream(chunks)) => Ok(Connection::ready(stream::iter(chunks))),
                Some(Step::PendingError(e)) => Ok(Connection::pending(async move { Err(e) })),
                Some(Step::Hang) => Ok(Connection::pending(
                    future::pending::<Result<ByteStream, TransportError>>(),
                )),
                None => Ok(Connection::ready(stream::iter(Vec::<Chunk>::new()))),
            }
        }
    }

    fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().clone()
    }
}

fn events(ids: impl IntoIterator<Item = u32>) -> String {
    ids.into_iter()
        .map(|id| format!("id: {id}\nevent: who knows\ndata: {{\"foo\":\"bar\"}}\n\n"))
        .collect()
}

fn chunk(text: impl Into<String>) -> Chunk {
    Ok(Bytes::from(text.into()))
}

fn lost() -> Chunk {
    Err(TransportError::Closed("connection reset".into()))
}

fn fast_config() -> ConsumerConfig {
    let fast = RetryPolicy {
        max_retries: 3,
        min_delay_ms: 10,
        max_delay_ms: 20,
        randomize: false,
    };
    ConsumerConfig {
        handler_retry: fast.clone(),
        reconnect_retry: fast,
        ..ConsumerConfig::default()
    }
}

fn written_ids(store: &RecordingStore) -> Vec<String> {
    store
        .writes()
        .into_iter()
        .map(|(key, value)| {
            assert_eq!(key, CHECKPOINT_KEY);
            Checkpoint::from_json(&value).unwrap().id
        })
        .collect()
}

fn recording_handler(seen: &Arc<Mutex<Vec<Event>>>) -> impl Fn(&Event) -> Reply {
    let sink = seen.clone();
    move |event: &Event| {
        sink.lock().push(event.clone());
        Reply::ack()
    }
}

#[tokio::test]
async fn checkpoint_after_every_event() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..3))])]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(recording_handler(&seen))
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(written_ids(&store), vec!["0", "1", "2"]);
    let events = seen.lock();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.event_type == "who knows"));
    assert_eq!(events[0].json::<serde_json::Value>().unwrap()["foo"], "bar");
}

#[tokio::test]
async fn checkpoint_every_second_event() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..6))])]);

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(2))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(|_: &Event| Reply::ack())
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(written_ids(&store), vec!["1", "3", "5"]);
    assert_eq!(consumer.liveness().checkpoints_written(), 3);
}

#[tokio::test]
async fn default_threshold_is_three() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..7))])]);

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(written_ids(&store), vec!["2", "5"]);
}

#[tokio::test]
async fn checkpoint_callback_runs_after_write() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..2))])]);
    let notified = Arc::new(Mutex::new(Vec::new()));
    let sink = notified.clone();
    let store_view = store.clone();

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1).callback(
            move |cp: &Checkpoint| {
                // The write is already visible when the callback runs
                sink.lock().push((cp.id.clone(), store_view.write_count()));
            },
        ))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(
        *notified.lock(),
        vec![("0".to_string(), 1), ("1".to_string(), 2)]
    );
}

#[tokio::test]
async fn resumes_from_stored_checkpoint() {
    let store = Arc::new(RecordingStore::seeded(
        CHECKPOINT_KEY,
        r#"{"lastProcessed":1700000000000,"id":"7"}"#,
    ));
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(8..9))])]);

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();

    assert_eq!(store.read_count(), 1);
    assert_eq!(source.calls(), vec![Some("7".to_string())]);
    consumer.run().await.unwrap();
}

#[tokio::test]
async fn no_checkpoint_config_means_no_resume_id() {
    let source = ScriptedSource::new(vec![]);
    let mut consumer = Consumer::new();
    consumer.consume(source.connector()).await.unwrap();
    consumer.run().await.unwrap();
    assert_eq!(source.calls(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_last_written_checkpoint_only() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk(events(1..2)), lost()]),
        Step::Stream(vec![chunk(events(1..2))]),
    ]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(3))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(recording_handler(&seen))
        .unwrap();
    consumer.run().await.unwrap();

    // Nothing was written, so the reconnect starts from scratch and "1" is redelivered
    assert_eq!(source.calls(), vec![None, None]);
    let ids: Vec<String> = seen.lock().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["1", "1"]);
    assert!(store.writes().is_empty());
    assert_eq!(consumer.liveness().reconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_passes_written_checkpoint() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk(events(0..2)), lost()]),
        Step::Stream(vec![chunk(events(2..3))]),
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(source.calls(), vec![None, Some("1".to_string())]);
    assert_eq!(written_ids(&store), vec!["0", "1", "2"]);
}

#[tokio::test(start_paused = true)]
async fn event_split_across_chunks_and_connection_drop() {
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk("id: 0\nda"), chunk("ta: whole\n\nid: 1\ndata: half"), lost()]),
        Step::Stream(vec![chunk("id: 1\ndata: again\n\n")]),
    ]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(recording_handler(&seen))
        .unwrap();
    consumer.run().await.unwrap();

    let data: Vec<String> = seen.lock().iter().map(|e| e.data.clone()).collect();
    assert_eq!(data, vec!["whole", "again"]);
}

#[tokio::test(start_paused = true)]
async fn pending_reconnect_failures_are_retried() {
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk(events(0..1)), lost()]),
        Step::PendingError(TransportError::Io("refused".into())),
        Step::PendingError(TransportError::Status {
            status: 503,
            body: "busy".into(),
        }),
        Step::Stream(vec![chunk(events(1..2))]),
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer.consume(source.connector()).await.unwrap();
    consumer.run().await.unwrap();

    assert_eq!(source.calls().len(), 4);
    assert_eq!(consumer.liveness().reconnects(), 3);
    assert_eq!(consumer.liveness().events_handled(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_exhaustion_is_fatal() {
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![lost()]),
        Step::PendingError(TransportError::Io("refused".into())),
        Step::PendingError(TransportError::Io("refused".into())),
        Step::PendingError(TransportError::Io("refused".into())),
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer.consume(source.connector()).await.unwrap();
    let err = consumer.run().await.unwrap_err();

    assert!(matches!(err, ConsumerError::ConnectionFailure { attempts: 3, .. }));
    assert_eq!(source.calls().len(), 4);
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_reconnect_error_is_fatal() {
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![lost()]),
        Step::PendingError(TransportError::Status {
            status: 404,
            body: "gone".into(),
        }),
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer.consume(source.connector()).await.unwrap();
    let err = consumer.run().await.unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::ConnectionLost(TransportError::Status { status: 404, .. })
    ));
    assert_eq!(source.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn store_read_failure_during_reconnect_is_retried() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk(events(0..1)), lost()]),
        Step::Stream(vec![chunk(events(1..2))]),
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    store.fail_reads(1);
    consumer.run().await.unwrap();

    // The failed lookup never reached the connector
    assert_eq!(source.calls(), vec![None, Some("0".to_string())]);
    assert_eq!(store.read_count(), 3);
}

#[tokio::test]
async fn checkpoint_failure_does_not_stop_stream() {
    let store = Arc::new(RecordingStore::new());
    store.fail_writes(1);
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..4))])]);

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(2))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    // "1" failed to write; "2" retried immediately with the newer id
    assert_eq!(written_ids(&store), vec!["2"]);
    let liveness = consumer.liveness();
    assert_eq!(liveness.events_handled(), 4);
    assert_eq!(liveness.checkpoint_failures(), 1);
    assert_eq!(liveness.checkpoints_written(), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_failure_prevents_checkpoint() {
    let store = Arc::new(RecordingStore::new());
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..3))])]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(|event: &Event| Reply::from(event.id != "1"))
        .unwrap();
    let err = consumer.run().await.unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::HandlerFailure { ref event_id, attempts: 4, .. } if event_id == "1"
    ));
    assert_eq!(written_ids(&store), vec!["0"]);
}

#[tokio::test(start_paused = true)]
async fn deferred_handler_replies() {
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..3))])]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();

    let mut consumer = Consumer::new();
    consumer
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(move |event: &Event| {
            let sink = sink.clone();
            let id = event.id.clone();
            Reply::deferred(async move {
                // Later events finish faster; order must still hold
                let wait = 30 - id.parse::<u64>().unwrap_or(0) * 10;
                tokio::time::sleep(Duration::from_millis(wait)).await;
                sink.lock().push(id);
                Ok(true)
            })
        })
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(*order.lock(), vec!["0", "1", "2"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_backoff() {
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..1))])]);
    let config = ConsumerConfig {
        handler_retry: RetryPolicy {
            max_retries: 100,
            min_delay_ms: 60_000,
            max_delay_ms: 60_000,
            randomize: false,
        },
        ..ConsumerConfig::default()
    };

    let mut consumer = Consumer::with_config(config).unwrap();
    consumer
        .consume(source.connector())
        .await
        .unwrap()
        .on_event(|_: &Event| Reply::decline())
        .unwrap();
    let token = consumer.cancellation_token();

    let task = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer.state())
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    token.cancel();

    let (result, state) = task.await.unwrap();
    assert!(matches!(result, Err(ConsumerError::Cancelled)));
    assert_eq!(state, ConsumerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_block_policy_keeps_streaming() {
    let store = Arc::new(RecordingStore::new());
    // Both attempts for "1" fail, then the first attempt for "2"
    store.fail_writes(3);
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..4))])]);
    let policy = CheckpointFailurePolicy::Block {
        retry: RetryPolicy {
            max_retries: 1,
            min_delay_ms: 10,
            max_delay_ms: 10,
            randomize: false,
        },
    };

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(
            CheckpointOptions::new(store.clone())
                .messages(2)
                .on_failure(policy),
        )
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert_eq!(written_ids(&store), vec!["2"]);
    let liveness = consumer.liveness();
    assert_eq!(liveness.events_handled(), 4);
    assert_eq!(liveness.checkpoint_failures(), 1);
    assert_eq!(liveness.checkpoints_written(), 1);
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_stalled_reconnect() {
    let source = ScriptedSource::new(vec![
        Step::Stream(vec![chunk(events(0..1)), lost()]),
        Step::Hang,
    ]);

    let mut consumer = Consumer::with_config(fast_config()).unwrap();
    consumer.consume(source.connector()).await.unwrap();
    let token = consumer.cancellation_token();

    let task = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer.state())
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let (result, state) = tokio::time::timeout(Duration::from_secs(3600), task)
        .await
        .expect("cancellation should end run")
        .unwrap();
    assert!(matches!(result, Err(ConsumerError::Cancelled)));
    assert_eq!(state, ConsumerState::Closed);
    assert_eq!(source.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_stalled_checkpoint_write() {
    let store = Arc::new(RecordingStore::new());
    store.stall_writes(true);
    let source = ScriptedSource::new(vec![Step::Stream(vec![chunk(events(0..2))])]);

    let mut consumer = Consumer::new();
    consumer
        .checkpoint(CheckpointOptions::new(store.clone()).messages(1))
        .unwrap()
        .consume(source.connector())
        .await
        .unwrap();
    let token = consumer.cancellation_token();
    let liveness = consumer.liveness();

    let task = tokio::spawn(async move { consumer.run().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(3600), task)
        .await
        .expect("cancellation should end run")
        .unwrap();
    assert!(matches!(result, Err(ConsumerError::Cancelled)));
    assert_eq!(store.write_count(), 0);
    assert_eq!(liveness.events_handled(), 1);
    assert_eq!(liveness.state(), ConsumerState::Closed);
}
