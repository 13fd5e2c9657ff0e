//! Worker pool that drains the inbound queue into the event handler.
//!
//! Each attempt runs in its own task so a panicking or hung handler costs one
//! attempt, never a worker. Failed attempts are requeued with backoff until the
//! retry policy gives up, then the event is dead-lettered.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hookrelay_core::{
    retry::{RetryDecision, RetryPolicy},
    types::{DeadLetter, DeadLetterKind, InboundEvent, Outcome, QueueEntry},
};
use hookrelay_util::DispatchSettings;

use crate::{
    dead_letter::DeadLetterSink,
    handler::{EventHandler, HandlerError},
    idempotency::IdempotencyStore,
    queue::InboundQueue,
    tap::{StageEvent, StageKind, StageMetadata, TapHub},
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
}

impl DispatcherConfig {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                base_delay: settings.base_delay,
                max_delay: settings.max_delay,
                jitter: settings.jitter,
            },
            attempt_timeout: settings.attempt_timeout,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct DispatchContext {
    pub queue: InboundQueue,
    pub store: Arc<dyn IdempotencyStore>,
    pub handler: Arc<dyn EventHandler>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub tap: TapHub,
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker finished within the grace period.
    pub completed: bool,
    /// Entries dropped without a terminal outcome: still queued when the
    /// workers stopped, or failed during the grace period with no way to retry.
    pub discarded: usize,
    /// Entries whose attempt was cut short by the abort.
    pub abandoned: usize,
}

type InFlight = Arc<Mutex<HashMap<usize, QueueEntry>>>;

/// Attempts at storing a dead letter before the event id is released instead.
const DEAD_LETTER_WRITE_ATTEMPTS: u32 = 3;

pub struct Dispatcher {
    context: DispatchContext,
    workers: Vec<JoinHandle<()>>,
    in_flight: InFlight,
    retry_discards: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn spawn(context: DispatchContext, config: DispatcherConfig) -> Self {
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let retry_discards = Arc::new(AtomicUsize::new(0));
        let config = Arc::new(config);
        let workers = (0..config.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    context: context.clone(),
                    config: Arc::clone(&config),
                    in_flight: Arc::clone(&in_flight),
                    retry_discards: Arc::clone(&retry_discards),
                };
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(stage = "dispatch", workers = workers.len(), "dispatcher started");
        Self {
            context,
            workers,
            in_flight,
            retry_discards,
        }
    }

    /// Stops intake, lets in-flight attempts finish within `grace`, then
    /// discards whatever is left. Discarded identifiers are released so the
    /// sender's redelivery is processed after restart.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let Self {
            context,
            mut workers,
            in_flight,
            retry_discards,
        } = self;

        info!(
            stage = "dispatch",
            workers = workers.len(),
            queued = context.queue.len(),
            grace_ms = grace.as_millis() as u64,
            "dispatcher shutting down"
        );
        context.queue.close();

        // Joined handles are popped so only unfinished workers remain on timeout.
        let joined = tokio::time::timeout(grace, async {
            while let Some(handle) = workers.last_mut() {
                if let Err(err) = handle.await {
                    error!(stage = "dispatch", error = %err, "worker task failed during shutdown");
                }
                workers.pop();
            }
        })
        .await;

        let completed = joined.is_ok();
        let mut abandoned = Vec::new();
        if !completed {
            warn!(
                stage = "dispatch",
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed; aborting workers"
            );
            for handle in &workers {
                handle.abort();
            }
            for handle in workers {
                let _ = handle.await;
            }
            abandoned = in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, entry)| entry)
                .collect();
        }

        let remaining = context.queue.drain_remaining();
        let discarded = remaining.len() + retry_discards.load(Ordering::SeqCst);
        for entry in remaining {
            discard(&context, entry, "queued at shutdown").await;
        }
        let abandoned_count = abandoned.len();
        for entry in abandoned {
            discard(&context, entry, "attempt aborted at shutdown").await;
        }

        let report = ShutdownReport {
            completed,
            discarded,
            abandoned: abandoned_count,
        };
        info!(
            stage = "dispatch",
            completed = report.completed,
            discarded = report.discarded,
            abandoned = report.abandoned,
            "dispatcher stopped"
        );
        report
    }
}

async fn discard(context: &DispatchContext, entry: QueueEntry, reason: &'static str) {
    counter!("queue_discarded_total").increment(1);
    warn!(
        stage = "dispatch",
        event_id = %entry.event.id,
        attempts = entry.attempts,
        next_retry_at = ?entry.next_retry_at,
        reason,
        "event discarded"
    );
    release(context, &entry.event.id).await;
}

/// Forgets the id so a redelivery from the sender is processed again.
async fn release(context: &DispatchContext, event_id: &str) {
    if let Err(err) = context.store.release(event_id).await {
        counter!("idempotency_store_errors_total", "op" => "release").increment(1);
        error!(
            stage = "dispatch",
            event_id,
            error = %err,
            "failed to release event id"
        );
    }
}

struct Worker {
    id: usize,
    context: DispatchContext,
    config: Arc<DispatcherConfig>,
    in_flight: InFlight,
    retry_discards: Arc<AtomicUsize>,
}

/// Aborts the wrapped task when dropped, so an aborted worker takes its
/// handler attempt down with it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Worker {
    async fn run(self) {
        debug!(stage = "dispatch", worker_id = self.id, "worker started");
        while let Some(entry) = self.context.queue.dequeue().await {
            self.track(Some(&entry));
            self.process(entry).await;
            self.track(None);
        }
        debug!(stage = "dispatch", worker_id = self.id, "worker stopped");
    }

    fn track(&self, entry: Option<&QueueEntry>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match entry {
            Some(entry) => {
                in_flight.insert(self.id, entry.clone());
            }
            None => {
                in_flight.remove(&self.id);
            }
        }
    }

    async fn process(&self, mut entry: QueueEntry) {
        entry.attempts += 1;
        let started = Instant::now();
        let result = self.attempt(&entry.event).await;
        let elapsed = started.elapsed();
        histogram!("dispatch_attempt_seconds").record(elapsed.as_secs_f64());

        let label = match &result {
            Ok(()) => "success",
            Err(HandlerError::Permanent(_)) => "permanent",
            Err(HandlerError::Transient(_)) => "transient",
        };
        counter!("dispatch_attempts_total", "result" => label).increment(1);
        self.publish_attempt(&entry, label, elapsed, result.as_ref().err());

        match result {
            Ok(()) => {
                info!(
                    stage = "dispatch",
                    event_id = %entry.event.id,
                    attempts = entry.attempts,
                    "event processed"
                );
                self.mark(&entry.event.id, Outcome::Succeeded).await;
                self.context.queue.complete();
            }
            Err(HandlerError::Permanent(message)) => {
                warn!(
                    stage = "dispatch",
                    event_id = %entry.event.id,
                    attempts = entry.attempts,
                    error = %message,
                    "permanent handler failure"
                );
                self.dead_letter(entry, DeadLetterKind::Permanent, message)
                    .await;
            }
            Err(HandlerError::Transient(message)) => {
                let decision = {
                    let mut rng = rand::thread_rng();
                    self.config.retry.decide(entry.attempts, &mut rng)
                };
                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            stage = "dispatch",
                            event_id = %entry.event.id,
                            attempts = entry.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "transient handler failure; retry scheduled"
                        );
                        entry.next_retry_at = chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|delay| Utc::now().checked_add_signed(delay));
                        if let Err(entry) = self.context.queue.requeue(entry, delay) {
                            self.retry_discards.fetch_add(1, Ordering::SeqCst);
                            discard(&self.context, entry, "queue closed before retry").await;
                        }
                    }
                    RetryDecision::GiveUp => {
                        warn!(
                            stage = "dispatch",
                            event_id = %entry.event.id,
                            attempts = entry.attempts,
                            error = %message,
                            "retries exhausted"
                        );
                        self.dead_letter(entry, DeadLetterKind::RetriesExhausted, message)
                            .await;
                    }
                }
            }
        }
    }

    async fn attempt(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.context.handler);
        let owned = event.clone();
        let mut task = AbortOnDrop(tokio::spawn(
            async move { handler.handle(&owned).await },
        ));

        match tokio::time::timeout(self.config.attempt_timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(
                    stage = "dispatch",
                    event_id = %event.id,
                    "handler panicked"
                );
                Err(HandlerError::Transient("handler panicked".into()))
            }
            Ok(Err(_)) => Err(HandlerError::Transient("handler task cancelled".into())),
            Err(_) => Err(HandlerError::Transient(format!(
                "handler timed out after {}ms",
                self.config.attempt_timeout.as_millis()
            ))),
        }
    }

    async fn mark(&self, event_id: &str, outcome: Outcome) {
        match self
            .context
            .store
            .mark_outcome(event_id, outcome, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                stage = "dispatch",
                event_id,
                outcome = %outcome,
                "idempotency record missing or already terminal"
            ),
            Err(err) => {
                counter!("idempotency_store_errors_total", "op" => "mark_outcome").increment(1);
                error!(
                    stage = "dispatch",
                    event_id,
                    outcome = %outcome,
                    error = %err,
                    "failed to record outcome"
                );
            }
        }
    }

    /// Stores the dead letter, then marks the record failed. The record only
    /// becomes terminal once the letter is safely stored; if every write fails
    /// the id is released so a redelivery is processed instead of swallowed.
    async fn dead_letter(&self, entry: QueueEntry, kind: DeadLetterKind, last_error: String) {
        let event_id = entry.event.id.clone();
        let attempts = entry.attempts;
        let summary = entry.event.redacted();
        let letter = DeadLetter {
            event: entry.event,
            attempts,
            kind,
            last_error,
            dead_lettered_at: Utc::now(),
        };

        match self.store_dead_letter(letter).await {
            Some(id) => {
                self.mark(&event_id, Outcome::Failed).await;
                counter!("dead_letter_total", "kind" => kind.as_str()).increment(1);
                warn!(
                    stage = "dead_letter",
                    event_id = %event_id,
                    dead_letter_id = %id,
                    kind = kind.as_str(),
                    attempts,
                    "event dead-lettered"
                );
                self.context.tap.publish(
                    StageEvent::new(StageKind::DeadLetter, Utc::now())
                        .with_event_id(event_id)
                        .with_meta(StageMetadata {
                            attempt: Some(attempts),
                            message: Some(kind.as_str().to_string()),
                            ..StageMetadata::default()
                        })
                        .with_out(json!({ "dead_letter_id": id, "event": summary })),
                );
            }
            None => {
                counter!("dead_letter_write_failures_total").increment(1);
                error!(
                    stage = "dead_letter",
                    event_id = %event_id,
                    kind = kind.as_str(),
                    attempts,
                    event = %summary,
                    "dead letter could not be stored; releasing event id"
                );
                release(&self.context, &event_id).await;
            }
        }
        self.context.queue.complete();
    }

    async fn store_dead_letter(&self, letter: DeadLetter) -> Option<String> {
        for write in 1..=DEAD_LETTER_WRITE_ATTEMPTS {
            match self.context.dead_letters.record(letter.clone()).await {
                Ok(id) => return Some(id),
                Err(err) => {
                    warn!(
                        stage = "dead_letter",
                        event_id = %letter.event.id,
                        write,
                        error = %err,
                        "failed to store dead letter"
                    );
                    if write < DEAD_LETTER_WRITE_ATTEMPTS {
                        tokio::time::sleep(self.config.retry.backoff(write)).await;
                    }
                }
            }
        }
        None
    }

    fn publish_attempt(
        &self,
        entry: &QueueEntry,
        result: &'static str,
        elapsed: Duration,
        err: Option<&HandlerError>,
    ) {
        self.context.tap.publish(
            StageEvent::new(StageKind::Dispatch, Utc::now())
                .with_event_id(entry.event.id.clone())
                .with_meta(StageMetadata {
                    event_type: entry.event.event_type.clone(),
                    size_bytes: Some(entry.event.payload.len() as u64),
                    latency_ms: Some(elapsed.as_secs_f64() * 1000.0),
                    attempt: Some(entry.attempts),
                    message: err.map(|err| err.message().to_string()),
                })
                .with_out(json!({ "worker_id": self.id, "result": result })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dead_letter::{DeadLetterSinkError, MemoryDeadLetterSink},
        idempotency::MemoryIdempotencyStore,
    };
    use async_trait::async_trait;
    use hookrelay_core::types::CheckOutcome;
    use hookrelay_storage::StoredDeadLetter;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Script = dyn Fn(u32) -> Result<(), HandlerError> + Send + Sync;

    /// Calls `script` with the 1-based call number.
    struct ScriptedHandler {
        calls: AtomicU32,
        script: Box<Script>,
    }

    impl ScriptedHandler {
        fn new(script: impl Fn(u32) -> Result<(), HandlerError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, _event: &InboundEvent) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.script)(call)
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, _event: &InboundEvent) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    /// Succeeds or fails transiently after sleeping.
    struct SlowFailingHandler(Duration);

    #[async_trait]
    impl EventHandler for SlowFailingHandler {
        async fn handle(&self, _event: &InboundEvent) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Err(HandlerError::Transient("upstream unavailable".into()))
        }
    }

    /// Rejects the first `failures` writes, then stores into memory.
    struct FlakySink {
        failures: u32,
        writes: AtomicU32,
        inner: MemoryDeadLetterSink,
    }

    impl FlakySink {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                writes: AtomicU32::new(0),
                inner: MemoryDeadLetterSink::new(),
            })
        }

        fn writes(&self) -> u32 {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeadLetterSink for FlakySink {
        async fn record(&self, letter: DeadLetter) -> Result<String, DeadLetterSinkError> {
            let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if write <= self.failures {
                return Err(DeadLetterSinkError("disk I/O error".into()));
            }
            self.inner.record(letter).await
        }

        async fn recent(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, DeadLetterSinkError> {
            self.inner.recent(limit).await
        }
    }

    struct Harness {
        queue: InboundQueue,
        store: Arc<MemoryIdempotencyStore>,
        sink: Arc<MemoryDeadLetterSink>,
        dispatcher: Dispatcher,
    }

    fn config(max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig {
            workers: 2,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(10),
                jitter: 0.0,
            },
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn start(handler: Arc<dyn EventHandler>, config: DispatcherConfig) -> Harness {
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let (queue, store, dispatcher) = spawn_with_sink(handler, config, sink.clone());
        Harness {
            queue,
            store,
            sink,
            dispatcher,
        }
    }

    fn spawn_with_sink(
        handler: Arc<dyn EventHandler>,
        config: DispatcherConfig,
        sink: Arc<dyn DeadLetterSink>,
    ) -> (InboundQueue, Arc<MemoryIdempotencyStore>, Dispatcher) {
        let queue = InboundQueue::new(16);
        let store = Arc::new(MemoryIdempotencyStore::new());
        let dispatcher = Dispatcher::spawn(
            DispatchContext {
                queue: queue.clone(),
                store: store.clone(),
                handler,
                dead_letters: sink,
                tap: TapHub::new(),
            },
            config,
        );
        (queue, store, dispatcher)
    }

    async fn submit(harness: &Harness, id: &str) {
        harness
            .store
            .check_and_record(id, Utc::now())
            .await
            .expect("record");
        harness
            .queue
            .enqueue(InboundEvent::new(id, b"{}".to_vec(), Utc::now(), "sha256=00"))
            .expect("enqueue");
    }

    async fn wait_for_outcome(harness: &Harness, id: &str, outcome: Outcome) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let record = harness.store.get(id).await.expect("get");
                if record.map(|r| r.outcome) == Some(outcome) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outcome reached");
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let handler = ScriptedHandler::new(|call| {
            if call <= 2 {
                Err(HandlerError::Transient("flaky".into()))
            } else {
                Ok(())
            }
        });
        let harness = start(handler.clone(), config(5));
        submit(&harness, "evt-1").await;

        wait_for_outcome(&harness, "evt-1", Outcome::Succeeded).await;
        assert_eq!(handler.calls(), 3);
        assert!(harness.sink.is_empty());
        harness.dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts() {
        let handler = ScriptedHandler::new(|_| Err(HandlerError::Transient("down".into())));
        let harness = start(handler.clone(), config(3));
        submit(&harness, "evt-2").await;

        wait_for_outcome(&harness, "evt-2", Outcome::Failed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.calls(), 3);

        let letters = harness.sink.recent(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].letter.kind, DeadLetterKind::RetriesExhausted);
        assert_eq!(letters[0].letter.attempts, 3);
        assert_eq!(letters[0].letter.last_error, "down");
        harness.dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let handler = ScriptedHandler::new(|_| Err(HandlerError::Permanent("bad payload".into())));
        let harness = start(handler.clone(), config(5));
        submit(&harness, "evt-3").await;

        wait_for_outcome(&harness, "evt-3", Outcome::Failed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.calls(), 1);
        let letters = harness.sink.recent(10).await.unwrap();
        assert_eq!(letters[0].letter.kind, DeadLetterKind::Permanent);
        assert_eq!(letters[0].letter.attempts, 1);
        harness.dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dead_letter_write_is_retried_before_marking_failed() {
        let sink = FlakySink::new(1);
        let handler = ScriptedHandler::new(|_| Err(HandlerError::Permanent("bad payload".into())));
        let (queue, store, dispatcher) = spawn_with_sink(handler, config(5), sink.clone());
        store.check_and_record("evt-flaky", Utc::now()).await.unwrap();
        queue
            .enqueue(InboundEvent::new("evt-flaky", b"{}".to_vec(), Utc::now(), "sha256=00"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while store.get("evt-flaky").await.unwrap().map(|r| r.outcome) != Some(Outcome::Failed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("record marked failed");

        assert_eq!(sink.writes(), 2);
        let letters = sink.recent(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].letter.event.id, "evt-flaky");
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unstorable_dead_letter_leaves_event_open_for_redelivery() {
        let sink = FlakySink::new(u32::MAX);
        let handler = ScriptedHandler::new(|_| Err(HandlerError::Permanent("bad payload".into())));
        let (queue, store, dispatcher) = spawn_with_sink(handler, config(5), sink.clone());
        store.check_and_record("evt-lost", Utc::now()).await.unwrap();
        queue
            .enqueue(InboundEvent::new("evt-lost", b"{}".to_vec(), Utc::now(), "sha256=00"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while store.get("evt-lost").await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event id released");

        assert_eq!(sink.writes(), DEAD_LETTER_WRITE_ATTEMPTS);
        assert!(sink.recent(10).await.unwrap().is_empty());
        assert_eq!(
            store.check_and_record("evt-lost", Utc::now()).await.unwrap(),
            CheckOutcome::New
        );
        // The claimed slot was returned, so the queue accepts a full load again.
        for idx in 0..16 {
            queue
                .enqueue(InboundEvent::new(format!("evt-{idx}"), b"{}".to_vec(), Utc::now(), "sha256=00"))
                .expect("slot available");
        }
        dispatcher.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn timed_out_attempts_count_as_transient() {
        let harness = start(Arc::new(SlowHandler(Duration::from_secs(5))), config(2));
        submit(&harness, "evt-slow").await;

        wait_for_outcome(&harness, "evt-slow", Outcome::Failed).await;
        let letters = harness.sink.recent(10).await.unwrap();
        assert_eq!(letters[0].letter.kind, DeadLetterKind::RetriesExhausted);
        assert!(letters[0].letter.last_error.contains("timed out"));
        harness.dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn worker_survives_handler_panic() {
        let handler = ScriptedHandler::new(|call| {
            if call == 1 {
                panic!("handler bug");
            }
            Ok(())
        });
        let mut config = config(3);
        config.workers = 1;
        let harness = start(handler.clone(), config);
        submit(&harness, "evt-panic").await;
        submit(&harness, "evt-after").await;

        wait_for_outcome(&harness, "evt-panic", Outcome::Succeeded).await;
        wait_for_outcome(&harness, "evt-after", Outcome::Succeeded).await;
        assert_eq!(handler.calls(), 3);
        harness.dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_discards_queued_entries_and_releases_ids() {
        let handler = ScriptedHandler::new(|_| Ok(()));
        let mut config = config(3);
        config.workers = 0;
        let harness = start(handler.clone(), config);
        submit(&harness, "evt-a").await;
        submit(&harness, "evt-b").await;

        // from_settings clamps to one worker; zero here means nothing drains the queue.
        let report = harness.dispatcher.shutdown(Duration::from_millis(100)).await;
        assert!(report.completed);
        assert_eq!(report.discarded, 2);
        assert_eq!(handler.calls(), 0);
        assert!(harness.store.get("evt-a").await.unwrap().is_none());
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_workers_past_grace() {
        let mut config = config(3);
        config.workers = 1;
        config.attempt_timeout = Duration::from_secs(30);
        let harness = start(Arc::new(SlowHandler(Duration::from_secs(30))), config);
        submit(&harness, "evt-stuck").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let report = harness.dispatcher.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!report.completed);
        assert_eq!(report.abandoned, 1);
        assert!(harness.store.get("evt-stuck").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_attempt() {
        let mut config = config(3);
        config.workers = 1;
        let harness = start(Arc::new(SlowHandler(Duration::from_millis(80))), config);
        submit(&harness, "evt-finishing").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = harness.dispatcher.shutdown(Duration::from_secs(2)).await;
        assert!(report.completed);
        assert_eq!(report.abandoned, 0);
        assert_eq!(
            harness.store.get("evt-finishing").await.unwrap().unwrap().outcome,
            Outcome::Succeeded
        );
    }

    #[tokio::test]
    async fn failure_during_grace_period_counts_as_discarded() {
        let mut config = config(3);
        config.workers = 1;
        let harness = start(Arc::new(SlowFailingHandler(Duration::from_millis(100))), config);
        submit(&harness, "evt-late-failure").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = harness.dispatcher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(
            report,
            ShutdownReport {
                completed: true,
                discarded: 1,
                abandoned: 0,
            }
        );
        assert!(harness.store.get("evt-late-failure").await.unwrap().is_none());
        assert!(harness.sink.is_empty());
    }

    #[test]
    fn config_from_settings_clamps_workers_and_attempts() {
        let settings = DispatchSettings {
            workers: 0,
            max_attempts: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(3),
            forward_url: None,
        };
        let config = DispatcherConfig::from_settings(&settings);
        assert_eq!(config.workers, 1);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.attempt_timeout, Duration::from_secs(3));
    }
}
