use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use counter_sync::drift::DriftReporter;
use counter_sync::emitter::EventEmitter;
use counter_sync::error::TransientPersistError;
use counter_sync::handler::EventHandler;
use counter_sync::reconciler::Reconciler;
use counter_sync::retry::{RetryMode, RetryPolicy};
use counter_sync::sink::PersistSink;
use counter_sync::stats::{NoopSurface, StatsBoard};
use counter_sync::store::CounterStore;

type Key = &'static str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Call {
    key: Key,
    amount: u64,
    succeeded: bool,
}

/// A sink that fails on demand and records every call it served, flagging any moment where two
/// calls for the same key were outstanding at once.
#[derive(Default)]
struct ScriptedSink {
    latency: Duration,
    max_jitter_micros: u64,
    fail_first: AtomicU64,
    failure_rate: f64,
    down: AtomicBool,
    outstanding: Mutex<HashMap<Key, usize>>,
    overlaps: AtomicU64,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedSink {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn failing_first(self, calls: u64) -> Self {
        self.fail_first.store(calls, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn successful_amounts(&self, key: Key) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter(|call| call.key == key && call.succeeded)
            .map(|call| call.amount)
            .collect()
    }

    fn persisted_total(&self, key: Key) -> u64 {
        self.successful_amounts(key).iter().sum()
    }

    fn should_fail(&self) -> bool {
        if self.down.load(Ordering::SeqCst) {
            return true;
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return true;
        }
        self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate
    }
}

#[async_trait]
impl PersistSink<Key> for ScriptedSink {
    async fn add_to_persisted_total(
        &self,
        key: &Key,
        amount: u64,
    ) -> Result<(), TransientPersistError> {
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            let count = outstanding.entry(*key).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        let jitter = if self.max_jitter_micros > 0 {
            Duration::from_micros(rand::random::<u64>() % self.max_jitter_micros)
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(self.latency + jitter).await;

        *self.outstanding.lock().unwrap().get_mut(key).unwrap() -= 1;

        let succeeded = !self.should_fail();
        self.calls.lock().unwrap().push(Call {
            key: *key,
            amount,
            succeeded,
        });

        if succeeded {
            Ok(())
        } else {
            Err(TransientPersistError::Unavailable("scripted failure".to_owned()))
        }
    }
}

const POLL: Duration = Duration::from_millis(5);
const TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn burst_before_first_resolution_is_persisted_in_a_single_successful_flush() {
    let sink = Arc::new(ScriptedSink::with_latency(Duration::from_millis(10)).failing_first(3));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::default());

    for _ in 0..5 {
        reconciler.enqueue_increment("A", 1);
    }

    assert!(reconciler.wait_for_quiescence(POLL, TIMEOUT).await);

    let calls = sink.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls.iter().filter(|call| !call.succeeded).count(), 3);
    assert_eq!(sink.successful_amounts("A"), vec![5]);
    assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);

    let state = reconciler.key_snapshot(&"A").unwrap();
    assert_eq!(state.observed, 5);
    assert_eq!(state.confirmed, 5);
    assert_eq!(state.pending, 0);
    assert!(!state.in_flight);
}

#[tokio::test(start_paused = true)]
async fn reliable_sink_reaches_every_event_with_at_most_one_call_per_event() {
    let sink = Arc::new(ScriptedSink::default());
    let reconciler = Reconciler::new(sink.clone(), RetryMode::default());

    for i in 0..1000 {
        reconciler.enqueue_increment("B", 1);
        if i % 7 == 0 {
            tokio::task::yield_now().await;
        }
    }

    assert!(reconciler.wait_for_quiescence(POLL, TIMEOUT).await);

    assert_eq!(sink.persisted_total("B"), 1000);
    assert!(sink.calls().len() <= 1000);
    assert!(sink.calls().iter().all(|call| call.succeeded && call.amount > 0));
    assert_eq!(reconciler.key_snapshot(&"B").unwrap().confirmed, 1000);
}

#[tokio::test(start_paused = true)]
async fn failed_batch_waits_for_the_next_trigger_by_choice() {
    let sink = Arc::new(ScriptedSink::with_latency(Duration::from_millis(10)).failing_first(1));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::AwaitNextTrigger);

    reconciler.enqueue_increment("A", 1);
    reconciler.enqueue_increment("A", 1);
    tokio::time::sleep(Duration::from_secs(5)).await;

    // The first batch failed and nothing has triggered a retry.
    assert_eq!(sink.calls().len(), 1);
    assert!(!reconciler.is_quiescent());
    let state = reconciler.key_snapshot(&"A").unwrap();
    assert_eq!(state.pending, 2);
    assert!(!state.in_flight);

    // The next increment picks up the folded-back amount along with its own.
    reconciler.enqueue_increment("A", 1);
    assert!(reconciler.wait_for_quiescence(POLL, TIMEOUT).await);
    assert_eq!(sink.successful_amounts("A"), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn retrigger_idle_restarts_stalled_keys_only() {
    let sink = Arc::new(ScriptedSink::with_latency(Duration::from_millis(10)).failing_first(1));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::AwaitNextTrigger);

    reconciler.enqueue_increment("A", 4);
    tokio::time::sleep(Duration::from_millis(50)).await;
    reconciler.enqueue_increment("B", 1);

    // "A" is stalled on its failure, "B" is in flight.
    assert_eq!(reconciler.retrigger_idle(), 1);
    assert_eq!(reconciler.retrigger_idle(), 0);

    assert!(reconciler.wait_for_quiescence(POLL, TIMEOUT).await);
    assert_eq!(sink.successful_amounts("A"), vec![4]);
    assert_eq!(sink.successful_amounts("B"), vec![1]);
    assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_retry_yields_to_a_flush_started_by_a_new_increment() {
    let sink = Arc::new(ScriptedSink::with_latency(Duration::from_millis(10)).failing_first(1));
    let policy = RetryPolicy::new(2, Duration::from_millis(100), None);
    let reconciler = Reconciler::new(sink.clone(), RetryMode::Backoff(policy));

    reconciler.enqueue_increment("A", 1);
    // The first call fails at 10ms and its retry is due at 110ms.
    tokio::time::sleep(Duration::from_millis(50)).await;
    reconciler.enqueue_increment("A", 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(reconciler.is_quiescent());

    let calls = sink.calls();
    assert_eq!(
        calls,
        vec![
            Call {
                key: "A",
                amount: 1,
                succeeded: false
            },
            Call {
                key: "A",
                amount: 2,
                succeeded: true
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn pending_converges_once_the_sink_recovers() {
    let sink = Arc::new(ScriptedSink::with_latency(Duration::from_millis(10)));
    sink.down.store(true, Ordering::SeqCst);
    let store = Arc::new(CounterStore::<Key>::new(Arc::new(NoopSurface)));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::default());
    let handler = EventHandler::new(store.clone(), reconciler.clone());
    let reporter = DriftReporter::new(store, reconciler.clone());

    for _ in 0..10 {
        handler.on_event(&"A");
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let report = reporter.report();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].local, 10);
    assert_eq!(report.entries[0].confirmed, 0);
    assert_eq!(report.total_drift(), 10);
    assert!(!reconciler.is_quiescent());
    assert_eq!(sink.persisted_total("A"), 0);

    sink.down.store(false, Ordering::SeqCst);
    assert!(reconciler.wait_for_quiescence(POLL, TIMEOUT).await);

    let report = reporter.report();
    assert_eq!(report.total_drift(), 0);
    assert_eq!(report.total_pending(), 0);
    assert_eq!(sink.successful_amounts("A"), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn zero_increments_are_ignored() {
    let sink = Arc::new(ScriptedSink::default());
    let reconciler = Reconciler::new(sink.clone(), RetryMode::default());

    reconciler.enqueue_increment("A", 0);

    assert!(reconciler.key_snapshot(&"A").is_none());
    assert!(reconciler.is_quiescent());
    assert!(sink.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emitters_against_a_flaky_sink_conserve_every_event() {
    const KEYS: [Key; 3] = ["A", "B", "C"];
    const EMITTERS: usize = 8;
    const EVENTS_PER_EMITTER: usize = 300;

    let sink = Arc::new(ScriptedSink {
        max_jitter_micros: 500,
        failure_rate: 0.3,
        ..Default::default()
    });
    let board = Arc::new(StatsBoard::<Key>::new());
    let store = Arc::new(CounterStore::new(board.clone()));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::Backoff(RetryPolicy::immediate()));
    let handler = Arc::new(EventHandler::new(store.clone(), reconciler.clone()));
    let emitter = Arc::new(EventEmitter::new());
    handler.attach(&emitter, KEYS);

    let tasks: Vec<_> = (0..EMITTERS)
        .map(|emitter_index| {
            let emitter = Arc::clone(&emitter);
            tokio::spawn(async move {
                for i in 0..EVENTS_PER_EMITTER {
                    emitter.emit(&KEYS[(emitter_index + i) % KEYS.len()]);
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert!(
        reconciler
            .wait_for_quiescence(Duration::from_millis(10), Duration::from_secs(60))
            .await
    );
    assert_eq!(handler.detach(&emitter), KEYS.len());

    assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
    let mut total = 0;
    for key in KEYS {
        let observed = store.read(&key);
        assert_eq!(sink.persisted_total(key), observed);
        assert_eq!(board.get_stats(&key), observed);
        assert!(sink.successful_amounts(key).iter().all(|amount| *amount > 0));
        total += observed;
    }
    assert_eq!(total, (EMITTERS * EVENTS_PER_EMITTER) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_raised_on_plain_os_threads_are_all_persisted() {
    const KEYS: [Key; 2] = ["A", "B"];
    const THREADS: usize = 6;
    const EVENTS_PER_THREAD: usize = 250;

    let sink = Arc::new(ScriptedSink {
        max_jitter_micros: 300,
        failure_rate: 0.3,
        ..Default::default()
    });
    let store = Arc::new(CounterStore::<Key>::new(Arc::new(NoopSurface)));
    let reconciler = Reconciler::new(sink.clone(), RetryMode::Backoff(RetryPolicy::immediate()));
    let handler = Arc::new(EventHandler::new(store.clone(), reconciler.clone()));
    let emitter = Arc::new(EventEmitter::new());
    handler.attach(&emitter, KEYS);

    // None of these threads has a Tokio context of its own.
    let workers = {
        let emitter = Arc::clone(&emitter);
        tokio::task::spawn_blocking(move || {
            std::thread::scope(|scope| {
                let threads: Vec<_> = (0..THREADS)
                    .map(|thread_index| {
                        let emitter = Arc::clone(&emitter);
                        scope.spawn(move || {
                            for i in 0..EVENTS_PER_THREAD {
                                emitter.emit(&KEYS[(thread_index + i) % KEYS.len()]);
                            }
                        })
                    })
                    .collect();
                threads
                    .into_iter()
                    .map(|thread| thread.join().is_ok())
                    .all(|joined| joined)
            })
        })
    };
    assert!(workers.await.unwrap(), "an emitting thread panicked");

    assert!(
        reconciler
            .wait_for_quiescence(Duration::from_millis(10), Duration::from_secs(60))
            .await
    );

    assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
    let mut total = 0;
    for key in KEYS {
        let observed = store.read(&key);
        let state = reconciler.key_snapshot(&key).unwrap();
        assert_eq!(sink.persisted_total(key), observed);
        assert_eq!(state.confirmed, observed);
        assert_eq!(state.pending, 0);
        assert!(!state.in_flight);
        total += observed;
    }
    assert_eq!(total, (THREADS * EVENTS_PER_THREAD) as u64);
}
