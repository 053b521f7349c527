//! Drive randomly timed events through the counter and reconcile them with a flaky store.
use std::sync::Arc;
use std::time::Duration;

use counter_sync::{
    config::Config,
    drift::DriftReporter,
    emitter::{trigger_randomly, EventEmitter},
    error::SyncError,
    handler::EventHandler,
    key::EventName,
    reconciler::Reconciler,
    retry::RetryMode,
    serve_metrics::{serve, setup_metrics_routes, status_router},
    sink::{PersistSink, SimulatedSink},
    stats::{ReportingSurface, StatsBoard},
    store::CounterStore,
};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_ROUND: Duration = Duration::from_millis(500);

type Sink = Arc<SimulatedSink<EventName>>;

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_status_server(
    config: &Config,
    reporter: DriftReporter<EventName, Sink>,
) -> Result<JoinHandle<()>, SyncError> {
    let router = status_router(reporter);
    let router = if config.export_prometheus {
        setup_metrics_routes(router)?
    } else {
        router
    };

    let bind = config.bind();
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve status endpoints on {}: {}", bind, e);
        }
    }))
}

/// Wait until nothing is pending or in flight. When failed batches only move on the next
/// trigger, keep re-triggering idle keys since no more events are coming.
async fn drain<S: PersistSink<EventName>>(
    reconciler: &Reconciler<EventName, S>,
    timeout: Duration,
) -> Result<(), SyncError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if reconciler.retry_mode() == RetryMode::AwaitNextTrigger {
            reconciler.retrigger_idle();
        }
        if reconciler
            .wait_for_quiescence(QUIESCENCE_POLL_INTERVAL, DRAIN_ROUND)
            .await
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SyncError::QuiescenceTimeout(timeout));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults()?;
    let retry_mode = config.retry_policy.retry_mode();
    info!("retry mode: {:?}", retry_mode);

    let sink: Sink = Arc::new(SimulatedSink::new(config.sink_config())?);
    let board = Arc::new(StatsBoard::<EventName>::new());
    let store = Arc::new(CounterStore::new(board.clone()));
    let reconciler = Reconciler::new(sink.clone(), retry_mode);
    let reporter = DriftReporter::new(store.clone(), reconciler.clone());

    start_status_server(&config, reporter.clone())?;

    let emitter = Arc::new(EventEmitter::new());
    let handler = Arc::new(EventHandler::new(store.clone(), reconciler.clone()));
    let keys = config.event_names.0.clone();
    handler.attach(&emitter, keys.iter().copied());

    let surface: Arc<dyn ReportingSurface<EventName>> = board.clone();
    let stats_interval = config.stats_interval();
    let stats_reporter = reporter.clone();
    let stats_surface = surface.clone();
    tokio::spawn(async move { stats_reporter.run(stats_interval, stats_surface).await });

    let mut generators = JoinSet::new();
    for key in keys.iter().copied() {
        generators.spawn(trigger_randomly(
            emitter.clone(),
            key,
            config.max_events,
            config.max_emit_delay.0,
        ));
    }
    while let Some(result) = generators.join_next().await {
        result?;
    }

    let detached = handler.detach(&emitter);
    info!(
        subscriptions = detached,
        "all events emitted, waiting for pending increments"
    );

    drain(&reconciler, config.quiescence_timeout.0).await?;

    surface.show_stats(&reporter.report());
    info!(
        calls = sink.calls(),
        failures = sink.failures(),
        "simulated store summary"
    );

    for key in keys {
        let local = store.read(&key);
        let persisted = sink.persisted_total(&key);
        if local != persisted {
            warn!(key = %key, local, persisted, "persisted total diverged");
            return Err(SyncError::ConservationViolated {
                key: key.to_string(),
                local,
                persisted,
            });
        }
        info!(key = %key, total = persisted, "persisted total matches local count");
    }

    Ok(())
}
