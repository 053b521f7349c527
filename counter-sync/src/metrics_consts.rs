pub const EVENTS_OBSERVED: &str = "counter_sync_events_observed";
pub const INCREMENTS_ENQUEUED: &str = "counter_sync_increments_enqueued";
pub const FLUSHES_STARTED: &str = "counter_sync_flushes_started";
pub const FLUSH_ATTEMPT: &str = "counter_sync_flush_attempt";
pub const FLUSH_BATCH_SIZE: &str = "counter_sync_flush_batch_size";
pub const FLUSH_TIME: &str = "counter_sync_flush_time_ms";
pub const FOLDED_BACK: &str = "counter_sync_folded_back_increments";
pub const AUTO_DRAINED: &str = "counter_sync_auto_drained_flushes";
pub const RETRIES_SCHEDULED: &str = "counter_sync_retries_scheduled";
pub const RETRIES_SUPERSEDED: &str = "counter_sync_retries_superseded";
pub const RETRIGGERED: &str = "counter_sync_retriggered_flushes";
pub const PENDING: &str = "counter_sync_pending";
pub const CONFIRMED: &str = "counter_sync_confirmed";
pub const LOCAL: &str = "counter_sync_local";
pub const DRIFT: &str = "counter_sync_drift";
pub const SINK_CALLS: &str = "counter_sync_sink_calls";
pub const SINK_LATENCY: &str = "counter_sync_sink_latency_ms";
