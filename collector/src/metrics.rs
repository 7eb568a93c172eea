use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_readings_total",
        "Total readings stored"
    ))
    .unwrap();
    pub static ref STATISTICS_QUERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_statistics_queries_total",
        "Total statistics aggregations computed"
    ))
    .unwrap();
    pub static ref STATISTICS_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "collector_statistics_latency_seconds",
            "Time taken to aggregate statistics"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref JOBS_ENQUEUED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_jobs_enqueued_total",
        "Total statistics jobs published to the queue"
    ))
    .unwrap();
    pub static ref JOBS_SUCCEEDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_jobs_succeeded_total",
        "Total statistics jobs completed"
    ))
    .unwrap();
    pub static ref JOBS_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_jobs_failed_total",
        "Total statistics jobs failed"
    ))
    .unwrap();
    pub static ref JOBS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_jobs_skipped_total",
        "Total job deliveries dropped because the job was already claimed"
    ))
    .unwrap();
    pub static ref INVALID_JOB_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_invalid_job_messages_total",
        "Total job messages that could not be decoded"
    ))
    .unwrap();
    pub static ref JOB_CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_job_channel_full_total",
        "Total number of times the job channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(STATISTICS_QUERIES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STATISTICS_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(JOBS_ENQUEUED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(JOBS_SUCCEEDED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(JOBS_FAILED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(JOBS_SKIPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_JOB_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(JOB_CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
