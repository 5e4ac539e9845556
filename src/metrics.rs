use {
    prometheus::{IntCounterVec, Opts, Registry, TextEncoder},
    std::sync::Once,
    tracing::error,
};

lazy_static::lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    static ref VERSION: IntCounterVec = IntCounterVec::new(
        Opts::new("version", "Sender version info"),
        &["package", "version"]
    ).unwrap();
}

macro_rules! register {
    ($collector:ident) => {
        REGISTRY
            .register(Box::new($collector.clone()))
            .expect("collector can't be registered")
    };
}

fn init2() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        register!(VERSION);
        VERSION
            .with_label_values(&[env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")])
            .inc();
    });
}

pub fn collect_to_text() -> String {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_else(|error| {
            error!("could not encode custom metrics: {}", error);
            String::new()
        })
}

pub mod sender {
    use {
        super::{REGISTRY, init2},
        crate::{
            classify::ErrorClass,
            util::BlockHeight,
        },
        prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts},
        solana_rpc_client_api::request::RpcRequest,
        std::{sync::Once, time::Duration},
    };

    lazy_static::lazy_static! {
        static ref BLOCKHASH_REFRESH_TOTAL: IntCounterVec = IntCounterVec::new(
            Opts::new("blockhash_refresh_total", "Number of getLatestBlockhash refreshes by status"),
            &["status"]
        ).unwrap();
        static ref BLOCKHASH_LAST_VALID_BLOCK_HEIGHT: IntGauge = IntGauge::new(
            "blockhash_last_valid_block_height", "Last valid block height of the cached blockhash"
        ).unwrap();
        static ref BLOCK_HEIGHT_ESTIMATE: IntGauge = IntGauge::new(
            "block_height_estimate", "Highest block height observed from the node"
        ).unwrap();

        static ref RPC_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
            Opts::new("rpc_errors_total", "Number of failed rpc calls by method and error class"),
            &["method", "class"]
        ).unwrap();

        static ref SUBMISSIONS_INFLIGHT: IntGauge = IntGauge::new(
            "submissions_inflight", "Number of submissions not yet in a terminal state"
        ).unwrap();
        static ref SUBMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
            Opts::new("submissions_total", "Number of finished submissions by outcome"),
            &["outcome"]
        ).unwrap();
        static ref SEND_TRANSACTION_ATTEMPT: IntCounter = IntCounter::new(
            "send_transaction_attempt", "Number of sendTransaction attempts"
        ).unwrap();
        static ref SUBMISSION_RETRIES_TOTAL: IntCounter = IntCounter::new(
            "submission_retries_total", "Number of retries after transient errors"
        ).unwrap();
        static ref RESUBMISSIONS_TOTAL: IntCounter = IntCounter::new(
            "resubmissions_total", "Number of transactions rebuilt after blockhash expiry"
        ).unwrap();

        static ref TRANSACTION_LANDING_TIME: Histogram = Histogram::with_opts(
           HistogramOpts::new("transaction_landing_time_ms", "Time from submit to confirmed status in ms")
           .buckets(vec![100.0, 250.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0, 3000.0, 5000.0, 7500.0, 10000.0, 20000.0, 30000.0, 60000.0, f64::INFINITY])
        ).unwrap();
    }

    pub fn incr_blockhash_refresh(status: &str) {
        BLOCKHASH_REFRESH_TOTAL.with_label_values(&[status]).inc();
    }

    pub fn set_blockhash_last_valid_block_height(block_height: BlockHeight) {
        BLOCKHASH_LAST_VALID_BLOCK_HEIGHT.set(block_height as i64);
    }

    pub fn set_block_height_estimate(block_height: BlockHeight) {
        BLOCK_HEIGHT_ESTIMATE.set(block_height as i64);
    }

    pub fn incr_rpc_error(method: RpcRequest, class: ErrorClass) {
        RPC_ERRORS_TOTAL
            .with_label_values(&[&method.to_string(), class.as_str()])
            .inc();
    }

    pub fn submissions_inflight_inc() {
        SUBMISSIONS_INFLIGHT.inc();
    }

    pub fn submissions_inflight_dec() {
        SUBMISSIONS_INFLIGHT.dec();
    }

    pub fn incr_submission_outcome(outcome: &str) {
        SUBMISSIONS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn incr_send_transaction_attempt() {
        SEND_TRANSACTION_ATTEMPT.inc();
    }

    pub fn incr_submission_retries() {
        SUBMISSION_RETRIES_TOTAL.inc();
    }

    pub fn incr_resubmissions() {
        RESUBMISSIONS_TOTAL.inc();
    }

    pub fn observe_transaction_landing_time(elapsed: Duration) {
        TRANSACTION_LANDING_TIME.observe(elapsed.as_millis() as f64);
    }

    pub fn init() {
        init2();

        static REGISTER: Once = Once::new();
        REGISTER.call_once(|| {
            register!(BLOCKHASH_REFRESH_TOTAL);
            register!(BLOCKHASH_LAST_VALID_BLOCK_HEIGHT);
            register!(BLOCK_HEIGHT_ESTIMATE);
            register!(RPC_ERRORS_TOTAL);
            register!(SUBMISSIONS_INFLIGHT);
            register!(SUBMISSIONS_TOTAL);
            register!(SEND_TRANSACTION_ATTEMPT);
            register!(SUBMISSION_RETRIES_TOTAL);
            register!(RESUBMISSIONS_TOTAL);
            register!(TRANSACTION_LANDING_TIME);
        });
    }
}
