//! Async request logger that batches final request outcomes into the database.
//!
//! MPSC channel → batch INSERT, flushed on size or interval, drained on
//! shutdown. Controlled by `REQUEST_LOG_ENABLED` (default true).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::{Mutex, OnceLock};
use tokio::sync::{mpsc, oneshot};

use crate::core::config::str_to_bool;

/// The final outcome of one gateway request, written once.
pub struct RequestLogRecord {
    pub request_id: String,
    pub endpoint: Option<String>,
    pub key_name: Option<String>,
    pub capability: Option<String>,
    pub model_requested: Option<String>,
    pub model_effective: Option<String>,
    pub upstream_id: Option<String>,
    pub upstream_name: Option<String>,
    pub is_streaming: bool,
    pub status_code: Option<i32>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_duration_ms: Option<i64>,
    pub ttft_ms: Option<i64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// JSON-serialized FailoverAttempt trail
    pub failover_attempts: Option<String>,
    pub billing_status: Option<String>,
    pub unbilled_reason: Option<String>,
    pub price_source: Option<String>,
    pub cost_femto_usd: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl Default for RequestLogRecord {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            endpoint: None,
            key_name: None,
            capability: None,
            model_requested: None,
            model_effective: None,
            upstream_id: None,
            upstream_name: None,
            is_streaming: false,
            status_code: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cached_tokens: 0,
            reasoning_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_duration_ms: None,
            ttft_ms: None,
            error_type: None,
            error_message: None,
            failover_attempts: None,
            billing_status: None,
            unbilled_reason: None,
            price_source: None,
            cost_femto_usd: None,
            timestamp: Utc::now(),
        }
    }
}

pub struct RequestLogger {
    tx: mpsc::Sender<RequestLogRecord>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

const BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL_SECS: u64 = 2;

impl RequestLogger {
    pub fn new(pool: PgPool) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_task(rx, pool, done_tx));
        Self {
            tx,
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    pub fn log(&self, record: RequestLogRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!("Request log channel full, dropping record: {}", e);
        }
    }

    async fn writer_task(
        mut rx: mpsc::Receiver<RequestLogRecord>,
        pool: PgPool,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut buffer: Vec<RequestLogRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= BATCH_SIZE {
                                Self::flush(&pool, &mut buffer).await;
                            }
                        }
                        None => {
                            // Channel closed — flush remaining records
                            if !buffer.is_empty() {
                                Self::flush(&pool, &mut buffer).await;
                            }
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::flush(&pool, &mut buffer).await;
                    }
                }
            }
        }

        tracing::info!("Request logger writer task stopped");
        let _ = done_tx.send(());
    }

    async fn flush(pool: &PgPool, buffer: &mut Vec<RequestLogRecord>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        let cols = 27;
        let mut sql = String::from(
            "INSERT INTO request_logs (\
             timestamp, request_id, endpoint, key_name, capability, \
             model_requested, model_effective, upstream_id, upstream_name, \
             is_streaming, status_code, \
             prompt_tokens, completion_tokens, total_tokens, cached_tokens, \
             reasoning_tokens, cache_creation_tokens, cache_read_tokens, \
             total_duration_ms, ttft_ms, \
             error_type, error_message, failover_attempts, \
             billing_status, unbilled_reason, price_source, cost_femto_usd\
             ) VALUES ",
        );

        for i in 0..count {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * cols + 1;
            sql.push('(');
            for j in 0..cols {
                if j > 0 {
                    sql.push_str(", ");
                }
                sql.push('$');
                sql.push_str(&(base + j).to_string());
            }
            sql.push(')');
        }

        let mut query = sqlx::query(&sql);

        for record in buffer.drain(..) {
            query = query
                .bind(record.timestamp)
                .bind(record.request_id)
                .bind(record.endpoint)
                .bind(record.key_name)
                .bind(record.capability)
                .bind(record.model_requested)
                .bind(record.model_effective)
                .bind(record.upstream_id)
                .bind(record.upstream_name)
                .bind(record.is_streaming)
                .bind(record.status_code)
                .bind(record.prompt_tokens)
                .bind(record.completion_tokens)
                .bind(record.total_tokens)
                .bind(record.cached_tokens)
                .bind(record.reasoning_tokens)
                .bind(record.cache_creation_tokens)
                .bind(record.cache_read_tokens)
                .bind(record.total_duration_ms)
                .bind(record.ttft_ms)
                .bind(record.error_type)
                .bind(record.error_message)
                .bind(record.failover_attempts)
                .bind(record.billing_status)
                .bind(record.unbilled_reason)
                .bind(record.price_source)
                .bind(record.cost_femto_usd);
        }

        if let Err(e) = query.execute(pool).await {
            tracing::error!("Failed to flush request logs to database: {}", e);
        }
    }
}

// Mutex<Option<…>> allows shutdown to take (drop) the sender, triggering writer flush
static REQUEST_LOGGER: OnceLock<Mutex<Option<RequestLogger>>> = OnceLock::new();

pub fn init_request_logger(pool: PgPool) {
    let enabled = std::env::var("REQUEST_LOG_ENABLED")
        .map(|v| str_to_bool(&v))
        .unwrap_or(true);

    if !enabled {
        tracing::info!("Request logging is disabled");
        return;
    }

    let logger = RequestLogger::new(pool);
    REQUEST_LOGGER.get_or_init(|| Mutex::new(Some(logger)));
    tracing::info!("Request logger initialized");
}

pub fn log_request_record(record: RequestLogRecord) {
    if let Some(mutex) = REQUEST_LOGGER.get() {
        if let Ok(guard) = mutex.lock() {
            if let Some(ref logger) = *guard {
                logger.log(record);
            }
        }
    }
}

/// Graceful shutdown: drops the sender so the writer task flushes remaining
/// buffer and exits, then waits for it via the oneshot channel.
pub async fn shutdown_request_logger() {
    if let Some(mutex) = REQUEST_LOGGER.get() {
        let (taken, done_rx) = {
            let mut guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
            let logger = guard.take();
            let rx = logger
                .as_ref()
                .and_then(|l| l.done_rx.lock().ok().and_then(|mut r| r.take()));
            (logger, rx)
        };
        if taken.is_some() {
            drop(taken);
            if let Some(rx) = done_rx {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(5), rx).await;
            }
            tracing::info!("Request logger shut down");
        }
    }
}
