//! Metric catalog and Prometheus exporter wiring.
//!
//! An enum of metric names with a `Display` impl eliminates magic strings;
//! `metrics_exporter_prometheus` is installed once at process start and
//! scraped in place for the life of the daemon (see DESIGN.md).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    SyncBatchesProcessed,
    SyncRecordsFetched,
    SyncRecordsUpserted,
    SyncBatchDuration,
    SyncCursorAdvanced,
    SyncErrors,

    ParserParseSuccess,
    ParserParseError,

    ImageDuplicatesFound,
    ImagesDeletedSuccess,
    ImagesDeletedError,

    QueueJobsEnqueued,
    QueueJobsRejectedFull,
    QueueJobsRejectedDuplicate,
    QueueJobsCompleted,
    QueueJobsFailed,
    QueueDepth,

    HttpRequestsTotal,
    HttpRequestsUnauthorized,
    HttpRequestDuration,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::SyncBatchesProcessed => "catalog_sync_batches_processed_total",
            MetricName::SyncRecordsFetched => "catalog_sync_records_fetched_total",
            MetricName::SyncRecordsUpserted => "catalog_sync_records_upserted_total",
            MetricName::SyncBatchDuration => "catalog_sync_batch_duration_seconds",
            MetricName::SyncCursorAdvanced => "catalog_sync_cursor_advanced_total",
            MetricName::SyncErrors => "catalog_sync_errors_total",

            MetricName::ParserParseSuccess => "catalog_sync_parser_parse_success_total",
            MetricName::ParserParseError => "catalog_sync_parser_parse_error_total",

            MetricName::ImageDuplicatesFound => "catalog_sync_image_duplicates_found_total",
            MetricName::ImagesDeletedSuccess => "catalog_sync_images_deleted_success_total",
            MetricName::ImagesDeletedError => "catalog_sync_images_deleted_error_total",

            MetricName::QueueJobsEnqueued => "catalog_sync_queue_jobs_enqueued_total",
            MetricName::QueueJobsRejectedFull => "catalog_sync_queue_jobs_rejected_full_total",
            MetricName::QueueJobsRejectedDuplicate => "catalog_sync_queue_jobs_rejected_duplicate_total",
            MetricName::QueueJobsCompleted => "catalog_sync_queue_jobs_completed_total",
            MetricName::QueueJobsFailed => "catalog_sync_queue_jobs_failed_total",
            MetricName::QueueDepth => "catalog_sync_queue_depth",

            MetricName::HttpRequestsTotal => "catalog_sync_http_requests_total",
            MetricName::HttpRequestsUnauthorized => "catalog_sync_http_requests_unauthorized_total",
            MetricName::HttpRequestDuration => "catalog_sync_http_request_duration_seconds",
        }
    }
}

/// Installs the global Prometheus recorder. Returns the handle so the HTTP
/// server can render `/metrics` on demand.
pub fn install() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder installs exactly once per process")
}

pub mod sync {
    use super::MetricName;

    pub fn batch_processed(records_fetched: u64, records_upserted: u64, duration_secs: f64) {
        ::metrics::counter!(MetricName::SyncBatchesProcessed.as_str()).increment(1);
        ::metrics::counter!(MetricName::SyncRecordsFetched.as_str()).increment(records_fetched);
        ::metrics::counter!(MetricName::SyncRecordsUpserted.as_str()).increment(records_upserted);
        ::metrics::histogram!(MetricName::SyncBatchDuration.as_str()).record(duration_secs);
    }

    pub fn cursor_advanced() {
        ::metrics::counter!(MetricName::SyncCursorAdvanced.as_str()).increment(1);
    }

    pub fn error() {
        ::metrics::counter!(MetricName::SyncErrors.as_str()).increment(1);
    }
}

pub mod parser {
    use super::MetricName;

    pub fn parse_success(parser_name: &str) {
        ::metrics::counter!(MetricName::ParserParseSuccess.as_str(), "parser" => parser_name.to_string()).increment(1);
    }

    pub fn parse_error(parser_name: &str) {
        ::metrics::counter!(MetricName::ParserParseError.as_str(), "parser" => parser_name.to_string()).increment(1);
    }
}

pub mod images {
    use super::MetricName;

    pub fn duplicates_found(count: u64) {
        if count > 0 {
            ::metrics::counter!(MetricName::ImageDuplicatesFound.as_str()).increment(count);
        }
    }

    pub fn deleted_success(count: u64) {
        ::metrics::counter!(MetricName::ImagesDeletedSuccess.as_str()).increment(count);
    }

    pub fn deleted_error(count: u64) {
        ::metrics::counter!(MetricName::ImagesDeletedError.as_str()).increment(count);
    }
}

pub mod queue {
    use super::MetricName;

    pub fn enqueued() {
        ::metrics::counter!(MetricName::QueueJobsEnqueued.as_str()).increment(1);
    }

    pub fn rejected_full() {
        ::metrics::counter!(MetricName::QueueJobsRejectedFull.as_str()).increment(1);
    }

    pub fn rejected_duplicate() {
        ::metrics::counter!(MetricName::QueueJobsRejectedDuplicate.as_str()).increment(1);
    }

    pub fn completed() {
        ::metrics::counter!(MetricName::QueueJobsCompleted.as_str()).increment(1);
    }

    pub fn failed() {
        ::metrics::counter!(MetricName::QueueJobsFailed.as_str()).increment(1);
    }

    pub fn depth(current: usize) {
        ::metrics::gauge!(MetricName::QueueDepth.as_str()).set(current as f64);
    }
}

pub mod http {
    use super::MetricName;

    pub fn request(path: &str, status: u16, duration_secs: f64) {
        ::metrics::counter!(MetricName::HttpRequestsTotal.as_str(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        ::metrics::histogram!(MetricName::HttpRequestDuration.as_str(), "path" => path.to_string()).record(duration_secs);
    }

    pub fn unauthorized() {
        ::metrics::counter!(MetricName::HttpRequestsUnauthorized.as_str()).increment(1);
    }
}
