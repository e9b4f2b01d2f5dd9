use std::time::{Duration, Instant};

use futures_util::StreamExt;

use crate::client::promise::RequestPromise;
use crate::error::ClientError;
use crate::response::Response;

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Concurrency within this batch. Falls back to the client's runner
    /// default. Scheduler-wide limits still apply on top.
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
}

/// Result array in submission order plus aggregate stats.
pub struct BatchOutcome {
    pub results: Vec<Result<Response, ClientError>>,
    pub stats: BatchStats,
}

pub(crate) async fn run_batch(
    promises: Vec<RequestPromise>,
    concurrency: usize,
    opts: BatchOptions,
) -> BatchOutcome {
    let concurrency = opts.concurrency.unwrap_or(concurrency).max(1);
    let total = promises.len();
    let start = Instant::now();

    // `buffered` polls up to `concurrency` sends at once and yields in
    // submission order.
    let results: Vec<Result<Response, ClientError>> =
        futures_util::stream::iter(promises.into_iter().map(|p| p.send()))
            .buffered(concurrency)
            .collect()
            .await;

    let successful = results.iter().filter(|r| r.is_ok()).count();
    let stats = BatchStats {
        total,
        successful,
        failed: total - successful,
        duration: start.elapsed(),
    };

    tracing::debug!(
        total = stats.total,
        successful = stats.successful,
        failed = stats.failed,
        duration_ms = %stats.duration.as_millis(),
        "batch: completed"
    );

    BatchOutcome { results, stats }
}
