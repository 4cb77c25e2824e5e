//! Bounded concurrent execution with complete result collection.
//!
//! [`ConcurrencyHarness::fan_out`] runs k interchangeable attempts of one
//! logical operation; [`ConcurrencyHarness::race`] runs several competing
//! operations once each and keeps results aligned with the input. Neither
//! drops a result: a timeout, an error or a panic occupies its slot as a
//! failed [`ApiResult`], so a batch always has as many entries as launches.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, join_all};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::error::Result;
use crate::types::{ApiResult, ResourceHandle};

/// A deferred call. Futures are lazy, so a boxed future is a zero-argument operation.
pub type Operation = BoxFuture<'static, Result<ApiResult>>;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConcurrencyHarness {
    /// Max in-flight calls per batch; `None` means one worker per launch.
    pool_size: Option<usize>,
    call_timeout: Duration,
}

impl Default for ConcurrencyHarness {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl ConcurrencyHarness {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            pool_size: None,
            call_timeout,
        }
    }

    pub fn with_pool_size(mut self, pool_size: Option<usize>) -> Self {
        self.pool_size = pool_size.filter(|n| *n > 0);
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run `k` concurrent invocations of `operation` and return all `k` results,
    /// in completion order.
    pub async fn fan_out<F, Fut>(&self, k: usize, operation: F) -> Batch
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResult>> + Send + 'static,
    {
        if k == 0 {
            return Batch::default();
        }

        let permits = Arc::new(Semaphore::new(self.pool_size.unwrap_or(k)));
        let operation = Arc::new(operation);
        let mut tasks = JoinSet::new();

        for _ in 0..k {
            let permits = permits.clone();
            let operation = operation.clone();
            let timeout = self.call_timeout;
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await;
                bounded(operation(), timeout).await
            });
        }

        let mut results = Vec::with_capacity(k);
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap_or_else(|e| panicked(&e)));
        }

        tracing::debug!(
            k,
            successes = results.iter().filter(|r| r.success()).count(),
            "fan-out complete"
        );
        Batch::new(results)
    }

    /// Launch each operation once, concurrently. Result `i` belongs to operation `i`.
    pub async fn race(&self, operations: Vec<Operation>) -> Batch {
        if operations.is_empty() {
            return Batch::default();
        }

        let permits = Arc::new(Semaphore::new(
            self.pool_size.unwrap_or(operations.len()),
        ));
        let handles: Vec<_> = operations
            .into_iter()
            .map(|operation| {
                let permits = permits.clone();
                let timeout = self.call_timeout;
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    bounded(operation, timeout).await
                })
            })
            .collect();

        let results = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| panicked(&e)))
            .collect();
        Batch::new(results)
    }
}

/// Await one call under an absolute deadline, folding every outcome into an ApiResult.
async fn bounded<Fut>(call: Fut, timeout: Duration) -> ApiResult
where
    Fut: Future<Output = Result<ApiResult>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "batch member failed");
            ApiResult::from_error(&err, started.elapsed())
        }
        Err(_) => ApiResult::failed(
            "TIMEOUT",
            format!("no response within {:?}", timeout),
            started.elapsed(),
        ),
    }
}

fn panicked(err: &JoinError) -> ApiResult {
    ApiResult::failed("PANICKED", err.to_string(), Duration::ZERO)
}

/// The complete result set of one fan-out or race.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    results: Vec<ApiResult>,
}

impl Batch {
    pub fn new(results: Vec<ApiResult>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[ApiResult] {
        &self.results
    }

    pub fn get(&self, index: usize) -> Option<&ApiResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ApiResult> {
        self.results.iter()
    }

    pub fn into_results(self) -> Vec<ApiResult> {
        self.results
    }

    pub fn successes(&self) -> impl Iterator<Item = &ApiResult> {
        self.results.iter().filter(|r| r.success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ApiResult> {
        self.results.iter().filter(|r| !r.success())
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    /// Non-empty identifiers from successful members, duplicates kept.
    ///
    /// The extractor returns `Ok(None)` for a response that carries no
    /// identifier and an error for a response it cannot interpret at all.
    pub fn identifiers<F>(&self, extract: F) -> Result<Vec<ResourceHandle>>
    where
        F: Fn(&ApiResult) -> Result<Option<ResourceHandle>>,
    {
        let mut out = Vec::new();
        for result in self.successes() {
            if let Some(handle) = extract(result)?
                && !handle.is_empty()
            {
                out.push(handle);
            }
        }
        Ok(out)
    }

    pub fn distinct_identifiers<F>(&self, extract: F) -> Result<BTreeSet<ResourceHandle>>
    where
        F: Fn(&ApiResult) -> Result<Option<ResourceHandle>>,
    {
        Ok(self.identifiers(extract)?.into_iter().collect())
    }

    /// `(http status, code)` per member, for diagnostics.
    pub fn outcomes(&self) -> Vec<String> {
        self.results
            .iter()
            .map(|r| match r.status {
                Some(status) => format!("{}/{}", status, r.code()),
                None => r.code().to_string(),
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a ApiResult;
    type IntoIter = std::slice::Iter<'a, ApiResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
