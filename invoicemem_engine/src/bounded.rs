use invoicemem_core::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Await a store call, failing with [`Error::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(stage: &'static str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                stage,
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        })
}
