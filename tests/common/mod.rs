//! Common test utilities shared across integration tests.

use jobline::{JobIndex, JobStorage, now_millis};
use std::time::Duration;

/// Wait for the index to hold no jobs, polling every 10ms.
///
/// # Panics
///
/// Panics if jobs are still stored when the timeout is reached.
pub async fn wait_until_drained<S: JobStorage + ?Sized>(index: &JobIndex<S>, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let remaining = index.get_all_job_specs().await;
        if remaining.is_empty() {
            return;
        }
        if start.elapsed() > timeout {
            let ids: Vec<&str> = remaining.iter().map(|j| j.id.as_str()).collect();
            panic!("Timeout waiting for jobs to drain, still stored: {:?}", ids);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Ids the index would hand out right now.
pub async fn eligible_ids<S: JobStorage + ?Sized>(index: &JobIndex<S>) -> Vec<String> {
    index
        .get_pending_jobs_with_no_dependencies_in_created_order(now_millis())
        .await
        .into_iter()
        .map(|j| j.id.to_string())
        .collect()
}
