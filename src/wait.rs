use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Read-only snapshot of a remote long-running operation (an agent
/// deployment, an assistant run, or a generated response). The remote
/// service owns the state; we only hold what the last fetch returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub status: String,
    /// Raw response body, kept so callers can extract output once the
    /// operation is terminal.
    pub body: Value,
}

impl Operation {
    pub fn from_body(body: Value) -> Self {
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        Self { id, status, body }
    }
}

/// Immutable configuration for a single wait call.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    timeout: Duration,
    poll_interval: Duration,
    terminal_statuses: BTreeSet<String>,
}

impl PollPolicy {
    pub fn new<I, S>(timeout: Duration, poll_interval: Duration, terminal_statuses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if timeout.is_zero() {
            anyhow::bail!("poll timeout must be positive");
        }
        if poll_interval.is_zero() {
            anyhow::bail!("poll interval must be positive");
        }
        let terminal_statuses: BTreeSet<String> = terminal_statuses
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        if terminal_statuses.is_empty() {
            anyhow::bail!("terminal status set must not be empty");
        }
        Ok(Self { timeout, poll_interval, terminal_statuses })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Services report statuses in mixed case (ARM uses PascalCase), so
    /// membership is case-insensitive.
    pub fn is_terminal(&self, status: &str) -> bool {
        self.terminal_statuses.contains(&status.to_ascii_lowercase())
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("operation {id} still '{last_status}' after {elapsed:.1?} (budget {timeout:?})")]
    Timeout {
        id: String,
        elapsed: Duration,
        timeout: Duration,
        last_status: String,
    },
    #[error("status fetch failed: {0}")]
    Upstream(#[source] anyhow::Error),
}

/// Poll `fetch_status` until the operation reaches one of the policy's
/// terminal statuses, or the budget runs out.
///
/// The first fetch happens before the first sleep, so an already-terminal
/// operation returns immediately. The timeout is checked strictly after a
/// fetch; a fetch that itself outlives the budget still gets evaluated
/// once. Whether a terminal status means success is the caller's problem:
/// `failed` and `cancelled` snapshots are returned just like `completed`
/// ones. Fetch failures propagate immediately as `Upstream`, untouched.
pub async fn wait<F, Fut>(
    operation_id: &str,
    mut fetch_status: F,
    policy: &PollPolicy,
) -> Result<Operation, WaitError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Operation>>,
{
    let start = Instant::now();
    loop {
        let op = fetch_status(operation_id.to_string())
            .await
            .map_err(WaitError::Upstream)?;
        if policy.is_terminal(&op.status) {
            return Ok(op);
        }
        let elapsed = start.elapsed();
        if elapsed > policy.timeout() {
            return Err(WaitError::Timeout {
                id: operation_id.to_string(),
                elapsed,
                timeout: policy.timeout(),
                last_status: op.status,
            });
        }
        sleep(policy.poll_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const RUN_TERMINAL: [&str; 4] = ["completed", "failed", "cancelled", "expired"];

    fn op(status: &str) -> Operation {
        Operation {
            id: "op_123".to_string(),
            status: status.to_string(),
            body: Value::Null,
        }
    }

    fn policy(timeout_secs: u64, interval_secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
            RUN_TERMINAL,
        )
        .unwrap()
    }

    #[test]
    fn policy_rejects_bad_preconditions() {
        assert!(PollPolicy::new(Duration::ZERO, Duration::from_secs(1), RUN_TERMINAL).is_err());
        assert!(PollPolicy::new(Duration::from_secs(1), Duration::ZERO, RUN_TERMINAL).is_err());
        let empty: [&str; 0] = [];
        assert!(PollPolicy::new(Duration::from_secs(1), Duration::from_secs(1), empty).is_err());
    }

    #[test]
    fn terminal_membership_is_case_insensitive() {
        let policy = PollPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            ["Succeeded", "Failed"],
        )
        .unwrap();
        assert!(policy.is_terminal("succeeded"));
        assert!(policy.is_terminal("FAILED"));
        assert!(!policy.is_terminal("running"));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_on_first_fetch_returns_with_zero_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let start = Instant::now();

        let result = wait(
            "op_123",
            move |_id| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(op("completed"))
                }
            },
            &policy(60, 5),
        )
        .await
        .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_times_out_within_one_interval_of_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);

        let err = wait(
            "op_123",
            move |_id| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(op("in_progress"))
                }
            },
            &policy(10, 3),
        )
        .await
        .unwrap_err();

        match err {
            WaitError::Timeout { id, elapsed, last_status, .. } => {
                assert_eq!(id, "op_123");
                assert_eq!(last_status, "in_progress");
                assert!(elapsed >= Duration::from_secs(10));
                assert!(elapsed <= Duration::from_secs(13));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        // Fetches at t = 0, 3, 6, 9, then the one that trips the budget.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_lands_exactly_on_budget_gets_one_more_poll() {
        // elapsed == timeout is not a timeout; the loop sleeps once more and
        // the next fetch (at timeout + interval) reports the failure.
        let err = wait(
            "op_123",
            |_id| async { Ok(op("queued")) },
            &policy(10, 5),
        )
        .await
        .unwrap_err();

        match err {
            WaitError::Timeout { elapsed, .. } => {
                assert_eq!(elapsed, Duration::from_secs(15));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_pending_completed_takes_exactly_three_fetches() {
        let statuses = Arc::new(Mutex::new(
            vec!["queued", "in_progress", "completed"].into_iter(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&statuses);
        let c = Arc::clone(&calls);

        let result = wait(
            "op_123",
            move |_id| {
                let s = Arc::clone(&s);
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let status = s.lock().unwrap().next().expect("fetched past scripted statuses");
                    Ok(op(status))
                }
            },
            &policy(60, 1),
        )
        .await
        .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_propagates_without_another_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);

        let err = wait(
            "op_123",
            move |_id| {
                let c = Arc::clone(&c);
                async move {
                    match c.fetch_add(1, Ordering::SeqCst) {
                        0 => Ok(op("queued")),
                        _ => Err(anyhow::anyhow!("gateway returned 503")),
                    }
                }
            },
            &policy(60, 1),
        )
        .await
        .unwrap_err();

        match err {
            WaitError::Upstream(source) => {
                assert_eq!(source.to_string(), "gateway returned 503");
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_are_spaced_at_least_one_interval_apart() {
        let times = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&times);

        let _ = wait(
            "op_123",
            move |_id| {
                let t = Arc::clone(&t);
                async move {
                    t.lock().unwrap().push(Instant::now());
                    Ok(op("in_progress"))
                }
            },
            &policy(20, 5),
        )
        .await;

        let times = times.lock().unwrap();
        assert!(times.len() >= 2);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_twice_on_a_terminal_operation_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            let c = Arc::clone(&calls);
            let snapshot = wait(
                "op_123",
                move |_id| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(op("failed"))
                    }
                },
                &policy(60, 1),
            )
            .await
            .unwrap();
            snapshots.push(snapshot);
        }

        assert_eq!(snapshots[0], snapshots[1]);
        // One fetch per wait call, nothing extra on the second.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn operation_projection_defaults_missing_status() {
        let body = serde_json::json!({"id": "resp_42"});
        let op = Operation::from_body(body);
        assert_eq!(op.id, "resp_42");
        assert_eq!(op.status, "unknown");
    }
}
