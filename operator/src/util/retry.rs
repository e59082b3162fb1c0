use super::Error;
use std::future::Future;
use std::time::{Duration, Instant};

/// Deadline and backoff for conflict retries on node mutations: re-fetch
/// and retry up to a 5-second deadline with 750 ms backoff.
const CONFLICT_RETRY_DEADLINE: Duration = Duration::from_secs(5);
const CONFLICT_RETRY_BACKOFF: Duration = Duration::from_millis(750);

fn is_conflict(err: &Error) -> bool {
    matches!(
        err,
        Error::Kube(kube::Error::Api(ae)) if ae.code == 409
    )
}

/// Retries `f` while it fails with a 409 Conflict, until `CONFLICT_RETRY_DEADLINE`
/// has elapsed. Any other error (including a non-conflict API error) is
/// returned immediately.
pub async fn retry_conflict<T, F, Fut>(mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let deadline = Instant::now() + CONFLICT_RETRY_DEADLINE;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && Instant::now() < deadline => {
                tokio::time::sleep(CONFLICT_RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, Error> = retry_conflict(|| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_conflict_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, Error> = retry_conflict(|| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::UserInput("nope".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
