//! Bounded polling with cooperative cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, DeviceResult};

/// Fail with `Cancelled` if the token has fired.
pub fn checkpoint(cancel: &CancellationToken) -> DeviceResult<()> {
    if cancel.is_cancelled() {
        Err(DeviceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> DeviceResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Re-run `check` every `interval` until it returns `true`.
///
/// Returns `Ok(false)` once `timeout` has passed; errors from `check`
/// propagate immediately.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> DeviceResult<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        checkpoint(cancel)?;
        if check().await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(cancel, interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_true_once_condition_holds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let ok = poll_until(&cancel, Duration::from_secs(10), Duration::from_secs(1), move || async move {
            Ok::<_, DeviceError>(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_false_at_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let ok = poll_until(&cancel, Duration::from_secs(5), Duration::from_secs(1), || async {
            Ok::<_, DeviceError>(false)
        })
        .await
        .unwrap();
        assert!(!ok);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let err = poll_until(&cancel, Duration::from_secs(60), Duration::from_secs(1), || async {
            Ok::<_, DeviceError>(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::Cancelled));
    }

    #[tokio::test]
    async fn check_errors_propagate() {
        let cancel = CancellationToken::new();
        let err = poll_until(&cancel, Duration::from_secs(1), Duration::from_millis(10), || async {
            Err::<bool, _>(DeviceError::Creation("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::Creation(_)));
    }
}
