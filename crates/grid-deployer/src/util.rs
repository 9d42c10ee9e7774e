use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of a remote call made through [`bounded`].
#[derive(Debug, Error)]
pub enum CallError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Failed(anyhow::Error),
}

impl CallError {
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            CallError::Failed(e) => e,
            other => anyhow::Error::new(other),
        }
    }
}

/// Run a remote call with a timeout, aborting early when `cancel` fires.
pub async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> Result<T, CallError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        res = tokio::time::timeout(timeout, call) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(CallError::Failed(e)),
            Err(_) => Err(CallError::TimedOut(timeout)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_calls() {
        let cancel = CancellationToken::new();
        let res: Result<(), _> = bounded(&cancel, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(CallError::TimedOut(_))));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = bounded(&cancel, Duration::from_secs(1), async { Ok(1) }).await;
        assert!(matches!(res, Err(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn passes_through_errors() {
        let cancel = CancellationToken::new();
        let res: Result<(), _> =
            bounded(&cancel, Duration::from_secs(1), async { Err(anyhow::anyhow!("boom")) }).await;
        assert_eq!(res.unwrap_err().into_anyhow().to_string(), "boom");
    }
}
