use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;

use completion_provider::CancelSignal;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The wrapped future was abandoned because the caller cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cancelled;

pub(crate) fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

/// Drives `future` while polling `cancel` between short waits.
pub(crate) async fn await_or_cancel<F>(
    future: F,
    cancel: Option<&CancelSignal>,
) -> Result<F::Output, Cancelled>
where
    F: Future,
{
    if cancel.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancel) {
            return Err(Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancel) {
                return Err(Cancelled);
            }
            return Ok(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use completion_provider::cancel_signal;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_pending_future() {
        let cancel = cancel_signal();
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::Release);
        });

        let result = await_or_cancel(std::future::pending::<()>(), Some(&cancel)).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn completes_without_signal() {
        assert_eq!(await_or_cancel(async { 7 }, None).await, Ok(7));
    }
}
