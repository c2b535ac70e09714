//! Retry policies for transport failures and server-requested waits.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::RpcError;

/// Decides how long a retryable request waits before it is resent.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext<'a> {
    /// Consecutive transport failures of this request (1 for flood waits).
    pub fail_count:  NonZeroU32,
    /// Wait the server asked for (`FLOOD_WAIT_n` and friends).
    pub server_wait: Option<Duration>,
    pub error:       &'a RpcError,
}

/// Never retry; every retryable error reaches the fail handler.
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext<'_>) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Doubles transport backoff from `transport_base` up to `transport_cap`,
/// and honours server waits up to `flood_threshold`.
pub struct AutoSleep {
    pub transport_base:  Duration,
    pub transport_cap:   Duration,
    /// Longer server waits are surfaced instead. `None` waits any length.
    pub flood_threshold: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            transport_base:  Duration::from_secs(1),
            transport_cap:   Duration::from_secs(60),
            flood_threshold: None,
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> ControlFlow<(), Duration> {
        if let Some(wait) = ctx.server_wait {
            if self.flood_threshold.is_some_and(|t| wait > t) {
                tracing::info!("[mux/retry] {} exceeds flood threshold", ctx.error.full_name());
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(wait);
        }
        if ctx.error.is_transport() {
            let exp = (ctx.fail_count.get() - 1).min(16);
            let delay = self.transport_base.saturating_mul(1 << exp).min(self.transport_cap);
            tracing::debug!("[mux/retry] transport failure #{}: retry in {delay:?}", ctx.fail_count);
            return ControlFlow::Continue(delay);
        }
        ControlFlow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(error: &RpcError, n: u32, wait: Option<u64>) -> RetryContext<'_> {
        RetryContext {
            fail_count: NonZeroU32::new(n).unwrap(),
            server_wait: wait.map(Duration::from_secs),
            error,
        }
    }

    #[test]
    fn transport_backoff_doubles_and_caps() {
        let policy = AutoSleep::default();
        let err = RpcError::from_telegram(-503, "TRANSPORT");
        let delays: Vec<_> = [1, 2, 3, 7, 8, 40]
            .into_iter()
            .map(|n| policy.should_retry(&ctx(&err, n, None)))
            .collect();
        assert_eq!(
            delays,
            [1, 2, 4, 60, 60, 60].map(|s| ControlFlow::Continue(Duration::from_secs(s))),
        );
    }

    #[test]
    fn server_wait_respects_threshold() {
        let err = RpcError::from_telegram(420, "FLOOD_WAIT_120");
        let policy = AutoSleep { flood_threshold: Some(Duration::from_secs(60)), ..Default::default() };
        assert_eq!(policy.should_retry(&ctx(&err, 1, Some(120))), ControlFlow::Break(()));
        assert_eq!(
            AutoSleep::default().should_retry(&ctx(&err, 1, Some(120))),
            ControlFlow::Continue(Duration::from_secs(120)),
        );
        assert_eq!(NoRetries.should_retry(&ctx(&err, 1, Some(1))), ControlFlow::Break(()));
    }
}
