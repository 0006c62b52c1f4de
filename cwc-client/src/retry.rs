//! Reconnect backoff policy. A server with active subscriptions is
//! worth reconnecting to aggressively; one nobody is watching is not.

use std::ops::ControlFlow;
use std::time::Duration;

/// What the policy knows about the current connect attempt.
pub struct RetryContext {
    /// Consecutive *connect()* failures since the last successful TCP
    /// connect, starting at 1 for the first failure. Reset to 0 as
    /// soon as a connect succeeds, even if the session fails later —
    /// only a raw connect failure escalates this counter.
    pub attempts: u32,
    pub subscriptions_active: bool,
}

/// Decides how long to wait before the next connect attempt.
/// `ControlFlow::Break` would mean "give up"; the built-in policy never
/// does, but the trait leaves room for one that does.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// The original backoff rule: retry immediately after exactly the
/// *first* connect failure if something is actively subscribed, then
/// every 3 seconds while that stays true (including after a session
/// that connected but then failed); fall back to a lazy 60-second poll
/// once nothing needs the feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CwcBackoff;

impl RetryPolicy for CwcBackoff {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        let delay = if ctx.subscriptions_active {
            if ctx.attempts == 1 { Duration::ZERO } else { Duration::from_secs(3) }
        } else {
            Duration::from_secs(60)
        };
        ControlFlow::Continue(delay)
    }
}
