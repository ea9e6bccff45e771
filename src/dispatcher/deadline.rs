//! Wait-budget arithmetic.
//!
//! The budget of a dispatch is the caller's requested wait, bounded above
//! by a hard ceiling and by whatever remains of the hosting environment's
//! own deadline minus a safety margin. A zero budget means the call must
//! fail fast without publishing anything.

use std::time::Duration;

use tokio::time::Instant;

use crate::DeadlinePolicy;

impl DeadlinePolicy {
    // ---
    /// Effective wait for one dispatch.
    ///
    /// - `requested`: caller's wait; `None` or zero selects `default_wait`
    /// - `env_deadline`: deadline of the surrounding invocation, if known
    ///
    /// Never negative; returns [`Duration::ZERO`] when the environment
    /// deadline is closer than the safety margin.
    pub fn effective_timeout(
        &self,
        requested: Option<Duration>,
        env_deadline: Option<Instant>,
    ) -> Duration {
        // ---
        let requested = match requested {
            Some(wait) if !wait.is_zero() => wait,
            _ => self.default_wait,
        }
        .min(self.ceiling);

        let Some(deadline) = env_deadline else {
            return requested;
        };

        deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(self.safety_margin)
            .min(requested)
    }
}
