//! Cooperative cancellation for bounded computations.
//!
//! Search loops poll [`Deadline::expired`] once per iteration. A deadline
//! created with [`Deadline::never`] never fires, so iteration budgets remain
//! the only bound.

use crate::PilotContext;
use std::fmt;
use std::time::Duration;

/// A point in context time after which work should stop.
#[derive(Clone, Copy)]
pub struct Deadline<'a> {
    clock: Option<(&'a dyn PilotContext, Duration)>,
}

impl<'a> Deadline<'a> {
    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { clock: None }
    }

    /// A deadline `budget` after the context's current time.
    pub fn within(ctx: &'a dyn PilotContext, budget: Duration) -> Self {
        Self {
            clock: Some((ctx, ctx.now() + budget)),
        }
    }

    /// Builds a deadline only when both a context and a budget are present.
    pub fn optional(ctx: Option<&'a dyn PilotContext>, budget: Option<Duration>) -> Self {
        match (ctx, budget) {
            (Some(ctx), Some(budget)) => Self::within(ctx, budget),
            _ => Self::never(),
        }
    }

    /// True once the context clock has reached the deadline.
    pub fn expired(&self) -> bool {
        match self.clock {
            Some((ctx, at)) => ctx.now() >= at,
            None => false,
        }
    }

    /// Time left, or `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.clock.map(|(ctx, at)| at.saturating_sub(ctx.now()))
    }

    /// Whether this deadline can ever fire.
    pub fn is_bounded(&self) -> bool {
        self.clock.is_some()
    }
}

impl fmt::Debug for Deadline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.clock {
            Some((_, at)) => f.debug_struct("Deadline").field("at", &at).finish(),
            None => f.write_str("Deadline(never)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl PilotContext for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn seed(&self) -> u64 {
            7
        }
    }

    #[test]
    fn test_never_does_not_expire() {
        let deadline = Deadline::never();
        assert!(!deadline.expired());
        assert!(deadline.remaining().is_none());
        assert!(!deadline.is_bounded());
    }

    #[test]
    fn test_deadline_fires_after_budget() {
        let clock = ManualClock {
            now: Mutex::new(Duration::ZERO),
        };
        let deadline = Deadline::within(&clock, Duration::from_millis(100));
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(100)));

        clock.advance(Duration::from_millis(60));
        assert!(!deadline.expired());

        clock.advance(Duration::from_millis(40));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_optional_requires_both_parts() {
        let clock = ManualClock {
            now: Mutex::new(Duration::ZERO),
        };
        let ctx: &dyn PilotContext = &clock;
        assert!(!Deadline::optional(Some(ctx), None).is_bounded());
        assert!(!Deadline::optional(None, Some(Duration::from_secs(1))).is_bounded());
        assert!(Deadline::optional(Some(ctx), Some(Duration::from_secs(1))).is_bounded());
    }
}
