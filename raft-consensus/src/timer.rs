//! Randomized, resettable election timer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, Sleep, sleep};

/// Picks a duration uniformly from `[base, 2 * base)`.
pub fn random_duration(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let base_ms = base.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..base_ms.max(1));
    base + Duration::from_millis(jitter)
}

/// Election timer that fires once per arming and is re-armed with a fresh
/// random deadline on every [`ElectionTimer::reset`].
///
/// Await it through `&mut timer`; polling again after it fired keeps
/// returning ready until it is reset.
#[derive(Debug)]
pub struct ElectionTimer {
    base: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl ElectionTimer {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            sleep: Box::pin(sleep(random_duration(base))),
        }
    }

    pub fn reset(&mut self) {
        let deadline = Instant::now() + random_duration(self.base);
        self.sleep.as_mut().reset(deadline);
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }
}

impl Future for ElectionTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}
