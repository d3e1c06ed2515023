use std::future::Future;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use parking_lot::Mutex;

/// Source of local wall-clock time and of sleeping.
///
/// Everything that waits on the wall clock (reader cadence, connect backoff,
/// scheduler polling) goes through this trait so it can be driven by hand.
pub trait Clock: Send + Sync {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Suspend the caller for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Clock backed by the system local time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Clock that only moves when slept on or advanced explicitly.
///
/// Every `sleep` advances the time by the requested duration, records it,
/// and yields once to the runtime.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += to_delta(duration);
    }

    /// All durations passed to `sleep` so far, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        async move {
            self.sleeps.lock().push(duration);
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }
}

/// Time left until the next whole second strictly after `now`.
pub fn until_next_second(now: NaiveDateTime) -> Duration {
    // Leap seconds report nanos >= 1e9.
    let nanos = now.nanosecond().min(999_999_999);
    Duration::from_nanos(u64::from(1_000_000_000 - nanos))
}

/// `now` with seconds and sub-seconds zeroed.
pub fn truncate_to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::zero())
}
