//! Deferred and repeating work scheduled from inside a rule.
//!
//! Timers belong to the turn of the rule that scheduled them. The runner
//! fires them while it waits for that rule's callback and drops whatever is
//! left once the turn ends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mlua::{Function, Lua, Table};
use tokio::time::Instant;

/// Largest delay accepted from rule code, matching common JS runtimes.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Timer {
    due: Instant,
    callback: Function,
    period: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    timers: BTreeMap<i64, Timer>,
    next_id: i64,
}

pub(crate) type SharedTimers = Arc<Mutex<TimerQueue>>;

pub(crate) fn lock(timers: &SharedTimers) -> MutexGuard<'_, TimerQueue> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TimerQueue {
    pub(crate) fn schedule(
        &mut self,
        callback: Function,
        delay: Duration,
        period: Option<Duration>,
    ) -> i64 {
        self.next_id += 1;
        self.timers.insert(
            self.next_id,
            Timer {
                due: Instant::now() + delay,
                callback,
                period,
            },
        );
        self.next_id
    }

    pub(crate) fn cancel(&mut self, id: i64) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.timers.values().map(|timer| timer.due).min()
    }

    /// Earliest timer, ties broken by scheduling order. One-shot timers
    /// leave the queue here; repeating ones stay until cancelled.
    pub(crate) fn take_next(&mut self) -> Option<(i64, Function)> {
        let id = self
            .timers
            .iter()
            .min_by_key(|(id, timer)| (timer.due, **id))
            .map(|(id, _)| *id)?;
        let repeating = self.timers.get(&id)?.period.is_some();
        if repeating {
            self.timers.get(&id).map(|timer| (id, timer.callback.clone()))
        } else {
            self.timers.remove(&id).map(|timer| (id, timer.callback))
        }
    }

    /// Push a repeating timer to its next period. No-op if it was cancelled
    /// while firing.
    pub(crate) fn rearm(&mut self, id: i64) {
        if let Some(timer) = self.timers.get_mut(&id) {
            if let Some(period) = timer.period {
                timer.due += period;
            }
        }
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.timers.len();
        self.timers.clear();
        dropped
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

fn delay_from(ms: Option<f64>) -> Duration {
    match ms {
        Some(ms) if ms.is_finite() && ms > 0.0 => {
            Duration::from_secs_f64(ms.min(MAX_DELAY_MS) / 1000.0)
        }
        _ => Duration::ZERO,
    }
}

/// Bind `setTimeout`, `setInterval`, `setImmediate` and their `clear*`
/// counterparts into `env`.
pub(crate) fn install(lua: &Lua, env: &Table, timers: &SharedTimers) -> mlua::Result<()> {
    let queue = Arc::clone(timers);
    env.raw_set(
        "setTimeout",
        lua.create_function(move |_, (callback, ms): (Function, Option<f64>)| {
            Ok(lock(&queue).schedule(callback, delay_from(ms), None))
        })?,
    )?;

    let queue = Arc::clone(timers);
    env.raw_set(
        "setInterval",
        lua.create_function(move |_, (callback, ms): (Function, Option<f64>)| {
            let period = delay_from(ms).max(MIN_INTERVAL);
            Ok(lock(&queue).schedule(callback, period, Some(period)))
        })?,
    )?;

    let queue = Arc::clone(timers);
    env.raw_set(
        "setImmediate",
        lua.create_function(move |_, callback: Function| {
            Ok(lock(&queue).schedule(callback, Duration::ZERO, None))
        })?,
    )?;

    for name in ["clearTimeout", "clearInterval", "clearImmediate"] {
        let queue = Arc::clone(timers);
        env.raw_set(
            name,
            lua.create_function(move |_, id: Option<i64>| {
                Ok(id.is_some_and(|id| lock(&queue).cancel(id)))
            })?,
        )?;
    }

    Ok(())
}
