//! Drift-free periodic scheduler.
//!
//! The scheduler ticks on wall-clock boundaries (every 15 seconds by
//! default). Each wait is computed from a fresh read of the clock, so delays
//! never accumulate. Ticks on the minute are write ticks; the others only
//! refresh caches.
//!
//! Tasks are matched against the tick's hour and minute like a tiny crontab.
//! A task that fails is logged and the loop carries on.

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::observability::metrics;

/// Something the scheduler can fire.
pub trait Trigger: Send + Sync {
    /// Fire for the tick at `tick`. `do_write` authorizes flushing to disk.
    fn trigger(&self, tick: DateTime<Utc>, do_write: bool) -> Result<()>;
}

/// Tick cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// Ticks fall on epoch seconds divisible by this.
    pub tick_seconds: u64,
    /// Ticks on epoch seconds divisible by this are write ticks.
    pub write_seconds: u64,
}

impl Default for TickPlan {
    fn default() -> Self {
        Self { tick_seconds: 15, write_seconds: 60 }
    }
}

impl TickPlan {
    /// Every tick is a write tick; there is no separate cache tier.
    pub fn single_rate(seconds: u64) -> Self {
        Self { tick_seconds: seconds.max(1), write_seconds: seconds.max(1) }
    }

    /// First tick strictly after `now`.
    pub fn next_tick(&self, now: DateTime<Utc>) -> Tick {
        let tick_seconds = self.tick_seconds.max(1) as i64;
        let mut at = now.duration_trunc(Duration::seconds(1)).unwrap_or(now);
        loop {
            at += Duration::seconds(1);
            if at.timestamp().rem_euclid(tick_seconds) == 0 {
                break;
            }
        }
        let write = at.timestamp().rem_euclid(self.write_seconds.max(1) as i64) == 0;
        Tick { at, write }
    }
}

/// One scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub at: DateTime<Utc>,
    pub write: bool,
}

/// Hour or minute match, `*` or an exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeMatch {
    #[default]
    Any,
    Exact(u32),
}

impl TimeMatch {
    pub fn matches(&self, value: u32) -> bool {
        match self {
            TimeMatch::Any => true,
            TimeMatch::Exact(v) => *v == value,
        }
    }
}

/// A registered task.
#[derive(Clone)]
pub struct ScheduledTask {
    name: String,
    hour: TimeMatch,
    minute: TimeMatch,
    at_startup: bool,
    write_only: bool,
    every_seconds: Option<u64>,
    target: Arc<dyn Trigger>,
}

impl ScheduledTask {
    /// A task firing on every tick.
    pub fn new(name: impl Into<String>, target: Arc<dyn Trigger>) -> Self {
        Self {
            name: name.into(),
            hour: TimeMatch::Any,
            minute: TimeMatch::Any,
            at_startup: false,
            write_only: false,
            every_seconds: None,
            target,
        }
    }

    pub fn hour(mut self, hour: TimeMatch) -> Self {
        self.hour = hour;
        self
    }

    pub fn minute(mut self, minute: TimeMatch) -> Self {
        self.minute = minute;
        self
    }

    /// Also fire once, as a write, when the scheduler starts.
    pub fn at_startup(mut self) -> Self {
        self.at_startup = true;
        self
    }

    /// Only fire on write ticks.
    pub fn write_only(mut self) -> Self {
        self.write_only = true;
        self
    }

    /// Only fire on ticks whose epoch seconds are a multiple of `seconds`.
    pub fn every_seconds(mut self, seconds: u64) -> Self {
        self.every_seconds = Some(seconds.max(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_due(&self, tick: &Tick) -> bool {
        let aligned = self
            .every_seconds
            .map_or(true, |period| tick.at.timestamp().rem_euclid(period as i64) == 0);

        self.hour.matches(tick.at.hour())
            && self.minute.matches(tick.at.minute())
            && (tick.write || !self.write_only)
            && aligned
    }

    fn fire(&self, at: DateTime<Utc>, write: bool) {
        if let Err(e) = self.target.trigger(at, write) {
            warn!(task = %self.name, error = %e, "scheduled task failed");
        }
    }
}

/// The top-level timer.
pub struct Scheduler {
    plan: TickPlan,
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new(plan: TickPlan) -> Self {
        Self { plan, tasks: Vec::new() }
    }

    pub fn register(&mut self, task: ScheduledTask) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn plan(&self) -> TickPlan {
        self.plan
    }

    /// Fire every startup task as a write. Returns the names fired.
    pub fn start(&self, now: DateTime<Utc>) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|task| task.at_startup)
            .map(|task| {
                task.fire(now, true);
                task.name()
            })
            .collect()
    }

    /// Fire every task due on `tick`, each at most once. Returns the names fired.
    pub fn fire(&self, tick: &Tick) -> Vec<&str> {
        metrics::record_tick(tick.write);
        self.tasks
            .iter()
            .filter(|task| task.is_due(tick))
            .map(|task| {
                task.fire(tick.at, tick.write);
                task.name()
            })
            .collect()
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let started = self.start(Utc::now());
        info!(tasks = self.tasks.len(), ?started, plan = ?self.plan, "scheduler started");

        let mut last: Option<DateTime<Utc>> = None;
        loop {
            let now = Utc::now();
            // Never hand out the same tick twice, even if the clock stepped back.
            let from = last.map_or(now, |last| now.max(last));
            let tick = self.plan.next_tick(from);
            let delay = (tick.at - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("scheduler stopping");
                    return;
                }
            }

            let fired = self.fire(&tick);
            debug!(tick = %tick.at, write = tick.write, ?fired, "tick");
            last = Some(tick.at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UsageError;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(DateTime<Utc>, bool)>>,
        fail: bool,
    }

    impl Trigger for Recorder {
        fn trigger(&self, tick: DateTime<Utc>, do_write: bool) -> Result<()> {
            self.calls.lock().unwrap().push((tick, do_write));
            if self.fail {
                return Err(UsageError::Internal("handler failed".into()));
            }
            Ok(())
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_next_tick_quarter_minutes() {
        let plan = TickPlan::default();
        let tick = plan.next_tick(at(12, 0, 3) + Duration::milliseconds(250));
        assert_eq!(tick, Tick { at: at(12, 0, 15), write: false });

        let tick = plan.next_tick(at(12, 0, 47));
        assert_eq!(tick, Tick { at: at(12, 1, 0), write: true });
    }

    #[test]
    fn test_next_tick_is_strictly_after_boundary() {
        let plan = TickPlan::default();
        assert_eq!(plan.next_tick(at(12, 0, 15)).at, at(12, 0, 30));
        assert_eq!(plan.next_tick(at(12, 0, 59) + Duration::milliseconds(999)).at, at(12, 1, 0));
    }

    #[test]
    fn test_single_rate_every_tick_writes() {
        let plan = TickPlan::single_rate(60);
        let tick = plan.next_tick(at(12, 0, 5));
        assert_eq!(tick, Tick { at: at(12, 1, 0), write: true });
    }

    #[test]
    fn test_one_write_tick_per_minute() {
        let plan = TickPlan::default();
        let mut now = at(12, 0, 0);
        let mut writes = 0;
        for _ in 0..8 {
            let tick = plan.next_tick(now);
            writes += tick.write as usize;
            now = tick.at;
        }
        assert_eq!(now, at(12, 2, 0));
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_fire_matches_hour_minute_and_write() {
        let usage = Arc::new(Recorder::default());
        let compaction = Arc::new(Recorder::default());
        let nightly = Arc::new(Recorder::default());

        let mut scheduler = Scheduler::new(TickPlan::default());
        scheduler
            .register(ScheduledTask::new("usage", usage.clone()))
            .register(ScheduledTask::new("compaction", compaction.clone()).write_only())
            .register(
                ScheduledTask::new("nightly", nightly.clone())
                    .hour(TimeMatch::Exact(3))
                    .minute(TimeMatch::Exact(30))
                    .write_only(),
            );

        let fired = scheduler.fire(&Tick { at: at(12, 0, 15), write: false });
        assert_eq!(fired, ["usage"]);

        let fired = scheduler.fire(&Tick { at: at(12, 1, 0), write: true });
        assert_eq!(fired, ["usage", "compaction"]);

        let fired = scheduler.fire(&Tick { at: at(3, 30, 0), write: true });
        assert_eq!(fired, ["usage", "compaction", "nightly"]);

        assert_eq!(*usage.calls.lock().unwrap(), [
            (at(12, 0, 15), false),
            (at(12, 1, 0), true),
            (at(3, 30, 0), true)
        ]);
        assert_eq!(compaction.calls.lock().unwrap().len(), 2);
        assert_eq!(nightly.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_every_seconds_gate() {
        let rotate = Arc::new(Recorder::default());
        let mut scheduler = Scheduler::new(TickPlan::single_rate(60));
        scheduler.register(ScheduledTask::new("rotate", rotate.clone()).every_seconds(300));

        assert!(scheduler.fire(&Tick { at: at(12, 1, 0), write: true }).is_empty());
        assert_eq!(scheduler.fire(&Tick { at: at(12, 5, 0), write: true }), ["rotate"]);
    }

    #[test]
    fn test_startup_fires_as_write() {
        let usage = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        let mut scheduler = Scheduler::new(TickPlan::default());
        scheduler
            .register(ScheduledTask::new("usage", usage.clone()).at_startup())
            .register(ScheduledTask::new("other", other.clone()));

        assert_eq!(scheduler.start(at(12, 0, 7)), ["usage"]);
        assert_eq!(*usage.calls.lock().unwrap(), [(at(12, 0, 7), true)]);
        assert!(other.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_keeps_ticking_after_failures() {
        let failing = Arc::new(Recorder { fail: true, ..Recorder::default() });
        let mut scheduler = Scheduler::new(TickPlan::single_rate(1));
        scheduler.register(ScheduledTask::new("failing", failing.clone()).at_startup());

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(2600)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        let calls = failing.calls.lock().unwrap();
        // Startup plus at least two ticks, all distinct.
        assert!(calls.len() >= 3, "only {} calls", calls.len());
        let ticks: Vec<_> = calls.iter().skip(1).map(|(t, _)| *t).collect();
        assert!(ticks.windows(2).all(|w| w[0] < w[1]), "duplicate tick in {ticks:?}");
    }
}
