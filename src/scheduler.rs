// In-process periodic scheduler.
//
// Ticks are aligned to even wall-clock boundaries so the schedule is
// predictable regardless of when the server started. Task periods are in
// minutes, anchored at midnight. Each task carries its own mutex: a tick
// that finds the previous run still in flight drops the cycle rather than
// queue behind it.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const TICK_RATE_SECONDS: u64 = 15;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub struct ScheduledTask {
    name: String,
    period_minutes: i64,
    next_run: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    run: TaskFn,
    busy: Arc<tokio::sync::Mutex<()>>,
}

/// Next cycle boundary after `now`, measured in whole periods from a
/// reference point (typically midnight).
pub fn calculate_next_cycle(
    now: DateTime<Utc>,
    reference: DateTime<Utc>,
    period_minutes: i64,
) -> DateTime<Utc> {
    let minutes_since_reference = (now - reference).num_seconds() / 60;
    let minutes_until_cycle = period_minutes - (minutes_since_reference % period_minutes);
    now + ChronoDuration::minutes(minutes_until_cycle)
}

fn truncate_to_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn midnight_of(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, period_minutes: i64, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = truncate_to_minute(Utc::now());
        let next_run = calculate_next_cycle(now, midnight_of(now), period_minutes.max(1));
        self.tasks.push(ScheduledTask {
            name: name.into(),
            period_minutes: period_minutes.max(1),
            next_run,
            last_run: None,
            run: Arc::new(move || -> TaskFuture { Box::pin(task()) }),
            busy: Arc::new(tokio::sync::Mutex::new(())),
        });
    }

    fn dispatch(task: &ScheduledTask) {
        let name = task.name.clone();
        let run = Arc::clone(&task.run);
        let busy = Arc::clone(&task.busy);
        tokio::spawn(async move {
            match busy.try_lock() {
                Ok(_guard) => {
                    debug!(task = %name, "scheduler dispatching task");
                    run().await;
                }
                Err(_) => {
                    error!(task = %name, "previous run still in flight; dropping cycle");
                }
            }
        });
    }

    /// Advance all tasks to `now`. Exposed for tests; the spawned loop
    /// calls this every tick.
    pub fn run_due_tasks(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let now = truncate_to_minute(now);
        let mut dispatched = Vec::new();
        for task in &mut self.tasks {
            if task.last_run == Some(now) {
                continue;
            }
            if task.last_run.is_none() {
                Self::dispatch(task);
                task.last_run = Some(now);
                dispatched.push(task.name.clone());
                info!(task = %task.name, "initial run");
            } else if task.last_run.is_some_and(|last| last >= task.next_run) {
                // Fell behind; skip the missed cycle rather than run late.
                task.next_run = calculate_next_cycle(now, task.next_run, task.period_minutes);
                error!(
                    task = %task.name,
                    "task fell behind, skipping ahead to next scheduled cycle"
                );
            } else if now >= task.next_run {
                Self::dispatch(task);
                task.next_run += ChronoDuration::minutes(task.period_minutes);
                task.last_run = Some(now);
                dispatched.push(task.name.clone());
            }
        }
        dispatched
    }

    /// Run the tick loop until the returned handle is aborted (at
    /// shutdown, before the database pool is disposed).
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tick = std::time::Duration::from_secs(TICK_RATE_SECONDS);
            // Align the first tick to an even wall-clock boundary.
            let now = Utc::now();
            let seconds_into_hour = (now.minute() * 60 + now.second()) as u64;
            let until_boundary =
                TICK_RATE_SECONDS - (seconds_into_hour % TICK_RATE_SECONDS);
            tokio::time::sleep(std::time::Duration::from_secs(until_boundary)).await;
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Utc::now();
                debug!(%now, "scheduler tick");
                self.run_due_tasks(now);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_calculate_next_cycle_anchors_to_reference() {
        let midnight = at(0, 0);
        // At 00:07 with a 5-minute period the next boundary is 00:10.
        assert_eq!(calculate_next_cycle(at(0, 7), midnight, 5), at(0, 10));
        // Exactly on a boundary advances a full period.
        assert_eq!(calculate_next_cycle(at(0, 10), midnight, 5), at(0, 15));
        assert_eq!(calculate_next_cycle(at(13, 59), midnight, 60), at(14, 0));
    }

    #[tokio::test]
    async fn test_first_tick_runs_immediately_then_respects_period() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let mut scheduler = Scheduler::new();
        scheduler.register("counter", 5, || async {
            RUNS.fetch_add(1, Ordering::SeqCst);
        });
        // Never run: dispatches on the first tick.
        let dispatched = scheduler.run_due_tasks(at(10, 2));
        assert_eq!(dispatched, vec!["counter".to_string()]);
        // Same minute: skipped.
        assert!(scheduler.run_due_tasks(at(10, 2)).is_empty());
    }

    #[tokio::test]
    async fn test_task_runs_again_at_next_cycle() {
        let mut scheduler = Scheduler::new();
        scheduler.register("t", 5, || async {});
        // Pin the schedule to a known timeline.
        scheduler.tasks[0].next_run = at(10, 5);
        scheduler.tasks[0].last_run = Some(at(10, 0));

        // Before the boundary: nothing.
        assert!(scheduler.run_due_tasks(at(10, 4)).is_empty());
        // At the boundary: dispatched, next_run advances.
        assert_eq!(scheduler.run_due_tasks(at(10, 5)).len(), 1);
        assert_eq!(scheduler.tasks[0].next_run, at(10, 10));
        assert_eq!(scheduler.tasks[0].last_run, Some(at(10, 5)));
    }

    #[tokio::test]
    async fn test_fell_behind_skips_missed_cycle() {
        let mut scheduler = Scheduler::new();
        scheduler.register("t", 5, || async {});
        // last_run ahead of next_run models a run that happened while the
        // clock slipped past several boundaries.
        scheduler.tasks[0].next_run = at(10, 5);
        scheduler.tasks[0].last_run = Some(at(10, 7));

        let dispatched = scheduler.run_due_tasks(at(10, 12));
        assert!(dispatched.is_empty());
        // Skipped ahead to the boundary after 10:12 on the 5-minute grid
        // anchored at 10:05.
        assert_eq!(scheduler.tasks[0].next_run, at(10, 15));
    }
}
