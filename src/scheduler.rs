//! Recurring tasks
//!
//! The host owns the scheduler; components only keep the [`TaskHandle`] of
//! what they scheduled and cancel it when they go away.
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::debug;

use crate::error::{Error, Result};

pub type Task = Box<dyn FnMut() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `task` after `initial`, then every `period` measured from the
    /// previous scheduled start. An overrun makes the next run start at once.
    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle>;

    /// Run `task` after `initial`, then `period` after each run completes.
    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle>;
}

fn check_period(period: Duration) -> Result<()> {
    if period == Duration::from_secs(0) {
        return Err(Error::Schedule("period must be greater than zero"));
    }
    Ok(())
}

/// Outcome of [`TaskHandle::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// No run was in progress; none will start
    Cancelled,
    /// A run was in progress and completes; none will start afterwards
    RacedExecution,
    AlreadyCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Cancelled,
}

#[derive(Debug)]
struct TaskState {
    phase: Mutex<Phase>,
    wake: Condvar,
}

impl TaskState {
    fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the running phase unless cancelled
    fn begin(&self) -> bool {
        let mut phase = self.lock();
        if *phase == Phase::Idle {
            *phase = Phase::Running;
            true
        } else {
            false
        }
    }

    /// Leave the running phase; false once cancelled
    fn finish(&self) -> bool {
        let mut phase = self.lock();
        if *phase == Phase::Running {
            *phase = Phase::Idle;
            true
        } else {
            false
        }
    }

    fn cancel(&self) -> Cancellation {
        let mut phase = self.lock();
        let outcome = match *phase {
            Phase::Idle => Cancellation::Cancelled,
            Phase::Running => Cancellation::RacedExecution,
            Phase::Cancelled => Cancellation::AlreadyCancelled,
        };
        *phase = Phase::Cancelled;
        self.wake.notify_all();
        outcome
    }

    fn is_cancelled(&self) -> bool {
        *self.lock() == Phase::Cancelled
    }

    /// Block until `deadline`; false when woken by cancellation
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut phase = self.lock();
        loop {
            if *phase == Phase::Cancelled {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            phase = self
                .wake
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Owned handle to a scheduled task
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(TaskState::new()),
        }
    }

    pub fn cancel(&self) -> Cancellation {
        self.state.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("phase", &*self.state.lock())
            .finish()
    }
}

/// Runs every task on its own named thread
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    name: String,
}

impl ThreadScheduler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn spawn(
        &self,
        initial: Duration,
        period: Duration,
        fixed_rate: bool,
        mut task: Task,
    ) -> Result<TaskHandle> {
        check_period(period)?;
        let handle = TaskHandle::new();
        let state = Arc::clone(&handle.state);

        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut next = Instant::now() + initial;
                while state.sleep_until(next) && state.begin() {
                    task();
                    if !state.finish() {
                        break;
                    }
                    next = if fixed_rate {
                        next + period
                    } else {
                        Instant::now() + period
                    };
                }
                debug!("Scheduled task stopped");
            })?;

        Ok(handle)
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new("iotivity-scheduler")
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle> {
        self.spawn(initial, period, true, task)
    }

    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle> {
        self.spawn(initial, period, false, task)
    }
}

struct ManualTask {
    due: Duration,
    period: Duration,
    handle: TaskHandle,
    task: Option<Task>,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    tasks: Vec<ManualTask>,
}

/// Fake clock: tasks only run inside [`ManualScheduler::advance`]
///
/// Runs take no time on this clock, so fixed rate and fixed delay behave
/// the same.
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<ManualClock>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().now
    }

    /// Run whatever is due right now
    pub fn run_pending(&self) {
        self.advance(Duration::from_secs(0));
    }

    /// Move the clock forward, running every task that falls due on the way
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;

        loop {
            let (index, mut task, handle) = {
                let mut clock = self.lock();
                clock.tasks.retain(|t| !t.handle.is_cancelled());
                let next = clock
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target && t.task.is_some())
                    .min_by_key(|(_, t)| t.due)
                    .map(|(index, _)| index);
                let index = match next {
                    Some(index) => index,
                    None => break,
                };
                let entry = &mut clock.tasks[index];
                let due = entry.due;
                let task = entry.task.take();
                let handle = entry.handle.clone();
                clock.now = due;
                (index, task, handle)
            };

            if let Some(run) = task.as_mut() {
                if handle.state.begin() {
                    run();
                    let _ = handle.state.finish();
                }
            }

            let mut clock = self.lock();
            if let Some(entry) = clock.tasks.get_mut(index) {
                if entry.handle.state.is_cancelled() {
                    continue;
                }
                entry.task = task;
                entry.due += entry.period;
            }
        }

        self.lock().now = target;
    }

    fn push(&self, initial: Duration, period: Duration, task: Task) -> Result<TaskHandle> {
        check_period(period)?;
        let handle = TaskHandle::new();
        let mut clock = self.lock();
        let due = clock.now + initial;
        clock.tasks.push(ManualTask {
            due,
            period,
            handle: handle.clone(),
            task: Some(task),
        });
        Ok(handle)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle> {
        self.push(initial, period, task)
    }

    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        period: Duration,
        task: Task,
    ) -> Result<TaskHandle> {
        self.push(initial, period, task)
    }
}
