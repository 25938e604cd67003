//! Periodic task scheduler driven by a single timer interrupt
//!
//! Tasks are registered with [`Scheduler::schedule_task`] and only start
//! firing once [`Scheduler::dispatch`] commits them. All live tasks share one
//! interrupt source, programmed to the rate of the fastest task; slower tasks
//! accumulate the service interval and fire when they reach their own.
//!
//! The interrupt handler runs concurrently with the main path. It services
//! the task table only while holding its lock and never blocks on it: when
//! the main path owns the lock the tick is recorded and caught up on the next
//! interrupt. [`Scheduler::terminate`] takes the same lock, so a task reported
//! `Terminated` can never run again.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Input clock of the 8253/8254 programmable interval timer
pub const PIT_CLOCK_HZ: u32 = 1_193_182;

/// Number of task slots when no capacity is given
pub const DEFAULT_CAPACITY: usize = 8;

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by the scheduler or its timing source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task table exhausted ({capacity} slots)")]
    SchedulerExhausted { capacity: usize },

    #[error("Invalid task interval: {0}")]
    InvalidInterval(String),

    #[error("Scheduler has been shut down")]
    ShutDown,

    #[error("Timing source error: {0}")]
    Timing(String),
}

/// Handler installed on the hardware timing source
pub type TickHandler = Box<dyn FnMut() + Send>;

/// Periodic callback; runs in interrupt context
pub type TaskCallback = Box<dyn FnMut(&TaskContext) + Send>;

/// A fixed-frequency interrupt source
///
/// Implementations must guarantee that once `remove_handler` returns the
/// handler is not running and will never be called again.
pub trait TimingSource: Send {
    /// Start calling `handler` `frequency_hz` times per second
    fn install_periodic_handler(&mut self, frequency_hz: u32, handler: TickHandler) -> Result<()>;

    /// Reprogram the rate of an installed handler
    fn set_frequency(&mut self, frequency_hz: u32) -> Result<()>;

    /// Stop and drop the installed handler, if any
    fn remove_handler(&mut self);
}

/// Convert a task rate in Hz into an interval of PIT input ticks
pub fn interval_for_rate(rate_hz: u32) -> Result<u32> {
    if rate_hz == 0 || rate_hz > PIT_CLOCK_HZ {
        return Err(SchedulerError::InvalidInterval(format!(
            "rate {} Hz outside 1..={} Hz",
            rate_hz, PIT_CLOCK_HZ
        )));
    }
    Ok(PIT_CLOCK_HZ / rate_hz)
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Scheduled = 0,
    Running = 1,
    Terminated = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Scheduled,
            1 => TaskState::Running,
            _ => TaskState::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Handle returned by [`Scheduler::schedule_task`]
///
/// The state stays observable after the task has left the table.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

enum DeferredRequest {
    Terminate(TaskId),
}

/// Passed to every callback invocation
///
/// Callbacks must not call into the scheduler directly; requests made here
/// are queued and applied on the main path.
pub struct TaskContext {
    task: TaskId,
    deferred: Sender<DeferredRequest>,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn defer_terminate(&self, task: TaskId) {
        // The receiver lives as long as the scheduler, which outlives the handler.
        let _ = self.deferred.send(DeferredRequest::Terminate(task));
    }

    pub fn defer_terminate_self(&self) {
        self.defer_terminate(self.task);
    }
}

struct TimerTask {
    id: TaskId,
    interval_ticks: u32,
    priority: i32,
    count: u64,
    callback: TaskCallback,
    state: Arc<AtomicU8>,
}

impl TimerTask {
    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.id)
            .field("interval_ticks", &self.interval_ticks)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Default)]
struct TaskTable {
    /// Ordered by descending priority, then scheduling order
    live: Vec<TimerTask>,
    /// PIT ticks between two interrupts
    service_interval: u32,
}

impl TaskTable {
    fn insert(&mut self, task: TimerTask) {
        let pos = self
            .live
            .iter()
            .position(|t| (t.priority, std::cmp::Reverse(t.id)) < (task.priority, std::cmp::Reverse(task.id)))
            .unwrap_or(self.live.len());
        self.live.insert(pos, task);
    }

    fn remove(&mut self, id: TaskId) -> Option<TimerTask> {
        let pos = self.live.iter().position(|t| t.id == id)?;
        Some(self.live.remove(pos))
    }

    fn fastest_interval(&self) -> Option<u32> {
        self.live.iter().map(|t| t.interval_ticks).min()
    }

    fn service(&mut self, deferred: &Sender<DeferredRequest>) {
        let step = u64::from(self.service_interval);
        for task in self.live.iter_mut() {
            task.count += step;
            if task.count >= u64::from(task.interval_ticks) {
                task.count -= u64::from(task.interval_ticks);
                let ctx = TaskContext {
                    task: task.id,
                    deferred: deferred.clone(),
                };
                (task.callback)(&ctx);
            }
        }
    }
}

struct Shared {
    table: Mutex<TaskTable>,
    /// Interrupts not yet serviced because the main path held the table
    owed: AtomicU32,
    serviced: AtomicU64,
    deferred: Sender<DeferredRequest>,
}

fn lock_table(shared: &Shared) -> MutexGuard<'_, TaskTable> {
    shared
        .table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Body of the interrupt handler
fn service_interrupt(shared: &Shared) {
    shared.owed.fetch_add(1, Ordering::AcqRel);

    let mut table = match shared.table.try_lock() {
        Ok(table) => table,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => {
            trace!("Timer interrupt deferred, task table busy");
            return;
        }
    };

    let owed = shared.owed.swap(0, Ordering::AcqRel);
    for _ in 0..owed {
        table.service(&shared.deferred);
    }
    shared.serviced.fetch_add(u64::from(owed), Ordering::Relaxed);
}

/// Periodic task scheduler over one [`TimingSource`]
pub struct Scheduler<T: TimingSource> {
    source: T,
    shared: Arc<Shared>,
    pending: Vec<TimerTask>,
    deferred_rx: Receiver<DeferredRequest>,
    capacity: usize,
    next_id: u64,
    service_rate: u32,
    installed: bool,
    shut_down: bool,
}

impl<T: TimingSource> Scheduler<T> {
    pub fn new(source: T) -> Self {
        Self::with_capacity(source, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(source: T, capacity: usize) -> Self {
        let (deferred_tx, deferred_rx) = unbounded();
        Self {
            source,
            shared: Arc::new(Shared {
                table: Mutex::new(TaskTable::default()),
                owed: AtomicU32::new(0),
                serviced: AtomicU64::new(0),
                deferred: deferred_tx,
            }),
            pending: Vec::new(),
            deferred_rx,
            capacity,
            next_id: 1,
            service_rate: 0,
            installed: false,
            shut_down: false,
        }
    }

    /// Register a periodic callback firing every `interval_ticks` PIT ticks
    ///
    /// Higher `priority` tasks run first within one interrupt. The task stays
    /// `Scheduled` until the next [`dispatch`](Self::dispatch).
    pub fn schedule_task<F>(&mut self, callback: F, interval_ticks: u32, priority: i32) -> Result<TaskHandle>
    where
        F: FnMut(&TaskContext) + Send + 'static,
    {
        if self.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        if interval_ticks == 0 {
            return Err(SchedulerError::InvalidInterval("interval must be non-zero".to_string()));
        }

        let occupied = lock_table(&self.shared).live.len() + self.pending.len();
        if occupied >= self.capacity {
            warn!(capacity = self.capacity, "Task table exhausted");
            return Err(SchedulerError::SchedulerExhausted {
                capacity: self.capacity,
            });
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;

        let state = Arc::new(AtomicU8::new(TaskState::Scheduled as u8));
        self.pending.push(TimerTask {
            id,
            interval_ticks,
            priority,
            count: 0,
            callback: Box::new(callback),
            state: Arc::clone(&state),
        });

        debug!(%id, interval_ticks, priority, "Task scheduled");
        Ok(TaskHandle { id, state })
    }

    /// Schedule a task by rate rather than interval
    pub fn schedule_at_rate<F>(&mut self, callback: F, rate_hz: u32, priority: i32) -> Result<TaskHandle>
    where
        F: FnMut(&TaskContext) + Send + 'static,
    {
        let interval = interval_for_rate(rate_hz)?;
        self.schedule_task(callback, interval, priority)
    }

    /// Move pending tasks into the interrupt rotation
    ///
    /// Applies deferred requests first. With nothing pending this is a no-op.
    pub fn dispatch(&mut self) -> Result<()> {
        if self.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        self.service_deferred();

        if self.pending.is_empty() {
            trace!("Dispatch with no pending tasks");
            return Ok(());
        }

        let live_fastest = lock_table(&self.shared).fastest_interval();
        let interval = self
            .pending
            .iter()
            .map(|t| t.interval_ticks)
            .chain(live_fastest)
            .min()
            .unwrap_or(u32::MAX);
        let rate = (PIT_CLOCK_HZ / interval).max(1);

        // Program the source before committing so a failure leaves tasks pending.
        if self.installed {
            if rate != self.service_rate {
                self.source.set_frequency(rate)?;
            }
        } else {
            let shared = Arc::clone(&self.shared);
            self.source
                .install_periodic_handler(rate, Box::new(move || service_interrupt(&shared)))?;
            self.installed = true;
        }

        let committed = self.pending.len();
        {
            let mut table = lock_table(&self.shared);
            table.service_interval = interval;
            for task in self.pending.drain(..) {
                task.set_state(TaskState::Running);
                table.insert(task);
            }
        }
        self.service_rate = rate;

        info!(committed, rate_hz = rate, "Tasks dispatched");
        Ok(())
    }

    /// Remove a task from the rotation
    ///
    /// Returns `false` if the task was already terminated. Once this returns
    /// the task's callback will not run again.
    pub fn terminate(&mut self, handle: &TaskHandle) -> bool {
        self.terminate_id(handle.id)
    }

    fn terminate_id(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.pending.iter().position(|t| t.id == id) {
            let task = self.pending.remove(pos);
            task.set_state(TaskState::Terminated);
            debug!(%id, "Pending task terminated");
            return true;
        }

        let (removed, fastest) = {
            let mut table = lock_table(&self.shared);
            let removed = table.remove(id);
            if let Some(task) = &removed {
                task.set_state(TaskState::Terminated);
            }
            let fastest = table.fastest_interval();
            if let Some(interval) = fastest {
                table.service_interval = interval;
            }
            (removed.is_some(), fastest)
        };

        if !removed {
            return false;
        }
        debug!(%id, "Task terminated");

        // Slow the interrupt down if the fastest task just left.
        if let Some(interval) = fastest {
            let rate = (PIT_CLOCK_HZ / interval).max(1);
            if self.installed && rate != self.service_rate {
                match self.source.set_frequency(rate) {
                    Ok(()) => self.service_rate = rate,
                    Err(e) => warn!(error = %e, "Failed to reprogram timer after terminate"),
                }
            }
        }
        true
    }

    /// Apply requests queued by callbacks
    pub fn service_deferred(&mut self) -> usize {
        let requests: Vec<_> = self.deferred_rx.try_iter().collect();
        let count = requests.len();
        for request in requests {
            match request {
                DeferredRequest::Terminate(id) => {
                    self.terminate_id(id);
                }
            }
        }
        count
    }

    /// Terminate every task and release the timing source
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }

        for task in self.pending.drain(..) {
            task.set_state(TaskState::Terminated);
        }
        let terminated = {
            let mut table = lock_table(&self.shared);
            let count = table.live.len();
            for task in table.live.drain(..) {
                task.set_state(TaskState::Terminated);
            }
            count
        };

        if self.installed {
            self.source.remove_handler();
            self.installed = false;
        }
        // Drop anything callbacks queued on the way out.
        self.deferred_rx.try_iter().for_each(drop);

        self.service_rate = 0;
        self.shut_down = true;
        info!(terminated, "Scheduler shut down");
    }

    pub fn state(&self, handle: &TaskHandle) -> TaskState {
        handle.state()
    }

    pub fn live_tasks(&self) -> usize {
        lock_table(&self.shared).live.len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current interrupt frequency in Hz, 0 when not installed
    pub fn service_rate(&self) -> u32 {
        self.service_rate
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Interrupts fully serviced so far
    pub fn interrupts_serviced(&self) -> u64 {
        self.shared.serviced.load(Ordering::Relaxed)
    }

    pub fn source(&self) -> &T {
        &self.source
    }
}

impl<T: TimingSource> Drop for Scheduler<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: TimingSource> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending)
            .field("service_rate", &self.service_rate)
            .field("installed", &self.installed)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

#[derive(Default)]
struct ManualState {
    handler: Option<TickHandler>,
    frequency_hz: u32,
    installs: u32,
}

/// Timing source fired explicitly by the host
///
/// Useful when the host already owns a loop (or a test wants exact control
/// over interrupts). Clones share the same installed handler.
#[derive(Clone, Default)]
pub struct ManualTimingSource {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimingSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raise one interrupt; returns `false` when no handler is installed
    pub fn fire(&self) -> bool {
        let mut state = self.lock();
        match state.handler.as_mut() {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Raise `count` interrupts, returning how many reached a handler
    pub fn fire_n(&self, count: usize) -> usize {
        (0..count).filter(|_| self.fire()).count()
    }

    pub fn is_installed(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn frequency_hz(&self) -> u32 {
        self.lock().frequency_hz
    }

    /// How many times a handler has been installed
    pub fn installs(&self) -> u32 {
        self.lock().installs
    }
}

impl TimingSource for ManualTimingSource {
    fn install_periodic_handler(&mut self, frequency_hz: u32, handler: TickHandler) -> Result<()> {
        let mut state = self.lock();
        if state.handler.is_some() {
            return Err(SchedulerError::Timing("handler already installed".to_string()));
        }
        state.handler = Some(handler);
        state.frequency_hz = frequency_hz;
        state.installs += 1;
        Ok(())
    }

    fn set_frequency(&mut self, frequency_hz: u32) -> Result<()> {
        let mut state = self.lock();
        if state.handler.is_none() {
            return Err(SchedulerError::Timing("no handler installed".to_string()));
        }
        state.frequency_hz = frequency_hz;
        Ok(())
    }

    fn remove_handler(&mut self) {
        let mut state = self.lock();
        state.handler = None;
        state.frequency_hz = 0;
    }
}

impl fmt::Debug for ManualTimingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimingSource")
            .field("installed", &self.is_installed())
            .field("frequency_hz", &self.frequency_hz())
            .finish()
    }
}
