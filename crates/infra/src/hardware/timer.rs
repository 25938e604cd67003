//! Timer thread standing in for the programmable interval timer

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use soundscape_core::domain::scheduler::{Result, SchedulerError, TickHandler, TimingSource};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

enum Control {
    SetFrequency(u32),
    Stop,
}

struct Worker {
    control: Sender<Control>,
    thread: JoinHandle<()>,
    frequency_hz: u32,
}

/// Timing source driven by a dedicated thread
///
/// The handler runs on the timer thread, one call per period. Periods the
/// thread oversleeps are dropped rather than delivered in a burst.
#[derive(Default)]
pub struct ThreadTimingSource {
    worker: Option<Worker>,
}

fn period_for(frequency_hz: u32) -> Result<Duration> {
    if frequency_hz == 0 {
        return Err(SchedulerError::InvalidInterval("frequency must be non-zero".to_string()));
    }
    Ok(Duration::from_nanos(1_000_000_000 / u64::from(frequency_hz)))
}

fn run_timer(mut handler: TickHandler, mut period: Duration, control: Receiver<Control>) {
    let mut deadline = Instant::now() + period;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match control.recv_timeout(wait) {
            Ok(Control::SetFrequency(hz)) => {
                // Validated by the sender.
                period = Duration::from_nanos(1_000_000_000 / u64::from(hz.max(1)));
                deadline = Instant::now() + period;
                debug!(frequency_hz = hz, "Timer reprogrammed");
            }
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                handler();
                deadline += period;
                let now = Instant::now();
                if deadline < now {
                    trace!(late_by = ?(now - deadline), "Timer overran, dropping periods");
                    deadline = now + period;
                }
            }
        }
    }
    debug!("Timer thread exiting");
}

impl ThreadTimingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.worker.is_some()
    }

    /// Current frequency, 0 when no handler is installed
    pub fn frequency_hz(&self) -> u32 {
        self.worker.as_ref().map(|w| w.frequency_hz).unwrap_or(0)
    }
}

impl TimingSource for ThreadTimingSource {
    fn install_periodic_handler(&mut self, frequency_hz: u32, handler: TickHandler) -> Result<()> {
        if self.worker.is_some() {
            return Err(SchedulerError::Timing("handler already installed".to_string()));
        }
        let period = period_for(frequency_hz)?;
        let (control, commands) = bounded(4);

        let thread = thread::Builder::new()
            .name("soundscape-timer".to_string())
            .spawn(move || run_timer(handler, period, commands))
            .map_err(|e| SchedulerError::Timing(format!("cannot spawn timer thread: {}", e)))?;

        info!(frequency_hz, "Timer thread started");
        self.worker = Some(Worker {
            control,
            thread,
            frequency_hz,
        });
        Ok(())
    }

    fn set_frequency(&mut self, frequency_hz: u32) -> Result<()> {
        period_for(frequency_hz)?;
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| SchedulerError::Timing("no handler installed".to_string()))?;
        worker
            .control
            .send(Control::SetFrequency(frequency_hz))
            .map_err(|_| SchedulerError::Timing("timer thread is gone".to_string()))?;
        worker.frequency_hz = frequency_hz;
        Ok(())
    }

    fn remove_handler(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        // A send error means the thread already exited.
        let _ = worker.control.send(Control::Stop);
        if worker.thread.join().is_err() {
            warn!("Timer thread panicked");
        }
        info!("Timer thread stopped");
    }
}

impl Drop for ThreadTimingSource {
    fn drop(&mut self) {
        self.remove_handler();
    }
}
