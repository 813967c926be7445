//! Deadline-stable driver for the node's periodic loops.
//!
//! Usage: call `loop_begin()` at the top of each iteration, run the body,
//! then `loop_end().await`.  `loop_end` measures the body, warns on
//! overtime, and sleeps for whatever remains of the period so the loop
//! holds its frequency instead of drifting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

/// Callback that contributes extra context to an overtime warning.
pub type OvertimeContextFn = Box<dyn Fn() -> String + Send>;

/// Paces one periodic loop and keeps lifetime timing statistics.
pub struct ControlLoop {
    name: String,
    period: Duration,
    report_overtime: bool,
    overtime_context: Option<OvertimeContextFn>,
    /// Mirror of the overtime counter, shared with whoever wants to observe
    /// the loop from outside.
    overtime_sink: Option<Arc<AtomicU64>>,
    last_run: Option<Instant>,
    loop_counter: u64,
    overtime_counter: u64,
    run_time: Duration,
    min_period: Option<Duration>,
    max_period: Option<Duration>,
}

impl ControlLoop {
    pub fn new(name: impl Into<String>, period: Duration, report_overtime: bool) -> Self {
        ControlLoop {
            name: name.into(),
            period,
            report_overtime,
            overtime_context: None,
            overtime_sink: None,
            last_run: None,
            loop_counter: 0,
            overtime_counter: 0,
            run_time: Duration::ZERO,
            min_period: None,
            max_period: None,
        }
    }

    /// Attach a callback whose output is appended to overtime warnings.
    pub fn with_overtime_context(mut self, callback: OvertimeContextFn) -> Self {
        self.overtime_context = Some(callback);
        self
    }

    /// Mirror the overtime counter into a shared atomic.
    pub fn with_overtime_sink(mut self, sink: Arc<AtomicU64>) -> Self {
        self.overtime_sink = Some(sink);
        self
    }

    /// Mark the start of an iteration.
    pub fn loop_begin(&mut self) {
        self.last_run = Some(Instant::now());
        self.loop_counter += 1;
    }

    /// Mark the end of an iteration: account for the elapsed time, warn on
    /// overtime, and sleep out the remainder of the period.
    pub async fn loop_end(&mut self) {
        let Some(started) = self.last_run else {
            return;
        };
        let elapsed = started.elapsed();

        self.run_time += elapsed;
        self.min_period = Some(self.min_period.map_or(elapsed, |m| m.min(elapsed)));
        self.max_period = Some(self.max_period.map_or(elapsed, |m| m.max(elapsed)));

        if elapsed > self.period {
            self.overtime_counter += 1;
            if let Some(sink) = &self.overtime_sink {
                sink.store(self.overtime_counter, Ordering::Relaxed);
            }
            if self.report_overtime {
                let suffix = match &self.overtime_context {
                    Some(callback) => {
                        let extra = callback();
                        if extra.is_empty() {
                            String::new()
                        } else {
                            format!(" | {extra}")
                        }
                    }
                    None => String::new(),
                };
                warn!(
                    "OVERTIME: {} exec time: {:.3}ms exceed: {:.3}ms{}",
                    self.name,
                    elapsed.as_secs_f64() * 1000.0,
                    (elapsed - self.period).as_secs_f64() * 1000.0,
                    suffix
                );
            }
        }

        tokio::time::sleep(self.period.saturating_sub(elapsed)).await;
    }

    pub fn loop_counter(&self) -> u64 {
        self.loop_counter
    }

    pub fn overtime_counter(&self) -> u64 {
        self.overtime_counter
    }

    /// Average body duration over the loop's lifetime.
    pub fn avg_period(&self) -> Option<Duration> {
        if self.loop_counter == 0 {
            None
        } else {
            Some(self.run_time / self.loop_counter as u32)
        }
    }

    pub fn min_period(&self) -> Option<Duration> {
        self.min_period
    }

    pub fn max_period(&self) -> Option<Duration> {
        self.max_period
    }
}

impl std::fmt::Display for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, loops: {}, overtime: {}, min: {:.3}ms, max: {:.3}ms, avg: {:.3}ms",
            self.name.to_uppercase(),
            self.loop_counter,
            self.overtime_counter,
            self.min_period.unwrap_or_default().as_secs_f64() * 1000.0,
            self.max_period.unwrap_or_default().as_secs_f64() * 1000.0,
            self.avg_period().unwrap_or_default().as_secs_f64() * 1000.0,
        )
    }
}
