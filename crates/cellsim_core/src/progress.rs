//! Progress feedback and cancellation for long runs.

use std::time::{Duration, Instant};
use tracing::info;

/// Receives progress updates between solver steps.
///
/// Returning `false` from [`ProgressReporter::update`] cancels the run; the
/// simulation is left as it was before the run started.
pub trait ProgressReporter {
    /// Called once before the first step. `message` describes the run.
    fn enter(&mut self, _message: Option<&str>) {}

    /// `fraction` runs from 0 to 1. Return `false` to stop.
    fn update(&mut self, fraction: f64) -> bool;

    /// Called once after the run, whether it finished or not.
    fn exit(&mut self) {}
}

impl<F> ProgressReporter for F
where
    F: FnMut(f64) -> bool,
{
    fn update(&mut self, fraction: f64) -> bool {
        self(fraction)
    }
}

/// Logs progress through `tracing` at most once per interval.
#[derive(Debug, Clone)]
pub struct ProgressPrinter {
    interval: Duration,
    message: String,
    started: Instant,
    last: Option<Instant>,
}

impl Default for ProgressPrinter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProgressPrinter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            message: String::new(),
            started: Instant::now(),
            last: None,
        }
    }
}

impl ProgressReporter for ProgressPrinter {
    fn enter(&mut self, message: Option<&str>) {
        self.message = message.unwrap_or("Running simulation").to_string();
        self.started = Instant::now();
        self.last = Some(self.started);
    }

    fn update(&mut self, fraction: f64) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
            let elapsed = now.duration_since(self.started).as_secs_f64();
            // Linear extrapolation once there is something to extrapolate from.
            let remaining = if fraction > 0.0 {
                elapsed * (1.0 - fraction) / fraction
            } else {
                f64::NAN
            };
            info!(
                message = %self.message,
                percent = 100.0 * fraction,
                elapsed_s = elapsed,
                remaining_s = remaining,
                "progress"
            );
        }
        true
    }

    fn exit(&mut self) {
        info!(
            message = %self.message,
            elapsed_s = self.started.elapsed().as_secs_f64(),
            "done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_report_and_cancel() {
        let mut seen = Vec::new();
        let mut reporter = |fraction: f64| {
            seen.push(fraction);
            fraction < 0.5
        };
        reporter.enter(Some("test"));
        assert!(reporter.update(0.25));
        assert!(!reporter.update(0.75));
        reporter.exit();
        assert_eq!(seen, vec![0.25, 0.75]);
    }

    #[test]
    fn printer_never_cancels() {
        let mut printer = ProgressPrinter::new(Duration::ZERO);
        printer.enter(None);
        assert!((0..=10).all(|i| printer.update(f64::from(i) / 10.0)));
        printer.exit();
    }
}
