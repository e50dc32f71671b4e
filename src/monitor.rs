//! Throughput monitor.
//!
//! Samples every connection counter on a fixed period and reports the
//! completed-response rate. Once the done flag is set it drops to the idle
//! cadence and keeps reporting, so the process stays observable after a
//! failure instead of going silent.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::signal::{DoneFlag, Latch, SharedCounter};

/// One sampling period's result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Responses completed in the window.
    pub count: u64,
    /// Measured window length.
    pub elapsed: Duration,
    /// `count / elapsed` in responses per second.
    pub rate: f64,
    /// Taken in idle mode.
    pub idle: bool,
}

impl Sample {
    fn new(count: u64, elapsed: Duration, idle: bool) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { count as f64 / secs } else { 0.0 };
        Self {
            count,
            elapsed,
            rate,
            idle,
        }
    }
}

/// Destination for samples.
pub trait ReportSink: Send + 'static {
    fn report(&mut self, sample: &Sample);
}

/// Prints `QPS : <rate>` lines to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl ReportSink for StdoutSink {
    fn report(&mut self, sample: &Sample) {
        let mut out = std::io::stdout().lock();
        // Nothing useful to do if stdout is gone.
        let _ = writeln!(out, "{}", format_line(sample));
        let _ = out.flush();
    }
}

/// Render a sample as a report line.
pub fn format_line(sample: &Sample) -> String {
    format!("QPS : {:.6}", sample.rate)
}

/// Sampling cadence.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub sample_period: Duration,
    pub idle_period: Duration,
}

pub struct ThroughputMonitor<S> {
    counters: Vec<Arc<SharedCounter>>,
    done: Arc<DoneFlag>,
    settings: MonitorSettings,
    sink: S,
}

impl<S: ReportSink> ThroughputMonitor<S> {
    pub fn new(
        counters: Vec<Arc<SharedCounter>>,
        done: Arc<DoneFlag>,
        settings: MonitorSettings,
        sink: S,
    ) -> Self {
        Self {
            counters,
            done,
            settings,
            sink,
        }
    }

    /// Report until `shutdown` is set. Returns the sink.
    pub async fn run(mut self, shutdown: Arc<Latch>) -> S {
        let mut last = Instant::now();
        let mut samples: u64 = 0;

        loop {
            let idle = self.done.is_set();
            let period = if idle {
                self.settings.idle_period
            } else {
                self.settings.sample_period
            };

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.wait() => break,
            }

            let count: u64 = self.counters.iter().map(|c| c.take()).sum();
            let now = Instant::now();
            let sample = Sample::new(count, now - last, idle);
            last = now;

            trace!(
                count = sample.count,
                elapsed_ms = sample.elapsed.as_millis() as u64,
                idle = sample.idle,
                "Sample"
            );
            self.sink.report(&sample);
            samples += 1;
        }

        debug!(samples, "Monitor exited");
        self.sink
    }
}
