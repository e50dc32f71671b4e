//! Request producer: burst, flush, pause, repeat.
//!
//! The burst-then-pause shape amortizes per-call overhead and acts as a
//! weak self-throttle. It is a heuristic, not backpressure: nothing stops
//! the producer from running ahead of the server except the pause and the
//! socket send buffer.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, error, trace};

use crate::connection::ConnectionWriter;
use crate::coordinator::LoopOutcome;
use crate::error::HarnessError;
use crate::protocol::{Request, RequestEncoder};
use crate::signal::{DoneFlag, SharedCounter};

/// Burst shape for one producer.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Requests per burst.
    pub batch_size: usize,
    /// Pause after each burst.
    pub sleep: Duration,
    /// Hold once this many consecutive bursts saw no responses.
    pub stall_bursts: Option<u32>,
}

pub struct Producer<W, E> {
    id: usize,
    writer: ConnectionWriter<W, E>,
    request: Request,
    settings: ProducerSettings,
    done: Arc<DoneFlag>,
    counter: Arc<SharedCounter>,
}

impl<W, E> Producer<W, E>
where
    W: AsyncWrite + Unpin,
    E: RequestEncoder,
{
    pub fn new(
        id: usize,
        writer: ConnectionWriter<W, E>,
        request: Request,
        settings: ProducerSettings,
        done: Arc<DoneFlag>,
        counter: Arc<SharedCounter>,
    ) -> Self {
        Self {
            id,
            writer,
            request,
            settings,
            done,
            counter,
        }
    }

    /// Run until the done flag is set or a write fails.
    pub async fn run(mut self) -> LoopOutcome {
        let mut stall = StallDetector::new(self.settings.stall_bursts);
        let mut bursts: u64 = 0;
        let done = Arc::clone(&self.done);

        let outcome = loop {
            if done.is_set() {
                break LoopOutcome::Stopped;
            }

            if stall.holding(self.counter.total()) {
                trace!(connection = self.id, "No responses, holding burst");
            } else {
                // A peer that stops reading blocks the burst in write.
                let result = tokio::select! {
                    result = self.burst() => result,
                    _ = done.wait() => break LoopOutcome::Stopped,
                };
                if let Err(e) = result {
                    if done.set() {
                        error!(connection = self.id, error = %e, "Producer failed");
                    } else {
                        debug!(connection = self.id, error = %e, "Producer failed after shutdown");
                    }
                    break LoopOutcome::Failed(e);
                }
                bursts += 1;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.sleep) => {}
                _ = done.wait() => {}
            }
            if self.settings.sleep.is_zero() {
                tokio::task::yield_now().await;
            }
        };

        self.writer.close().await;
        debug!(connection = self.id, bursts, state = ?self.writer.state(), "Producer exited");
        outcome
    }

    async fn burst(&mut self) -> Result<(), HarnessError> {
        for _ in 0..self.settings.batch_size {
            self.writer.write(&self.request).await?;
        }
        self.writer.flush().await
    }
}

/// Tracks whether responses keep arriving between bursts.
///
/// Optional tuning knob: with no limit it never holds.
struct StallDetector {
    limit: Option<u32>,
    last_total: u64,
    quiet_bursts: u32,
}

impl StallDetector {
    fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            last_total: 0,
            quiet_bursts: 0,
        }
    }

    /// Called once per iteration with the running response total.
    fn holding(&mut self, total: u64) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };

        if total != self.last_total {
            self.last_total = total;
            self.quiet_bursts = 0;
            return false;
        }

        if self.quiet_bursts >= limit {
            return true;
        }
        self.quiet_bursts += 1;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::thrift::{encode_call, ThriftCodec};
    use bytes::BytesMut;
    use std::io;
    use tokio_test::io::Builder;

    fn settings(batch_size: usize, sleep_ms: u64) -> ProducerSettings {
        ProducerSettings {
            batch_size,
            sleep: Duration::from_millis(sleep_ms),
            stall_bursts: None,
        }
    }

    #[test]
    fn test_stall_detector_disabled() {
        let mut stall = StallDetector::new(None);
        for _ in 0..100 {
            assert!(!stall.holding(0));
        }
    }

    #[test]
    fn test_stall_detector_holds_and_resumes() {
        let mut stall = StallDetector::new(Some(3));
        assert!(!stall.holding(0));
        assert!(!stall.holding(0));
        assert!(!stall.holding(0));
        assert!(stall.holding(0));
        assert!(stall.holding(0));

        // Responses arrived: resume.
        assert!(!stall.holding(10));
        assert!(!stall.holding(10));
    }

    #[tokio::test]
    async fn test_write_failure_sets_done() {
        let mock = Builder::new()
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let writer = ConnectionWriter::new(mock, ThriftCodec::new("test"));
        let done = Arc::new(DoneFlag::new());

        let producer = Producer::new(
            0,
            writer,
            Request::new("hello"),
            settings(4, 0),
            Arc::clone(&done),
            Arc::new(SharedCounter::new()),
        );

        let outcome = producer.run().await;
        assert!(matches!(
            outcome,
            LoopOutcome::Failed(HarnessError::Transport(ref e)) if e.kind() == io::ErrorKind::BrokenPipe
        ));
        assert!(done.is_set());
    }

    #[tokio::test]
    async fn test_done_before_start_sends_nothing() {
        let mock = Builder::new().build();
        let writer = ConnectionWriter::new(mock, ThriftCodec::new("test"));
        let done = Arc::new(DoneFlag::new());
        done.set();

        let producer = Producer::new(
            0,
            writer,
            Request::new("hello"),
            settings(4000, 100),
            Arc::clone(&done),
            Arc::new(SharedCounter::new()),
        );

        assert!(matches!(producer.run().await, LoopOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_done_interrupts_blocked_burst() {
        // The far end is held open but never read, so the burst stalls
        // once the pipe fills.
        let (near, _far) = tokio::io::duplex(64);
        let writer = ConnectionWriter::new(near, ThriftCodec::new("test"));
        let done = Arc::new(DoneFlag::new());

        let producer = Producer::new(
            0,
            writer,
            Request::new("hello"),
            settings(4000, 0),
            Arc::clone(&done),
            Arc::new(SharedCounter::new()),
        );
        let handle = tokio::spawn(producer.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        done.set();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("producer stayed blocked in write")
            .unwrap();
        assert!(matches!(outcome, LoopOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_one_burst_then_stop() {
        let mut burst = BytesMut::new();
        for _ in 0..5 {
            encode_call(&mut burst, "test", "hello").unwrap();
        }

        let mock = Builder::new().write(&burst).build();
        let writer = ConnectionWriter::new(mock, ThriftCodec::new("test"));
        let done = Arc::new(DoneFlag::new());

        let producer = Producer::new(
            0,
            writer,
            Request::new("hello"),
            settings(5, 60_000),
            Arc::clone(&done),
            Arc::new(SharedCounter::new()),
        );
        let handle = tokio::spawn(producer.run());

        // The producer is parked in its pause; the flag wakes it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        done.set();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("producer did not stop")
            .unwrap();
        assert!(matches!(outcome, LoopOutcome::Stopped));
    }
}
