//! Harness coordinator.
//!
//! Opens the connections, starts one producer and one consumer per
//! connection plus a single monitor, and drives the lifecycle:
//!
//! ```text
//! Starting --all connections open--> Running
//! Running  --first loop failure----> Draining
//! Draining --all loops joined------> Idle
//! ```
//!
//! In Idle the coordinator parks on the shutdown latch while the monitor
//! keeps reporting. Transport failures stop at Idle; encoding failures abort
//! whatever loops are left and are escalated to the caller. A shutdown
//! request aborts the loops in any state.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connection::Connection;
use crate::consumer::Consumer;
use crate::error::HarnessError;
use crate::monitor::{ReportSink, ThroughputMonitor};
use crate::producer::Producer;
use crate::protocol::{Request, RequestEncoder, ResponseDecoder};
use crate::signal::{DoneFlag, HarnessState, Latch, SharedCounter, StateCell};

/// How a producer or consumer loop ended.
#[derive(Debug)]
pub enum LoopOutcome {
    /// Observed the done flag and wound down.
    Stopped,
    /// Hit an error; the done flag has been set.
    Failed(HarnessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

/// A loop's result as reported to the coordinator.
#[derive(Debug)]
pub struct LoopExit {
    pub connection: usize,
    pub role: Role,
    pub outcome: LoopOutcome,
}

/// What a finished run looked like.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Responses received per connection.
    pub per_connection: Vec<u64>,
    /// Number of loops that ended with an error.
    pub failures: usize,
    /// Loop that failed first, if any.
    pub first_failure: Option<(usize, Role)>,
}

impl RunSummary {
    pub fn responses(&self) -> u64 {
        self.per_connection.iter().sum()
    }
}

pub struct Coordinator {
    config: Config,
    done: Arc<DoneFlag>,
    shutdown: Arc<Latch>,
    state: Arc<StateCell>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            done: Arc::new(DoneFlag::new()),
            shutdown: Arc::new(Latch::new()),
            state: Arc::new(StateCell::new()),
        }
    }

    #[cfg(test)]
    pub fn done(&self) -> Arc<DoneFlag> {
        Arc::clone(&self.done)
    }

    /// Setting this latch ends the run.
    pub fn shutdown_handle(&self) -> Arc<Latch> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    /// Run until shutdown, or until an encoding failure is escalated.
    pub async fn run<C, S>(self, codec: C, sink: S) -> Result<RunSummary, HarnessError>
    where
        C: RequestEncoder + ResponseDecoder + Clone,
        S: ReportSink,
    {
        let config = &self.config;

        let mut connections = Vec::with_capacity(config.connections);
        for id in 0..config.connections {
            let conn = Connection::open(&config.host, config.port, codec.clone())
                .await
                .inspect_err(|e| error!(connection = id, error = %e, "Connection failed"))?;
            info!(connection = id, peer = %conn.peer(), "Connected");
            connections.push(conn);
        }
        self.advance(HarnessState::Starting, HarnessState::Running);

        let mut loops = JoinSet::new();
        let mut counters = Vec::with_capacity(connections.len());
        let request = Request::new(config.payload.clone());

        for (id, conn) in connections.into_iter().enumerate() {
            let Some((writer, reader)) = conn.into_split() else {
                continue;
            };
            let counter = Arc::new(SharedCounter::new());
            counters.push(Arc::clone(&counter));

            let producer = Producer::new(
                id,
                writer,
                request.clone(),
                config.producer_settings(),
                Arc::clone(&self.done),
                Arc::clone(&counter),
            );
            let consumer = Consumer::new(id, reader, Arc::clone(&self.done), counter);

            loops.spawn(async move {
                LoopExit {
                    connection: id,
                    role: Role::Producer,
                    outcome: producer.run().await,
                }
            });
            loops.spawn(async move {
                LoopExit {
                    connection: id,
                    role: Role::Consumer,
                    outcome: consumer.run().await,
                }
            });
        }

        let monitor = ThroughputMonitor::new(
            counters.clone(),
            Arc::clone(&self.done),
            config.monitor_settings(),
            sink,
        );
        let monitor = tokio::spawn(monitor.run(Arc::clone(&self.shutdown)));

        let mut summary = RunSummary::default();
        let mut escalate: Option<HarnessError> = None;
        // Set once the remaining loops have been aborted.
        let mut stopping = false;

        loop {
            tokio::select! {
                joined = loops.join_next() => match joined {
                    Some(Ok(exit)) => {
                        self.record(exit, &mut summary, &mut escalate);
                        if escalate.is_some() && !stopping {
                            debug!("Escalating, aborting remaining loops");
                            stopping = true;
                            self.done.set();
                            loops.abort_all();
                        }
                    }
                    Some(Err(e)) if e.is_cancelled() => {
                        debug!("Loop task cancelled");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Loop task aborted");
                        summary.failures += 1;
                        self.done.set();
                    }
                    None => break,
                },
                // Stays armed while draining: a loop stuck on a stalled peer
                // must not outlive an operator shutdown.
                _ = self.shutdown.wait(), if !stopping => {
                    info!("Shutdown requested, stopping loops");
                    stopping = true;
                    self.done.set();
                    loops.abort_all();
                }
            }

            if self.done.is_set() && self.advance(HarnessState::Running, HarnessState::Draining) {
                info!("Draining");
            }
        }

        self.advance(HarnessState::Draining, HarnessState::Idle);
        summary.per_connection = counters.iter().map(|c| c.total()).collect();
        info!(
            responses = summary.responses(),
            failures = summary.failures,
            "All loops exited"
        );

        if let Some(e) = escalate {
            self.shutdown.set();
            if let Err(join) = monitor.await {
                error!(error = %join, "Monitor task aborted");
            }
            return Err(e);
        }

        // Idle: the monitor keeps reporting until an operator stops us.
        self.shutdown.wait().await;
        if let Err(e) = monitor.await {
            error!(error = %e, "Monitor task aborted");
        }
        Ok(summary)
    }

    fn record(&self, exit: LoopExit, summary: &mut RunSummary, escalate: &mut Option<HarnessError>) {
        match exit.outcome {
            LoopOutcome::Stopped => {
                debug!(connection = exit.connection, role = ?exit.role, "Loop stopped");
            }
            LoopOutcome::Failed(e) => {
                summary.failures += 1;
                if summary.first_failure.is_none() {
                    summary.first_failure = Some((exit.connection, exit.role));
                }
                if e.is_fatal() && escalate.is_none() {
                    *escalate = Some(e);
                }
            }
        }
    }

    fn advance(&self, from: HarnessState, to: HarnessState) -> bool {
        let moved = self.state.advance(from, to);
        if moved {
            debug!(from = ?from, to = ?to, "State transition");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::tests::MemorySink;
    use crate::peer::ReplyPeer;
    use crate::protocol::thrift::ThriftCodec;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn start_peer() -> (SocketAddr, Arc<Latch>, tokio::task::JoinHandle<std::io::Result<()>>) {
        let peer = ReplyPeer::bind("127.0.0.1:0", "world").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let shutdown = Arc::new(Latch::new());
        let handle = tokio::spawn(peer.run(Arc::clone(&shutdown)));
        (addr, shutdown, handle)
    }

    fn config_for(addr: SocketAddr) -> Config {
        Config {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Config::default()
        }
    }

    async fn wait_for_state(state: &StateCell, wanted: HarnessState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.get() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", wanted));
    }

    /// Formatted log output collected in memory.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    /// Accepts one connection and never reads from it. Optionally sends
    /// `garbage` after `delay`.
    async fn start_stalled_peer(
        garbage: Option<(Duration, &'static [u8])>,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            if let Some((delay, bytes)) = garbage {
                tokio::time::sleep(delay).await;
                stream.write_all(bytes).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let coordinator = Coordinator::new(config_for(addr));
        let state = coordinator.state();
        let result = coordinator
            .run(ThriftCodec::new("test"), MemorySink::default())
            .await;

        assert!(matches!(result, Err(HarnessError::Connection { .. })));
        assert_eq!(state.get(), HarnessState::Starting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_tracks_burst_shape() {
        let (addr, peer_shutdown, peer) = start_peer().await;
        let config = Config {
            batch_size: 100,
            sleep_ms: 50,
            sample_period_ms: 500,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let shutdown = coordinator.shutdown_handle();
        let state = coordinator.state();
        let sink = MemorySink::default();
        let run = tokio::spawn(coordinator.run(ThriftCodec::new("test"), sink.clone()));

        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(state.get(), HarnessState::Running);
        shutdown.set();
        let summary = run.await.unwrap().unwrap();

        // Skip the first window, it includes connection warm-up.
        let samples = sink.samples();
        assert!(samples.len() >= 4, "samples: {}", samples.len());
        let steady = &samples[1..4];
        let count: u64 = steady.iter().map(|s| s.count).sum();
        let secs: f64 = steady.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        let rate = count as f64 / secs;

        // 100 requests per 50 ms
        let expected = 2000.0;
        assert!(
            (rate - expected).abs() <= expected * 0.2,
            "rate {} outside 20% of {}",
            rate,
            expected
        );

        assert_eq!(summary.failures, 0);
        assert!(summary.responses() >= count);
        assert_eq!(state.get(), HarnessState::Idle);

        peer_shutdown.set();
        peer.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peer_loss_drains_to_idle() {
        let (addr, peer_shutdown, peer) = start_peer().await;
        let config = Config {
            batch_size: 50,
            sleep_ms: 10,
            sample_period_ms: 50,
            idle_period_ms: 50,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let shutdown = coordinator.shutdown_handle();
        let done = coordinator.done();
        let state = coordinator.state();
        let sink = MemorySink::default();
        let run = tokio::spawn(coordinator.run(ThriftCodec::new("test"), sink.clone()));

        wait_for_state(&state, HarnessState::Running).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!done.is_set());

        peer_shutdown.set();
        peer.await.unwrap().unwrap();

        wait_for_state(&state, HarnessState::Idle).await;
        assert!(done.is_set());

        // Still reporting, and reporting nothing.
        let before = sink.samples().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let samples = sink.samples();
        assert!(samples.len() > before + 2);
        assert!(samples[samples.len() - 2..].iter().all(|s| s.count == 0 && s.idle));
        assert!(samples[..before].iter().any(|s| s.count > 0));

        shutdown.set();
        let summary = run.await.unwrap().unwrap();
        assert!(summary.failures >= 1);
        assert!(summary.first_failure.is_some());
        assert!(summary.responses() > 0);
    }

    #[tokio::test]
    async fn test_peer_loss_logs_one_failure() {
        // Current-thread runtime: every task logs through this subscriber.
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (addr, peer_shutdown, peer) = start_peer().await;
        let config = Config {
            batch_size: 50,
            sleep_ms: 10,
            sample_period_ms: 50,
            idle_period_ms: 50,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let shutdown = coordinator.shutdown_handle();
        let state = coordinator.state();
        let run = tokio::spawn(coordinator.run(ThriftCodec::new("test"), MemorySink::default()));

        wait_for_state(&state, HarnessState::Running).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(log.lines().is_empty(), "{:?}", log.lines());

        peer_shutdown.set();
        peer.await.unwrap().unwrap();
        wait_for_state(&state, HarnessState::Idle).await;

        // Several idle reports later, still a single diagnostic.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let lines = log.lines();
        assert_eq!(lines.len(), 1, "{:?}", lines);
        assert!(lines[0].contains("ERROR"), "{}", lines[0]);

        shutdown.set();
        let summary = run.await.unwrap().unwrap();
        assert!(summary.failures >= 1);
        assert_eq!(log.lines().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_while_peer_stalls() {
        let (addr, server) = start_stalled_peer(None).await;
        let config = Config {
            batch_size: 100_000,
            sleep_ms: 0,
            sample_period_ms: 50,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let shutdown = coordinator.shutdown_handle();
        let state = coordinator.state();
        let run = tokio::spawn(coordinator.run(ThriftCodec::new("test"), MemorySink::default()));

        // Long enough for the socket buffers to fill and block the producer.
        wait_for_state(&state, HarnessState::Running).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.set();

        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("coordinator did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(state.get(), HarnessState::Idle);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.responses(), 0);
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_encoding_failure_escalates_while_peer_stalls() {
        let garbage: &'static [u8] = &[0x00, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
        let (addr, server) = start_stalled_peer(Some((Duration::from_millis(500), garbage))).await;
        let config = Config {
            batch_size: 100_000,
            sleep_ms: 0,
            sample_period_ms: 50,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let done = coordinator.done();
        let state = coordinator.state();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.run(ThriftCodec::new("test"), MemorySink::default()),
        )
        .await
        .expect("encoding failure was not escalated");

        assert!(matches!(result, Err(HarnessError::Encoding(_))));
        assert!(done.is_set());
        assert_eq!(state.get(), HarnessState::Idle);
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_each_connection_gets_a_pair() {
        let (addr, peer_shutdown, peer) = start_peer().await;
        let config = Config {
            connections: 3,
            batch_size: 20,
            sleep_ms: 10,
            sample_period_ms: 100,
            ..config_for(addr)
        };

        let coordinator = Coordinator::new(config);
        let shutdown = coordinator.shutdown_handle();
        let run = tokio::spawn(coordinator.run(ThriftCodec::new("test"), MemorySink::default()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.set();
        let summary = run.await.unwrap().unwrap();

        assert_eq!(summary.per_connection.len(), 3);
        assert!(summary.per_connection.iter().all(|&n| n > 0));
        assert_eq!(summary.failures, 0);

        peer_shutdown.set();
        peer.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_encoding_failure_escalates() {
        // A server that answers with a frame no Thrift decoder accepts.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(&[0x00, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef])
                .await
                .unwrap();
            // Keep the socket open so only the codec can fail.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let config = Config {
            batch_size: 1,
            sleep_ms: 10,
            sample_period_ms: 50,
            ..config_for(addr)
        };
        let coordinator = Coordinator::new(config);
        let done = coordinator.done();
        let state = coordinator.state();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.run(ThriftCodec::new("test"), MemorySink::default()),
        )
        .await
        .expect("encoding failure was not escalated");

        assert!(matches!(result, Err(HarnessError::Encoding(_))));
        assert!(done.is_set());
        assert_eq!(state.get(), HarnessState::Idle);
        server.abort();
    }
}
