//! Response consumer: drain responses and count arrivals.
//!
//! A read failure is terminal. The stream is either dead or out of frame
//! sync, and neither can be resumed safely, so there is no retry.

use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, trace};

use crate::connection::ConnectionReader;
use crate::coordinator::LoopOutcome;
use crate::protocol::ResponseDecoder;
use crate::signal::{DoneFlag, SharedCounter};

pub struct Consumer<R, D> {
    id: usize,
    reader: ConnectionReader<R, D>,
    done: Arc<DoneFlag>,
    counter: Arc<SharedCounter>,
}

impl<R, D> Consumer<R, D>
where
    R: AsyncRead + Unpin,
    D: ResponseDecoder,
{
    pub fn new(
        id: usize,
        reader: ConnectionReader<R, D>,
        done: Arc<DoneFlag>,
        counter: Arc<SharedCounter>,
    ) -> Self {
        Self {
            id,
            reader,
            done,
            counter,
        }
    }

    /// Run until a read fails or the done flag is set elsewhere.
    pub async fn run(mut self) -> LoopOutcome {
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.done.wait() => break LoopOutcome::Stopped,
                result = self.reader.read() => match result {
                    Ok(response) => {
                        trace!(
                            connection = self.id,
                            method = %response.method,
                            bytes = response.body_len,
                            "Response"
                        );
                        self.counter.increment();
                    }
                    Err(e) => {
                        if self.done.set() {
                            error!(connection = self.id, error = %e, "Consumer failed");
                        } else {
                            debug!(connection = self.id, error = %e, "Consumer failed after shutdown");
                        }
                        break LoopOutcome::Failed(e);
                    }
                },
            }
        };

        self.reader.close();
        debug!(
            connection = self.id,
            responses = self.counter.total(),
            state = ?self.reader.state(),
            "Consumer exited"
        );
        outcome
    }
}
