//! Reply server used as a benchmark target.
//!
//! Accepts framed Thrift calls and answers each with a fixed result string,
//! in arrival order. It does nothing else, so measured throughput is bounded
//! by the harness and the network rather than by request handling.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace};

use crate::protocol::thrift::{self, ParseResult, CALL, ONEWAY};
use crate::protocol::EncodingError;
use crate::signal::Latch;

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 64 * 1024;

/// Reply server instance
pub struct ReplyPeer {
    listener: TcpListener,
    reply: Arc<str>,
    connection_limit: Arc<Semaphore>,
}

impl ReplyPeer {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, reply: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(ReplyPeer {
            listener,
            reply: Arc::from(reply),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until `shutdown` is set. Open
    /// connections are dropped on shutdown.
    pub async fn run(self, shutdown: Arc<Latch>) -> io::Result<()> {
        info!(address = %self.local_addr()?, "Reply peer listening");
        let mut connections = JoinSet::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                }
                _ = shutdown.wait() => break,
            };

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "New connection");
                        let reply = Arc::clone(&self.reply);

                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, &reply).await {
                                debug!(peer = %addr, error = %e, "Connection error");
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.wait() => break,
            }

            while connections.try_join_next().is_some() {}
        }

        connections.shutdown().await;
        info!("Reply peer stopped");
        Ok(())
    }
}

/// Answer every call on one connection.
async fn handle_connection(
    mut stream: TcpStream,
    reply: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut output = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        // Answer everything already buffered, then write once.
        loop {
            match thrift::parse_frame(&buffer) {
                ParseResult::Complete(len) => {
                    let frame = buffer.split_to(4 + len);
                    let message = thrift::decode_message(&frame[4..])?;
                    match message.header.kind {
                        CALL => thrift::encode_reply(
                            &mut output,
                            &message.header.name,
                            message.header.seqid,
                            reply,
                        )?,
                        ONEWAY => {}
                        other => return Err(EncodingError::UnexpectedMessageType(other).into()),
                    }
                }
                ParseResult::Incomplete => break,
                ParseResult::TooLarge(len) => return Err(EncodingError::FrameTooLarge(len).into()),
            }
        }

        if !output.is_empty() {
            stream.write_all(&output).await?;
            output.clear();
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }
    }
}
