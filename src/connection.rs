//! Framed bidirectional connection to the target server.
//!
//! A [`Connection`] is split into exactly one [`ConnectionWriter`] and one
//! [`ConnectionReader`]. Each half is moved into its own task, so the
//! single-writer/single-reader discipline holds by construction and the
//! stream needs no lock.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::HarnessError;
use crate::protocol::{Request, RequestEncoder, Response, ResponseDecoder};

/// Receive buffer size
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Send buffer size
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Longest a close waits for queued bytes to drain
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a stream half is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closed,
}

/// An established TCP connection, not yet split.
pub struct Connection<C> {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    codec: C,
}

impl<C> Connection<C>
where
    C: RequestEncoder + ResponseDecoder + Clone,
{
    /// Establish the stream.
    pub async fn open(host: &str, port: u16, codec: C) -> Result<Self, HarnessError> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| HarnessError::Connection {
                addr: addr.clone(),
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| HarnessError::Connection {
                addr: addr.clone(),
                source,
            })?;
        let peer = stream
            .peer_addr()
            .map_err(|source| HarnessError::Connection { addr, source })?;

        debug!(peer = %peer, "Connection established");
        Ok(Self {
            stream: Some(stream),
            peer,
            codec,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnState {
        if self.stream.is_some() {
            ConnState::Open
        } else {
            ConnState::Closed
        }
    }

    /// Hand out the two halves. `None` once closed.
    pub fn into_split(
        mut self,
    ) -> Option<(
        ConnectionWriter<OwnedWriteHalf, C>,
        ConnectionReader<OwnedReadHalf, C>,
    )> {
        let stream = self.stream.take()?;
        let (read, write) = stream.into_split();
        Some((
            ConnectionWriter::new(write, self.codec.clone()),
            ConnectionReader::new(read, self.codec),
        ))
    }

    /// Shut the stream down. Idempotent.
    #[allow(dead_code)]
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Shutdown failed");
            }
        }
    }
}

/// Sending half: encodes requests onto a buffered stream.
pub struct ConnectionWriter<W, E> {
    stream: BufWriter<W>,
    encoder: E,
    scratch: BytesMut,
    state: ConnState,
}

impl<W, E> ConnectionWriter<W, E>
where
    W: AsyncWrite + Unpin,
    E: RequestEncoder,
{
    pub fn new(stream: W, encoder: E) -> Self {
        Self {
            stream: BufWriter::with_capacity(WRITE_BUFFER_SIZE, stream),
            encoder,
            scratch: BytesMut::with_capacity(256),
            state: ConnState::Open,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Queue one request. Bytes reach the socket when the buffer fills or on
    /// [`flush`](ConnectionWriter::flush).
    pub async fn write(&mut self, request: &Request) -> Result<(), HarnessError> {
        if self.state == ConnState::Closed {
            return Err(HarnessError::Transport(io::ErrorKind::NotConnected.into()));
        }

        self.scratch.clear();
        self.encoder.encode(request, &mut self.scratch)?;
        self.stream.write_all(&self.scratch).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), HarnessError> {
        if self.state == ConnState::Closed {
            return Err(HarnessError::Transport(io::ErrorKind::NotConnected.into()));
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush what is queued and shut down the write direction. Idempotent.
    ///
    /// Gives up after [`CLOSE_TIMEOUT`] when the peer is not reading.
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Write half shutdown failed"),
            Err(_) => debug!("Write half shutdown timed out"),
        }
    }
}

/// Receiving half: buffers bytes until the decoder yields a response.
pub struct ConnectionReader<R, D> {
    stream: R,
    decoder: D,
    buffer: BytesMut,
    state: ConnState,
}

impl<R, D> ConnectionReader<R, D>
where
    R: AsyncRead + Unpin,
    D: ResponseDecoder,
{
    pub fn new(stream: R, decoder: D) -> Self {
        Self {
            stream,
            decoder,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            state: ConnState::Open,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Read the next response.
    ///
    /// Cancel-safe: bytes received before cancellation stay buffered for the
    /// next call.
    pub async fn read(&mut self) -> Result<Response, HarnessError> {
        if self.state == ConnState::Closed {
            return Err(HarnessError::Transport(io::ErrorKind::NotConnected.into()));
        }

        loop {
            if let Some(response) = self.decoder.decode(&mut self.buffer)? {
                return Ok(response);
            }

            if self.buffer.capacity() - self.buffer.len() < READ_BUFFER_SIZE / 4 {
                self.buffer.reserve(READ_BUFFER_SIZE);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.state = ConnState::Closed;
                return Err(HarnessError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    /// Stop reading; later calls fail. Idempotent.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.buffer.clear();
    }
}
