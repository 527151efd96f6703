//! Plain TCP transports backed by tokio tasks.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::endpoint::Authority;
use crate::transport::{Connector, ReadStatus, Transport};

/// Default buffer size for socket reads
const BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    Eof,
    Error(io::Error),
}

/// Opens [`TcpTransport`]s on the current tokio runtime.
pub struct TcpConnector {
    notify: Arc<Notify>,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, authority: &Authority, secure: bool) -> io::Result<Box<dyn Transport>> {
        if secure {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tls needs a connector that wraps the stream",
            ));
        }

        let handle = tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = handle.spawn(run_socket(
            authority.to_string(),
            self.connect_timeout,
            in_tx,
            out_rx,
            self.notify.clone(),
        ));

        tracing::trace!(endpoint = %authority, "Spawned socket task");

        Ok(Box::new(TcpTransport {
            inbound: in_rx,
            outbound: Some(out_tx),
            closed: false,
            pending_err: None,
            task,
        }))
    }

    fn wakeup(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

/// Engine side of a socket owned by a background task.
pub struct TcpTransport {
    inbound: UnboundedReceiver<Inbound>,
    outbound: Option<UnboundedSender<Bytes>>,
    closed: bool,
    /// Error that arrived behind data; reported on the next poll.
    pending_err: Option<io::Error>,
    task: JoinHandle<()>,
}

impl Transport for TcpTransport {
    fn poll_read(&mut self, buf: &mut BytesMut) -> io::Result<ReadStatus> {
        if let Some(err) = self.pending_err.take() {
            return Err(err);
        }
        let mut total = 0;
        while !self.closed {
            match self.inbound.try_recv() {
                Ok(Inbound::Data(data)) => {
                    total += data.len();
                    buf.extend_from_slice(&data);
                }
                Ok(Inbound::Eof) | Err(TryRecvError::Disconnected) => self.closed = true,
                Ok(Inbound::Error(e)) => {
                    self.closed = true;
                    if total == 0 {
                        return Err(e);
                    }
                    self.pending_err = Some(e);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if total > 0 {
            Ok(ReadStatus::Data(total))
        } else if self.closed {
            Ok(ReadStatus::Closed)
        } else {
            Ok(ReadStatus::Pending)
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))?;
        tx.send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket task has exited"))
    }

    fn close(&mut self) {
        // Dropping the sender lets the task flush and shut the socket down.
        self.outbound = None;
        self.closed = true;
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.outbound.is_some() {
            self.task.abort();
        }
    }
}

async fn run_socket(
    addr: String,
    connect_timeout: Duration,
    inbound: UnboundedSender<Inbound>,
    mut outbound: UnboundedReceiver<Bytes>,
    notify: Arc<Notify>,
) {
    let report = |msg: Inbound| {
        let _ = inbound.send(msg);
        notify.notify_one();
    };

    let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(addr = %addr, error = %e, "Connect failed");
            report(Inbound::Error(e));
            return;
        }
        Err(_) => {
            report(Inbound::Error(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            )));
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::trace!(addr = %addr, "Connected");

    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        tokio::select! {
            res = reader.read_buf(&mut buffer) => {
                match res {
                    Ok(0) => {
                        report(Inbound::Eof);
                        break;
                    }
                    Ok(_) => {
                        report(Inbound::Data(buffer.split().freeze()));
                        buffer.reserve(BUFFER_SIZE);
                    }
                    Err(e) => {
                        report(Inbound::Error(e));
                        break;
                    }
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            report(Inbound::Error(e));
                            break;
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (UnboundedSender<Inbound>, TcpTransport) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let transport = TcpTransport {
            inbound: in_rx,
            outbound: Some(out_tx),
            closed: false,
            pending_err: None,
            task: tokio::spawn(async {}),
        };
        (in_tx, transport)
    }

    #[tokio::test]
    async fn error_after_data_is_not_lost() {
        let (tx, mut transport) = transport();
        tx.send(Inbound::Data(Bytes::from_static(b"partial"))).unwrap();
        tx.send(Inbound::Error(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(transport.poll_read(&mut buf).unwrap(), ReadStatus::Data(7));
        assert_eq!(&buf[..], b"partial");

        let err = transport.poll_read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(transport.poll_read(&mut buf).unwrap(), ReadStatus::Closed);
    }

    #[tokio::test]
    async fn eof_after_data_is_closed() {
        let (tx, mut transport) = transport();
        tx.send(Inbound::Data(Bytes::from_static(b"abc"))).unwrap();
        tx.send(Inbound::Eof).unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(transport.poll_read(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(transport.poll_read(&mut buf).unwrap(), ReadStatus::Closed);
    }

    #[tokio::test]
    async fn tls_is_refused() {
        let mut connector = TcpConnector::new(Duration::from_secs(1));
        let err = connector
            .connect(&Authority::new("example.com", 443), true)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
