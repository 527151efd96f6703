//! Byte transports the protocol engines run over.
//!
//! The engines never block: they poll a [`Transport`] for whatever bytes
//! have arrived and queue writes. A [`Connector`] opens transports; TLS, if
//! any, is applied by the connector before the engine sees the stream.

pub mod tcp;

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Notify;

use crate::endpoint::Authority;

pub use tcp::TcpConnector;

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were appended to the buffer.
    Data(usize),
    /// Nothing new yet.
    Pending,
    /// The peer closed its side; no more data will arrive.
    Closed,
}

pub trait Transport {
    /// Append any bytes that have arrived to `buf`.
    fn poll_read(&mut self, buf: &mut BytesMut) -> io::Result<ReadStatus>;

    /// Queue `data` for sending.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self);
}

pub trait Connector {
    /// Start a connection to `authority`. The returned transport may still
    /// be connecting; writes are queued until it is up.
    fn connect(&mut self, authority: &Authority, secure: bool) -> io::Result<Box<dyn Transport>>;

    /// Map a host to the remote address that identifies its endpoint.
    /// Names that resolve to the same address share connections and
    /// blacklist entries. The default keeps the name and leaves lookup to
    /// [`connect`](Connector::connect).
    fn resolve(&mut self, authority: &Authority) -> io::Result<Authority> {
        Ok(authority.clone())
    }

    /// Notified whenever any transport from this connector has news.
    fn wakeup(&self) -> Option<Arc<Notify>> {
        None
    }
}
