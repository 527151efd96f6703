//! Sources of upload bodies.

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Result of polling an [`UploadSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll {
    Data(Bytes),
    /// Nothing available yet; poll again on the next quantum.
    Pending,
    Eof,
}

/// Body data for an upload, pulled without blocking.
pub trait UploadSource {
    fn poll_chunk(&mut self) -> SourcePoll;
}

/// An upload body that is already in memory.
pub struct BufferSource {
    data: Option<Bytes>,
}

impl BufferSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }
}

impl UploadSource for BufferSource {
    fn poll_chunk(&mut self) -> SourcePoll {
        match self.data.take() {
            Some(data) if !data.is_empty() => SourcePoll::Data(data),
            _ => SourcePoll::Eof,
        }
    }
}

/// An upload body fed by the caller a piece at a time.
///
/// The upload ends when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

impl UploadSource for ChannelSource {
    fn poll_chunk(&mut self) -> SourcePoll {
        match self.rx.try_recv() {
            Ok(data) => SourcePoll::Data(data),
            Err(TryRecvError::Empty) => SourcePoll::Pending,
            Err(TryRecvError::Disconnected) => SourcePoll::Eof,
        }
    }
}
