//! Fetchpool - parallel, pipelining HTTP/1.1 and FTP retrieval
//!
//! Core library: the request pool, per-endpoint connections and the
//! protocol engines they drive.

pub mod blacklist;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod ftp;
pub mod http;
pub mod pool;
pub mod request;
pub mod stream;
pub mod transport;
pub mod upload;

pub use blacklist::PipelineBlacklist;
pub use config::{Config, PoolConfig};
pub use error::{BrokenReason, FetchError};
pub use pool::Pool;
pub use stream::{UrlLink, UrlStream};
pub use transport::TcpConnector;
pub use upload::{BufferSource, ChannelSource, SourcePoll, UploadSource};
