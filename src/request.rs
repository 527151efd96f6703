use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;

use crate::endpoint::{Endpoint, Scheme, Target};
use crate::error::FetchError;
use crate::http::writer::{RequestParts, serialize_request};
use crate::stream::Sink;
use crate::upload::UploadSource;

/// Request methods the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// PUT - Upload a resource
    PUT,
    /// MKCOL - Create a WebDAV collection
    MKCOL,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::PUT => "PUT",
            Method::MKCOL => "MKCOL",
        }
    }
}

/// Pool-wide request number, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out request ids; clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct IdGen(Arc<AtomicU64>);

impl IdGen {
    pub fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// One fetch or upload plus the bookkeeping of its current attempt.
///
/// A request belongs to exactly one place at a time: the pool's pending
/// queue or one connection's `waiting`/`sent` queue.
pub struct Request {
    pub id: RequestId,
    pub target: Target,
    pub method: Method,
    /// Extra header lines supplied by the caller.
    pub headers: String,
    pub pipeline_test: bool,
    pub headers_only: bool,
    pub create_dirs: bool,
    /// Set once response data for this request started arriving.
    pub in_use: bool,
    /// Generated by the engine itself; nobody waits on it.
    pub synthetic: bool,
    pub(crate) sink: Option<Sink>,
    pub(crate) source: Option<Box<dyn UploadSource>>,
    pub(crate) upload: BytesMut,
    /// Request bytes are on the wire.
    pub(crate) wire_sent: bool,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("target", &self.target.as_str())
            .field("method", &self.method)
            .field("pipeline_test", &self.pipeline_test)
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl Request {
    fn new(id: RequestId, target: Target, method: Method, headers: &str) -> Self {
        Self {
            id,
            target,
            method,
            headers: headers.to_string(),
            pipeline_test: false,
            headers_only: false,
            create_dirs: false,
            in_use: false,
            synthetic: false,
            sink: None,
            source: None,
            upload: BytesMut::new(),
            wire_sent: false,
        }
    }

    /// A download. `headers_only` turns it into a `HEAD`.
    pub fn download(
        id: RequestId,
        url: &str,
        headers: &str,
        pipeline_test: bool,
        headers_only: bool,
    ) -> Result<Self, FetchError> {
        let target = Target::parse(url)?;
        let method = if headers_only { Method::HEAD } else { Method::GET };
        let mut req = Self::new(id, target, method, headers);
        req.pipeline_test = pipeline_test;
        req.headers_only = headers_only;
        req.synthetic = pipeline_test;
        Ok(req)
    }

    /// An upload whose body is read from `source`.
    pub fn upload(
        id: RequestId,
        url: &str,
        headers: &str,
        source: Box<dyn UploadSource>,
        create_dirs: bool,
    ) -> Result<Self, FetchError> {
        let target = Target::parse(url)?;
        if target.scheme() == Scheme::Ftp {
            return Err(FetchError::Unsupported(
                "ftp uploads are not supported".to_string(),
            ));
        }
        let mut req = Self::new(id, target, Method::PUT, headers);
        req.source = Some(source);
        req.create_dirs = create_dirs;
        Ok(req)
    }

    /// The `HEAD` pipeline test sent to check whether a server pipelines correctly.
    pub fn pipeline_test(id: RequestId, like: &Target) -> Self {
        let target = like.with_path("/fetchpool-pipeline-check-should-not-exist/");
        let mut req = Self::new(id, target, Method::HEAD, "");
        req.pipeline_test = true;
        req.headers_only = true;
        req.synthetic = true;
        req
    }

    /// A `MKCOL` for one ancestor directory of an upload.
    pub fn make_collection(id: RequestId, like: &Target, path: &str) -> Self {
        let mut req = Self::new(id, like.with_path(path), Method::MKCOL, "");
        req.synthetic = true;
        req
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.target.endpoint()
    }

    pub fn sink(&self) -> Option<&Sink> {
        self.sink.as_ref()
    }

    /// True when the caller has gone away.
    pub fn is_abandoned(&self) -> bool {
        match &self.sink {
            Some(sink) => sink.is_closed(),
            None => false,
        }
    }

    /// True for uploads whose body has not been fully gathered yet.
    pub fn awaiting_upload(&self) -> bool {
        self.source.is_some()
    }

    /// The exact bytes to send for this request.
    pub fn request_line(&self, keep_alive: bool) -> Vec<u8> {
        let path = self.target.path();
        let user = self.target.user();
        let password = self.target.password();
        let body = match self.method {
            Method::PUT => Some(&self.upload[..]),
            _ => None,
        };
        serialize_request(&RequestParts {
            method: self.method.as_str(),
            path: &path,
            host: self.target.host(),
            port: self.target.port(),
            keep_alive,
            user: user.as_deref(),
            password: password.as_deref(),
            headers: &self.headers,
            body,
        })
    }

    /// Signal successful completion to the caller.
    pub fn done(&mut self) {
        if let Some(sink) = &self.sink {
            sink.finish();
        }
    }

    /// Signal failure to the caller.
    pub fn fail(&mut self, error: FetchError) {
        if let Some(sink) = &self.sink {
            sink.fail(error);
        }
    }

    /// Forget per-attempt state before handing the request to a new
    /// connection.
    pub(crate) fn reset_attempt(&mut self) {
        self.in_use = false;
        self.wire_sent = false;
    }
}
