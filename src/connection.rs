//! Per-endpoint connections.
//!
//! A [`Connection`] owns one transport, the FIFO of requests it has sent
//! (`sent`) and the FIFO of requests it has accepted but not sent yet
//! (`waiting`). The protocol-independent parts (scheduling policy, deadlines,
//! closing and failing requests) live here in [`Core`]; HTTP and FTP supply
//! the wire protocol through the [`Protocol`] variants.
//!
//! ```text
//!   waiting ──dispatch──► sent ──response complete──► done()
//!      │                    │
//!      └──── close ─────────┴──► failed, or handed back to the pool
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::blacklist::PipelineBlacklist;
use crate::config::PoolConfig;
use crate::endpoint::{Endpoint, Scheme, Target};
use crate::error::{BrokenReason, FetchError};
use crate::ftp::connection::FtpConnection;
use crate::http::connection::HttpConnection;
use crate::request::{IdGen, Request, RequestId};
use crate::transport::{Connector, ReadStatus, Transport};

/// How a connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Close {
    /// Nothing went wrong; unanswered requests go back to the pool.
    Clean,
    /// The server hung up while requests were outstanding.
    ServerClosed,
    /// Every outstanding request fails with this error.
    Failed(FetchError),
    /// The server mishandles pipelining; outstanding requests are retried
    /// on a fresh connection.
    Broken(BrokenReason),
}

/// State shared by every protocol.
pub struct Core {
    pub endpoint: Endpoint,
    pub transport: Box<dyn Transport>,
    /// Bytes received but not parsed yet.
    pub inbuf: BytesMut,
    /// The server closed its side.
    pub eof: bool,
    pub bytes_received: usize,
    pub sent: VecDeque<Request>,
    pub waiting: VecDeque<Request>,
    /// Requests put on the wire so far.
    pub request_count: usize,
    pub max_requests: usize,
    /// The head of `sent`, while its response body is streaming.
    pub current: Option<RequestId>,
    pub deadline: Instant,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub ids: IdGen,
    closed: Option<Close>,
    returned: Vec<Request>,
    activity: bool,
}

impl Core {
    /// Queue bytes on the transport.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Close> {
        self.activity = true;
        self.transport
            .write(data)
            .map_err(|e| Close::Failed(FetchError::from(e)))
    }

    /// Apply the scheduling policy and pop the next request to send.
    ///
    /// Nothing is dispatched past the per-connection cap, after the server
    /// hung up, behind an upload whose bytes are not on the wire yet, or
    /// (without pipelining) while another response is outstanding.
    pub fn next_dispatchable(&mut self, pipelining: bool) -> Option<Request> {
        if self.closed.is_some() || self.eof || self.request_count >= self.max_requests {
            return None;
        }
        if !pipelining && !self.sent.is_empty() {
            return None;
        }
        if self.sent.back().is_some_and(|r| !r.wire_sent) {
            return None;
        }
        self.waiting.pop_front()
    }

    /// Remove the head of `sent` once its response is complete.
    pub fn complete_head(&mut self) -> Option<Request> {
        self.current = None;
        self.activity = true;
        self.sent.pop_front()
    }

    /// Note progress so the deadline is pushed back.
    pub fn touch(&mut self) {
        self.activity = true;
    }

    pub fn has_work(&self) -> bool {
        self.sent.iter().chain(self.waiting.iter()).any(|r| !r.synthetic)
    }

    pub fn is_exhausted(&self) -> bool {
        self.request_count >= self.max_requests
    }
}

/// Protocol engines selected by URL scheme.
pub enum Protocol {
    Http(HttpConnection),
    Ftp(FtpConnection),
}

pub struct Connection {
    core: Core,
    proto: Protocol,
}

impl Connection {
    /// Connect to `endpoint` and set up the protocol engine for `target`.
    pub fn open(
        target: &Target,
        endpoint: Endpoint,
        config: &PoolConfig,
        connector: &mut dyn Connector,
        blacklist: &PipelineBlacklist,
        ids: IdGen,
        now: Instant,
    ) -> Result<Self, FetchError> {
        let transport = connector.connect(&endpoint.authority, endpoint.scheme.is_secure())?;

        let proto = match endpoint.scheme {
            Scheme::Http | Scheme::Https => Protocol::Http(HttpConnection::new(
                endpoint.authority.clone(),
                config.pipelining && !blacklist.contains(&endpoint.authority),
                blacklist.clone(),
            )),
            Scheme::Ftp => Protocol::Ftp(FtpConnection::new(target, config, now)),
        };

        tracing::info!(
            endpoint = %endpoint,
            pipelining = matches!(&proto, Protocol::Http(h) if h.pipelining()),
            "Opening server connection"
        );

        Ok(Self {
            core: Core {
                endpoint,
                transport,
                inbuf: BytesMut::with_capacity(8192),
                eof: false,
                bytes_received: 0,
                sent: VecDeque::new(),
                waiting: VecDeque::new(),
                request_count: 0,
                max_requests: config.max_requests,
                current: None,
                deadline: now + config.request_timeout(),
                request_timeout: config.request_timeout(),
                idle_timeout: config.idle_timeout(),
                ids,
                closed: None,
                returned: Vec::new(),
                activity: false,
            },
            proto,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.core.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&Close> {
        self.core.closed.as_ref()
    }

    pub fn deadline(&self) -> Instant {
        self.core.deadline
    }

    pub fn request_count(&self) -> usize {
        self.core.request_count
    }

    pub fn has_work(&self) -> bool {
        self.core.has_work()
    }

    /// True if this connection is worth giving another request.
    pub fn can_accept(&self) -> bool {
        self.core.closed.is_none()
            && !self.core.eof
            && self.core.request_count + self.core.waiting.len() < self.core.max_requests
    }

    /// Out of request budget with nothing left in flight.
    pub fn should_retire(&self) -> bool {
        self.core.is_exhausted() && self.core.sent.is_empty()
    }

    pub fn add_request(&mut self, request: Request, now: Instant) {
        tracing::debug!(
            endpoint = %self.core.endpoint,
            request = %request.id,
            url = %request.target,
            "Queued request"
        );
        self.core.waiting.push_back(request);
        if let Err(kind) = self.request_next() {
            self.close(kind);
            return;
        }
        self.core.deadline = now + self.current_timeout();
    }

    /// Withdraw a request that has not been sent yet.
    pub fn remove_request(&mut self, id: RequestId) -> Option<Request> {
        let pos = self.core.waiting.iter().position(|r| r.id == id)?;
        self.core.waiting.remove(pos)
    }

    /// Requests this connection gave back after closing.
    pub fn take_returned(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.core.returned)
    }

    /// Run one scheduling quantum.
    pub fn execute(&mut self, now: Instant, connector: &mut dyn Connector) {
        if self.core.closed.is_some() {
            return;
        }
        self.core.activity = false;

        let abandoned: Vec<RequestId> = self
            .core
            .waiting
            .iter()
            .filter(|r| r.is_abandoned())
            .map(|r| r.id)
            .collect();
        for id in abandoned {
            if let Some(mut req) = self.remove_request(id) {
                tracing::debug!(request = %req.id, "Dropping cancelled request");
                req.fail(FetchError::Cancelled);
            }
        }

        if let Err(kind) = self.pump(now, connector) {
            self.close(kind);
            return;
        }

        if self.core.activity {
            self.core.deadline = now + self.current_timeout();
        }
        if !self.busy()
            && let Protocol::Ftp(ftp) = &self.proto
        {
            self.core.deadline = ftp.idle_deadline(self.core.idle_timeout);
        }
    }

    fn pump(&mut self, now: Instant, connector: &mut dyn Connector) -> Result<(), Close> {
        loop {
            match self.core.transport.poll_read(&mut self.core.inbuf) {
                Ok(ReadStatus::Data(n)) => {
                    self.core.bytes_received += n;
                    self.core.activity = true;
                }
                Ok(ReadStatus::Pending) => break,
                Ok(ReadStatus::Closed) => {
                    self.core.eof = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!(endpoint = %self.core.endpoint, error = %e, "Read failed");
                    return Err(Close::Failed(FetchError::from(e)));
                }
            }
        }

        if !self.core.activity && now >= self.core.deadline {
            if self.busy() {
                tracing::warn!(endpoint = %self.core.endpoint, "Timed out waiting for server");
                return Err(Close::Failed(FetchError::Timeout));
            }
            tracing::debug!(endpoint = %self.core.endpoint, "Idle timeout");
            return Err(Close::Clean);
        }

        match &mut self.proto {
            Protocol::Http(http) => http.execute(&mut self.core)?,
            Protocol::Ftp(ftp) => ftp.execute(&mut self.core, connector, now)?,
        }

        if self.core.eof {
            match &mut self.proto {
                Protocol::Http(http) => http.on_eof(&mut self.core)?,
                Protocol::Ftp(ftp) => ftp.on_eof(&mut self.core)?,
            }
        }
        Ok(())
    }

    fn request_next(&mut self) -> Result<(), Close> {
        match &mut self.proto {
            Protocol::Http(http) => http.request_next(&mut self.core),
            Protocol::Ftp(ftp) => ftp.request_next(&mut self.core),
        }
    }

    fn busy(&self) -> bool {
        !self.core.sent.is_empty() || !self.core.waiting.is_empty()
    }

    fn current_timeout(&self) -> Duration {
        if self.busy() {
            self.core.request_timeout
        } else {
            self.core.idle_timeout
        }
    }

    /// Tear the connection down and settle every request it still holds.
    pub fn close(&mut self, kind: Close) {
        if self.core.closed.is_some() {
            return;
        }

        let kind = match &mut self.proto {
            Protocol::Http(http) => http.on_close(&mut self.core, kind),
            Protocol::Ftp(ftp) => ftp.on_close(&mut self.core, kind),
        };

        match &kind {
            Close::Failed(err) => {
                tracing::warn!(endpoint = %self.core.endpoint, error = %err, "Closing after error")
            }
            _ => tracing::info!(endpoint = %self.core.endpoint, reason = ?kind, "Closing"),
        }

        self.core.transport.close();
        self.core.current = None;

        let mut outstanding: Vec<Request> = self.core.sent.drain(..).collect();
        outstanding.extend(self.core.waiting.drain(..));
        let mut blamed = false;

        for mut req in outstanding {
            if req.synthetic {
                continue;
            }
            match &kind {
                Close::Failed(err) => {
                    tracing::warn!(request = %req.id, url = %req.target, "Request failed");
                    req.fail(err.clone());
                }
                Close::ServerClosed if !blamed => {
                    // Only the request the server was answering is charged
                    // with the hang-up, so a misbehaving server cannot make
                    // us retry forever.
                    blamed = true;
                    tracing::warn!(request = %req.id, url = %req.target, "Request failed");
                    req.fail(FetchError::ConnectionClosed);
                }
                Close::Broken(reason) if req.in_use => req.fail(FetchError::PipeliningBroken(*reason)),
                _ if req.in_use => req.fail(FetchError::ConnectionClosed),
                _ => {
                    req.reset_attempt();
                    self.core.returned.push(req);
                }
            }
        }

        self.core.closed = Some(kind);
    }
}
