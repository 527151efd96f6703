//! Request pool
//!
//! The pool is the only entry point for submitting work. It keys
//! connections by endpoint, reuses a live connection while it has request
//! budget left, opens new ones up to the global connection limit and keeps
//! everything else queued until capacity frees up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::blacklist::PipelineBlacklist;
use crate::config::PoolConfig;
use crate::connection::{Close, Connection};
use crate::endpoint::{Authority, Endpoint};
use crate::error::FetchError;
use crate::request::{IdGen, Request};
use crate::stream::{self, UrlStream};
use crate::transport::Connector;
use crate::upload::UploadSource;

/// Longest the reactor sleeps before polling upload sources and
/// cancelled streams again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Pool<C: Connector> {
    config: PoolConfig,
    connector: C,
    blacklist: PipelineBlacklist,
    ids: IdGen,
    conns: Vec<Connection>,
    /// Host to remote address, as answered by the connector.
    resolved: HashMap<Authority, Authority>,
    /// Requests not yet handed to a connection, oldest first.
    pending: VecDeque<Request>,
}

impl<C: Connector> Pool<C> {
    /// Create a pool with its own, empty pipelining blacklist.
    pub fn new(config: PoolConfig, connector: C) -> Self {
        Self::with_blacklist(config, connector, PipelineBlacklist::new())
    }

    /// Create a pool sharing `blacklist` with whoever else holds it.
    pub fn with_blacklist(config: PoolConfig, connector: C, blacklist: PipelineBlacklist) -> Self {
        Self {
            config,
            connector,
            blacklist,
            ids: IdGen::default(),
            conns: Vec::new(),
            resolved: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn blacklist(&self) -> &PipelineBlacklist {
        &self.blacklist
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Requests still waiting for a connection.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Submit a download.
    ///
    /// A malformed URL yields a stream that has already failed with
    /// [`FetchError::InvalidUrl`].
    pub fn addurl(&mut self, url: &str, headers: &str, headers_only: bool) -> UrlStream {
        let (sink, stream) = stream::channel(url);
        let headers = self.with_user_agent(headers);
        match Request::download(self.ids.next(), url, &headers, false, headers_only) {
            Ok(req) => {
                tracing::debug!(request = %req.id, url = %req.target, "Added URL");
                self.pending.push_back(req.with_sink(sink));
                self.dispatch(Instant::now());
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "Rejected URL");
                sink.fail(err);
            }
        }
        stream
    }

    /// Submit an upload whose body is pulled from `source`.
    ///
    /// With `create_dirs`, a `MKCOL` for every ancestor collection is sent
    /// ahead of the `PUT`.
    pub fn addputurl(
        &mut self,
        url: &str,
        headers: &str,
        source: impl UploadSource + 'static,
        create_dirs: bool,
    ) -> UrlStream {
        let (sink, stream) = stream::channel(url);
        let headers = self.with_user_agent(headers);
        let req = match Request::upload(self.ids.next(), url, &headers, Box::new(source), create_dirs) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(url, error = %err, "Rejected upload");
                sink.fail(err);
                return stream;
            }
        };

        if create_dirs {
            for dir in ancestors(&req.target.path()) {
                let mkcol = Request::make_collection(self.ids.next(), &req.target, &dir);
                tracing::debug!(request = %mkcol.id, url = %mkcol.target, "Added collection");
                self.pending.push_back(mkcol);
            }
        }
        tracing::debug!(request = %req.id, url = %req.target, "Added upload");
        self.pending.push_back(req.with_sink(sink));
        self.dispatch(Instant::now());
        stream
    }

    fn with_user_agent(&self, headers: &str) -> String {
        let Some(agent) = &self.config.user_agent else {
            return headers.to_string();
        };
        let named = headers.lines().any(|line| {
            line.split_once(':')
                .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("User-Agent"))
        });
        if named {
            return headers.to_string();
        }
        let headers = headers.trim();
        if headers.is_empty() {
            format!("User-Agent: {}", agent)
        } else {
            format!("{}\r\nUser-Agent: {}", headers, agent)
        }
    }

    /// True once no request remains anywhere in the pool.
    pub fn idle(&self) -> bool {
        self.pending.is_empty() && self.conns.iter().all(|c| !c.has_work())
    }

    /// Earliest connection deadline, if any connection is open.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.conns.iter().map(Connection::deadline).min()
    }

    /// Run one scheduling quantum at time `now`.
    pub fn execute(&mut self, now: Instant) {
        for conn in &mut self.conns {
            conn.execute(now, &mut self.connector);
        }

        let mut returned = Vec::new();
        self.conns.retain_mut(|conn| {
            if !conn.is_closed() && conn.should_retire() {
                tracing::debug!(endpoint = %conn.endpoint(), "Request budget used up");
                conn.close(Close::Clean);
            }
            if !conn.is_closed() {
                return true;
            }
            returned.extend(conn.take_returned());
            false
        });

        // Handed-back requests are older than anything still pending.
        for req in returned.into_iter().rev() {
            tracing::debug!(request = %req.id, url = %req.target, "Requeued request");
            self.pending.push_front(req);
        }
        self.dispatch(now);
    }

    /// Hand pending requests to connections, in submission order per
    /// endpoint.
    fn dispatch(&mut self, now: Instant) {
        let mut blocked: HashSet<Endpoint> = HashSet::new();
        let mut remaining = VecDeque::new();

        while let Some(mut req) = self.pending.pop_front() {
            if req.is_abandoned() {
                tracing::debug!(request = %req.id, "Dropping cancelled request");
                req.fail(FetchError::Cancelled);
                continue;
            }

            let endpoint = match self.resolve(&req) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    tracing::warn!(url = %req.target, error = %err, "Failed to resolve");
                    if !req.synthetic {
                        req.fail(err);
                    }
                    continue;
                }
            };
            if blocked.contains(&endpoint) {
                remaining.push_back(req);
                continue;
            }

            if let Some(conn) = self
                .conns
                .iter_mut()
                .find(|c| c.endpoint() == &endpoint && c.can_accept())
            {
                conn.add_request(req, now);
                continue;
            }

            if self.conns.len() >= self.config.max_connections {
                tracing::trace!(endpoint = %endpoint, "Connection limit reached");
                blocked.insert(endpoint);
                remaining.push_back(req);
                continue;
            }

            match Connection::open(
                &req.target,
                endpoint.clone(),
                &self.config,
                &mut self.connector,
                &self.blacklist,
                self.ids.clone(),
                now,
            ) {
                Ok(mut conn) => {
                    conn.add_request(req, now);
                    self.conns.push(conn);
                }
                Err(err) => {
                    tracing::warn!(endpoint = %endpoint, error = %err, "Failed to connect");
                    if req.synthetic {
                        continue;
                    }
                    req.fail(err);
                }
            }
        }

        self.pending = remaining;
    }

    /// Pooling key for `req`, with the host replaced by its remote address.
    fn resolve(&mut self, req: &Request) -> Result<Endpoint, FetchError> {
        let mut endpoint = req.endpoint();
        let address = match self.resolved.get(&endpoint.authority) {
            Some(address) => address.clone(),
            None => {
                let address = self.connector.resolve(&endpoint.authority)?;
                tracing::trace!(host = %endpoint.authority, address = %address, "Resolved");
                self.resolved.insert(endpoint.authority.clone(), address.clone());
                address
            }
        };
        endpoint.authority = address;
        Ok(endpoint)
    }

    /// Drive the pool until every submitted request has completed.
    pub async fn run_until_idle(&mut self) {
        let wakeup = self.connector.wakeup();
        loop {
            self.execute(Instant::now());
            if self.idle() {
                tracing::debug!(connections = self.conns.len(), "Pool is idle");
                return;
            }

            let cap = Instant::now() + POLL_INTERVAL;
            let until = self.next_deadline().map_or(cap, |d| d.min(cap));
            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(until));

            match &wakeup {
                Some(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = sleep => {}
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Close every connection. Requests that have not completed fail with
    /// [`FetchError::Cancelled`].
    pub fn close_all(&mut self) {
        for mut conn in self.conns.drain(..) {
            conn.close(Close::Clean);
            self.pending.extend(conn.take_returned());
        }
        for mut req in self.pending.drain(..) {
            req.fail(FetchError::Cancelled);
        }
    }
}

/// Collections above `path`: `/a/b/file` gives `/a/` and `/a/b/`.
fn ancestors(path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or(path);
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = path.get(end + 1..).and_then(|rest| rest.find('/')) {
        end += 1 + pos;
        out.push(path[..=end].to_string());
    }
    out
}
