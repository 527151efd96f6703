//! Scripted in-memory transports for driving pools without sockets.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use fetchpool::endpoint::Authority;
use fetchpool::transport::{Connector, ReadStatus, Transport};
use fetchpool::{Pool, PoolConfig};

#[derive(Default)]
struct WireState {
    written: Vec<u8>,
    inbound: VecDeque<Vec<u8>>,
    eof: bool,
    error: Option<io::ErrorKind>,
    broken_pipe: bool,
    closed: bool,
}

/// The server end of one mock connection.
#[derive(Clone, Default)]
pub struct Wire(Rc<RefCell<WireState>>);

impl Wire {
    /// Queue bytes for the client to read.
    pub fn push(&self, data: &str) {
        self.push_bytes(data.as_bytes());
    }

    pub fn push_bytes(&self, data: &[u8]) {
        self.0.borrow_mut().inbound.push_back(data.to_vec());
    }

    /// Close the server side once everything queued has been read.
    pub fn hang_up(&self) {
        self.0.borrow_mut().eof = true;
    }

    /// Make the next read fail.
    pub fn fail(&self, kind: io::ErrorKind) {
        self.0.borrow_mut().error = Some(kind);
    }

    /// Make every further write fail.
    pub fn break_pipe(&self) {
        self.0.borrow_mut().broken_pipe = true;
    }

    /// Everything the client wrote so far.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow().written).into_owned()
    }

    /// Everything the client wrote since the last call.
    pub fn take_written(&self) -> String {
        let bytes = std::mem::take(&mut self.0.borrow_mut().written);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

struct MockTransport {
    wire: Wire,
}

impl Transport for MockTransport {
    fn poll_read(&mut self, buf: &mut BytesMut) -> io::Result<ReadStatus> {
        let mut state = self.wire.0.borrow_mut();
        if let Some(kind) = state.error.take() {
            return Err(io::Error::new(kind, "scripted failure"));
        }
        if let Some(chunk) = state.inbound.pop_front() {
            buf.extend_from_slice(&chunk);
            return Ok(ReadStatus::Data(chunk.len()));
        }
        if state.eof {
            return Ok(ReadStatus::Closed);
        }
        Ok(ReadStatus::Pending)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.wire.0.borrow_mut();
        if state.closed || state.broken_pipe {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.wire.0.borrow_mut().closed = true;
    }
}

#[derive(Default)]
struct Opened {
    wires: Vec<(Authority, Wire)>,
    refuse: bool,
    /// Host name to address; `None` makes the lookup fail.
    hosts: HashMap<String, Option<String>>,
    lookups: usize,
}

/// Hands out [`Wire`]s in connection order. Clones share the record.
#[derive(Clone, Default)]
pub struct MockConnector(Rc<RefCell<Opened>>);

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`th connection opened.
    pub fn wire(&self, n: usize) -> Wire {
        self.0.borrow().wires[n].1.clone()
    }

    pub fn authority(&self, n: usize) -> Authority {
        self.0.borrow().wires[n].0.clone()
    }

    pub fn count(&self) -> usize {
        self.0.borrow().wires.len()
    }

    /// Refuse every further connection attempt.
    pub fn refuse(&self) {
        self.0.borrow_mut().refuse = true;
    }

    /// Resolve `host` to `address`, keeping the port.
    pub fn alias(&self, host: &str, address: &str) {
        self.0
            .borrow_mut()
            .hosts
            .insert(host.to_string(), Some(address.to_string()));
    }

    /// Make lookups of `host` fail.
    pub fn unknown_host(&self, host: &str) {
        self.0.borrow_mut().hosts.insert(host.to_string(), None);
    }

    /// Lookups answered so far.
    pub fn lookups(&self) -> usize {
        self.0.borrow().lookups
    }
}

impl Connector for MockConnector {
    fn resolve(&mut self, authority: &Authority) -> io::Result<Authority> {
        let mut opened = self.0.borrow_mut();
        opened.lookups += 1;
        match opened.hosts.get(&authority.host) {
            Some(Some(address)) => Ok(Authority::new(address.clone(), authority.port)),
            Some(None) => Err(io::Error::new(io::ErrorKind::NotFound, "unknown host")),
            None => Ok(authority.clone()),
        }
    }

    fn connect(&mut self, authority: &Authority, _secure: bool) -> io::Result<Box<dyn Transport>> {
        let mut opened = self.0.borrow_mut();
        if opened.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let wire = Wire::default();
        opened.wires.push((authority.clone(), wire.clone()));
        Ok(Box::new(MockTransport { wire }))
    }
}

pub fn config() -> PoolConfig {
    PoolConfig::default()
}

pub fn unpipelined() -> PoolConfig {
    PoolConfig {
        pipelining: false,
        ..PoolConfig::default()
    }
}

pub fn pool(config: PoolConfig) -> (Pool<MockConnector>, MockConnector) {
    let connector = MockConnector::new();
    (Pool::new(config, connector.clone()), connector)
}

pub fn secs(start: Instant, n: u64) -> Instant {
    start + Duration::from_secs(n)
}

pub const TEST_PATH: &str = "/fetchpool-pipeline-check-should-not-exist/";
pub const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

pub fn ok(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body)
}
