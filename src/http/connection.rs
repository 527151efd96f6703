//! HTTP/1.1 client connection state machine.
//!
//! Responses are decoded incrementally from whatever bytes the transport
//! delivered, one named phase at a time:
//!
//! ```text
//!   Header ──blank line──┬─ Content-Length ──► Length ───────────────┐
//!     ▲                  ├─ chunked ─► ChunkSize ◄─► ChunkData        │
//!     │                  │                 └─ 0 ─► ChunkTrailer ──────┤
//!     │                  ├─ neither ──► UntilClose ──EOF─────────────┤
//!     │                  └─ HEAD / 204 / 304 ─────────────────────────┤
//!     └──────────────────────── request done ◄───────────────────────┘
//! ```
//!
//! When pipelining is enabled, the first request on a connection is
//! preceded by a `HEAD` pipeline test for a path that should not exist.
//! Its answers let us notice servers that lose, duplicate or mangle pipelined
//! requests; such servers go on the shared [`PipelineBlacklist`] and the
//! connection is replaced by an unpipelined one.

use crate::blacklist::PipelineBlacklist;
use crate::connection::{Close, Core};
use crate::endpoint::Authority;
use crate::error::{BrokenReason, FetchError};
use crate::http::parser::{
    ParseError, is_chunked, parse_chunk_size, parse_content_length, parse_header,
    parse_status_line, take_line,
};
use crate::request::{Method, Request};

/// Body framing announced by the response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Unknown,
    Chunked,
    ContentLength,
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Header,
    Length,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    UntilClose,
}

pub struct HttpConnection {
    authority: Authority,
    blacklist: PipelineBlacklist,
    enable_pipelining: bool,
    phase: Phase,
    encoding: Encoding,
    /// Bytes left in the body (Length) or the current chunk (ChunkData).
    remaining: usize,
    /// Status line of the response being read.
    http_response: Option<String>,
    pipeline_test_started: bool,
    pipeline_test_count: u32,
    last_was_pipeline_test: bool,
    pipeline_test_response: Option<String>,
}

fn violation(err: ParseError) -> Close {
    Close::Failed(FetchError::ProtocolViolation(err.to_string()))
}

impl HttpConnection {
    pub fn new(authority: Authority, enable_pipelining: bool, blacklist: PipelineBlacklist) -> Self {
        Self {
            authority,
            blacklist,
            enable_pipelining,
            phase: Phase::Header,
            encoding: Encoding::Unknown,
            remaining: 0,
            http_response: None,
            pipeline_test_started: false,
            pipeline_test_count: 0,
            last_was_pipeline_test: false,
            pipeline_test_response: None,
        }
    }

    pub fn pipelining(&self) -> bool {
        self.enable_pipelining
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Send as many waiting requests as the scheduling policy allows.
    pub fn request_next(&mut self, core: &mut Core) -> Result<(), Close> {
        while let Some(req) = core.next_dispatchable(self.enable_pipelining) {
            if req.awaiting_upload() {
                // Sent once the whole body is in hand.
                core.sent.push_back(req);
                self.pump_upload(core)?;
            } else {
                if self.enable_pipelining && core.request_count == 0 && core.max_requests > 1 {
                    self.start_pipeline_test(core, &req)?;
                }
                self.send_request(core, req)?;
            }
        }
        Ok(())
    }

    fn send_request(&mut self, core: &mut Core, mut req: Request) -> Result<(), Close> {
        core.request_count += 1;
        let keep_alive = req.pipeline_test || core.request_count < core.max_requests;
        tracing::debug!(
            endpoint = %self.authority,
            request = %req.id,
            count = core.request_count,
            method = req.method.as_str(),
            url = %req.target,
            "Sending request"
        );
        let bytes = req.request_line(keep_alive);
        req.wire_sent = true;
        core.sent.push_back(req);
        core.write(&bytes)
    }

    fn start_pipeline_test(&mut self, core: &mut Core, like: &Request) -> Result<(), Close> {
        let test = Request::pipeline_test(core.ids.next(), &like.target);
        self.pipeline_test_started = true;
        self.send_request(core, test)
    }

    /// Pull upload data for the unsent request at the back of `sent`.
    fn pump_upload(&mut self, core: &mut Core) -> Result<(), Close> {
        use crate::upload::SourcePoll;

        let Some(req) = core.sent.back_mut() else {
            return Ok(());
        };
        if req.wire_sent {
            return Ok(());
        }
        while let Some(source) = req.source.as_mut() {
            match source.poll_chunk() {
                SourcePoll::Data(data) => req.upload.extend_from_slice(&data),
                SourcePoll::Pending => return Ok(()),
                SourcePoll::Eof => req.source = None,
            }
        }

        core.request_count += 1;
        let keep_alive = core.request_count < core.max_requests;
        let bytes = req.request_line(keep_alive);
        req.wire_sent = true;
        tracing::debug!(
            endpoint = %self.authority,
            request = %req.id,
            size = req.upload.len(),
            url = %req.target,
            "Sending upload"
        );
        core.write(&bytes)?;
        self.request_next(core)
    }

    /// Decode as much of the buffered input as possible.
    pub fn execute(&mut self, core: &mut Core) -> Result<(), Close> {
        // Die if somebody closed the stream of the body being read, so the
        // next request can start right away.
        if core.current.is_some() && core.sent.front().is_some_and(|r| r.is_abandoned()) {
            // Don't blame pipelining for this.
            self.pipeline_test_count += 1;
            self.last_was_pipeline_test = false;
            if let Some(mut req) = core.complete_head() {
                tracing::info!(request = %req.id, url = %req.target, "Cancelled by caller");
                req.fail(FetchError::Cancelled);
            }
            return Err(Close::Clean);
        }

        self.pump_upload(core)?;

        loop {
            let progressed = match self.phase {
                Phase::Header => self.read_header(core)?,
                Phase::Length => self.read_body(core)?,
                Phase::ChunkSize | Phase::ChunkTrailer => self.read_chunk_line(core)?,
                Phase::ChunkData => self.read_body(core)?,
                Phase::UntilClose => {
                    let data = core.inbuf.split();
                    if !data.is_empty() {
                        tracing::trace!(len = data.len(), "Infinity: read bytes");
                        write_to_head(core, &data);
                    }
                    false
                }
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn read_header(&mut self, core: &mut Core) -> Result<bool, Close> {
        let Some(line) = take_line(&mut core.inbuf).map_err(violation)? else {
            return Ok(false);
        };
        let line = line.trim();
        tracing::trace!(header = line, "Header");

        if self.http_response.is_none() {
            if line.is_empty() {
                return Ok(true);
            }
            if !core.sent.front().is_some_and(|r| r.wire_sent) {
                tracing::warn!(endpoint = %self.authority, "Got unsolicited data");
                return Err(Close::Failed(FetchError::ProtocolViolation(
                    "unsolicited data from server".to_string(),
                )));
            }

            // There are never two pipeline tests in a row, so a response
            // identical to the test's means what was sent in between was
            // lost.
            if self.last_was_pipeline_test && self.pipeline_test_response.as_deref() == Some(line) {
                return Err(Close::Broken(BrokenReason::DuplicateResponse));
            }

            let status = parse_status_line(line).map_err(violation)?;

            // We never send invalid requests, so a 400 right after a test
            // means the bytes that followed it got mangled.
            if self.last_was_pipeline_test && status.code == 400 {
                return Err(Close::Broken(BrokenReason::BadRequestAfterTest));
            }

            if let Some(head) = core.sent.front_mut() {
                head.in_use = true;
                if let Some(sink) = head.sink() {
                    sink.set_status(&status.version, status.code);
                }
            }
            self.http_response = Some(line.to_string());
            return Ok(true);
        }

        if !line.is_empty() {
            if let Some((name, value)) = parse_header(line) {
                if name.eq_ignore_ascii_case("Content-Length") {
                    let len = parse_content_length(value).map_err(violation)?;
                    if self.encoding != Encoding::Chunked {
                        self.encoding = Encoding::ContentLength;
                        self.remaining = len;
                    }
                } else if name.eq_ignore_ascii_case("Transfer-Encoding") && is_chunked(value) {
                    self.encoding = Encoding::Chunked;
                    self.remaining = 0;
                }
                if let Some(sink) = core.sent.front().and_then(|r| r.sink()) {
                    sink.add_header(name, value);
                }
            }
            return Ok(true);
        }

        // Blank line: the data section begins.
        let status = self
            .http_response
            .as_deref()
            .and_then(|l| parse_status_line(l).ok())
            .map(|s| s.code)
            .unwrap_or(0);

        if (100..200).contains(&status) {
            // Interim response; the real one follows.
            self.reset_response();
            return Ok(true);
        }

        if self.encoding == Encoding::Unknown {
            // Go until the connection closes itself.
            self.encoding = Encoding::Infinite;
        }
        core.current = core.sent.front().map(|r| r.id);

        let head_only = core
            .sent
            .front()
            .is_some_and(|r| r.method == Method::HEAD)
            || status == 204
            || status == 304;

        tracing::trace!(encoding = ?self.encoding, remaining = self.remaining, "Starting data");

        if head_only {
            tracing::debug!(endpoint = %self.authority, "Got all headers");
            self.request_done(core)?;
            return Ok(true);
        }

        self.phase = match self.encoding {
            Encoding::Chunked => Phase::ChunkSize,
            Encoding::ContentLength => Phase::Length,
            _ => Phase::UntilClose,
        };
        Ok(true)
    }

    /// Copy up to `remaining` bytes into the current request's stream.
    fn read_body(&mut self, core: &mut Core) -> Result<bool, Close> {
        if self.remaining == 0 {
            match self.phase {
                Phase::Length => {
                    self.request_done(core)?;
                    return Ok(true);
                }
                _ => {
                    self.phase = Phase::ChunkSize;
                    return Ok(true);
                }
            }
        }
        if core.inbuf.is_empty() {
            return Ok(false);
        }

        let n = self.remaining.min(core.inbuf.len());
        let data = core.inbuf.split_to(n);
        self.remaining -= n;
        tracing::trace!(len = n, left = self.remaining, "Read body bytes");
        write_to_head(core, &data);
        Ok(true)
    }

    fn read_chunk_line(&mut self, core: &mut Core) -> Result<bool, Close> {
        let Some(line) = take_line(&mut core.inbuf).map_err(violation)? else {
            return Ok(false);
        };
        let line = line.trim();

        if self.phase == Phase::ChunkTrailer {
            tracing::trace!(trailer = line, "Trailer");
            // A blank line means we're finally done.
            if line.is_empty() {
                self.request_done(core)?;
            }
            return Ok(true);
        }

        // The CRLF that closes a chunk's data shows up here as a blank line.
        if line.is_empty() {
            return Ok(true);
        }

        let size = parse_chunk_size(line).map_err(violation)?;
        tracing::trace!(size, line, "Chunk length");
        if size == 0 {
            self.phase = Phase::ChunkTrailer;
        } else {
            self.remaining = size;
            self.phase = Phase::ChunkData;
        }
        Ok(true)
    }

    fn reset_response(&mut self) {
        self.http_response = None;
        self.phase = Phase::Header;
        self.encoding = Encoding::Unknown;
        self.remaining = 0;
    }

    /// The current response is complete.
    fn request_done(&mut self, core: &mut Core) -> Result<(), Close> {
        let response = self.http_response.take();
        self.reset_response();

        let Some(mut req) = core.complete_head() else {
            return Ok(());
        };
        tracing::info!(endpoint = %self.authority, request = %req.id, url = %req.target, "Done URL");

        self.last_was_pipeline_test = req.pipeline_test;
        let mut broken = None;
        if req.pipeline_test {
            self.pipeline_test_count += 1;
            if self.pipeline_test_count == 1 {
                if core.request_count < core.max_requests {
                    self.start_pipeline_test(core, &req)?;
                }
            } else if self.pipeline_test_response != response {
                // Late in the game, but two identical pipeline tests must
                // get identical answers.
                broken = Some(BrokenReason::InconsistentTests);
            }
            self.pipeline_test_response = response;
        }

        req.done();

        if let Some(reason) = broken {
            return Err(Close::Broken(reason));
        }
        self.request_next(core)
    }

    pub fn on_eof(&mut self, core: &mut Core) -> Result<(), Close> {
        if self.phase == Phase::UntilClose {
            // No way to tell whether everything arrived; that's the price
            // of a body without framing.
            let data = core.inbuf.split();
            write_to_head(core, &data);
            self.request_done(core)?;
            return Err(Close::Clean);
        }
        if core.sent.is_empty() && core.inbuf.is_empty() {
            return Err(Close::Clean);
        }
        Err(Close::ServerClosed)
    }

    pub fn on_close(&mut self, core: &mut Core, kind: Close) -> Close {
        let never_connected = core.bytes_received == 0
            && matches!(kind, Close::Failed(FetchError::Transport(_)));

        // Closing without at least one good pipeline test and a following
        // request means pipelining never worked here.
        let closed_early = self.enable_pipelining
            && core.max_requests > 1
            && self.pipeline_test_started
            && !never_connected
            && !matches!(kind, Close::Broken(_))
            && (self.pipeline_test_count < 1
                || (self.pipeline_test_count == 1 && self.last_was_pipeline_test));

        match kind {
            // A failure still fails every request; the server is only
            // remembered as unfit for pipelining.
            Close::Failed(_) if closed_early => {
                self.pipelining_is_broken(BrokenReason::ClosedEarly);
                kind
            }
            _ if closed_early => {
                self.pipelining_is_broken(BrokenReason::ClosedEarly);
                Close::Broken(BrokenReason::ClosedEarly)
            }
            Close::Broken(reason) => {
                self.pipelining_is_broken(reason);
                kind
            }
            _ => kind,
        }
    }

    fn pipelining_is_broken(&mut self, reason: BrokenReason) {
        if self.blacklist.insert(self.authority.clone()) {
            tracing::warn!(
                endpoint = %self.authority,
                code = reason.code(),
                reason = %reason,
                "Pipelining is broken on this server, disabling"
            );
        }
    }
}

fn write_to_head(core: &mut Core, data: &[u8]) {
    if let Some(sink) = core.sent.front().and_then(|r| r.sink()) {
        sink.write(data);
    }
}
