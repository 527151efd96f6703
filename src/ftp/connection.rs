//! FTP control connection state machine.
//!
//! Login happens once per connection; after that each request runs
//! `PASV`, opens the data channel, issues `RETR` (or `LIST` for URLs
//! ending in `/`) and completes when the data channel has closed and the
//! final control reply arrived, in whichever order those happen. One
//! request is in flight at a time.

use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::config::PoolConfig;
use crate::connection::{Close, Core};
use crate::endpoint::Target;
use crate::error::FetchError;
use crate::ftp::reply::{Reply, ReplyReader, parse_listing_line, parse_pasv};
use crate::http::parser::take_line;
use crate::transport::{Connector, ReadStatus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpPhase {
    /// Waiting for the `220` greeting.
    Greeting,
    User,
    Pass,
    Type,
    /// Logged in, nothing in flight.
    Ready,
    Pasv,
    /// `RETR`/`LIST` sent, waiting for the server to start the transfer.
    Start,
    Transfer,
}

pub struct FtpConnection {
    phase: FtpPhase,
    user: String,
    password: String,
    replies: ReplyReader,
    data: Option<Box<dyn Transport>>,
    data_buf: BytesMut,
    data_eof: bool,
    listing: BytesMut,
    final_reply: Option<Reply>,
    last_request_time: Instant,
}

impl FtpConnection {
    pub fn new(target: &Target, config: &PoolConfig, now: Instant) -> Self {
        let user = target.user().unwrap_or_else(|| "anonymous".to_string());
        let password = target
            .password()
            .unwrap_or_else(|| config.ftp_anonymous_password.clone());
        Self {
            phase: FtpPhase::Greeting,
            user,
            password,
            replies: ReplyReader::new(),
            data: None,
            data_buf: BytesMut::new(),
            data_eof: false,
            listing: BytesMut::new(),
            final_reply: None,
            last_request_time: now,
        }
    }

    pub fn phase(&self) -> FtpPhase {
        self.phase
    }

    pub fn idle_deadline(&self, idle: Duration) -> Instant {
        self.last_request_time + idle
    }

    fn send(&mut self, core: &mut Core, command: &str) -> Result<(), Close> {
        if command.starts_with("PASS ") {
            tracing::trace!(command = "PASS ***", "Control");
        } else {
            tracing::trace!(command, "Control");
        }
        core.write(format!("{}\r\n", command).as_bytes())
    }

    pub fn request_next(&mut self, core: &mut Core) -> Result<(), Close> {
        if self.phase != FtpPhase::Ready {
            return Ok(());
        }
        let Some(mut req) = core.next_dispatchable(false) else {
            return Ok(());
        };
        core.request_count += 1;
        req.wire_sent = true;
        tracing::debug!(
            endpoint = %core.endpoint,
            request = %req.id,
            count = core.request_count,
            url = %req.target,
            "Starting transfer"
        );
        core.sent.push_back(req);
        self.phase = FtpPhase::Pasv;
        self.send(core, "PASV")
    }

    pub fn execute(
        &mut self,
        core: &mut Core,
        connector: &mut dyn Connector,
        now: Instant,
    ) -> Result<(), Close> {
        if core.sent.front().is_some_and(|r| r.is_abandoned()) {
            // The server would still answer for the aborted transfer, so
            // start over on a fresh connection instead.
            if let Some(mut req) = core.complete_head() {
                tracing::info!(request = %req.id, url = %req.target, "Cancelled by caller");
                req.fail(FetchError::Cancelled);
            }
            return Err(Close::Clean);
        }

        while let Some(reply) = self.replies.next(&mut core.inbuf).map_err(Close::Failed)? {
            self.on_reply(core, connector, reply, now)?;
        }
        self.pump_data(core)?;

        if self.phase == FtpPhase::Transfer
            && self.data_eof
            && let Some(reply) = self.final_reply.take()
        {
            self.finish_transfer(core, reply, now)?;
        }
        Ok(())
    }

    fn login_failed(reply: &Reply) -> Close {
        tracing::warn!(code = reply.code, text = %reply.text, "Login failed");
        Close::Failed(reply.to_error())
    }

    fn on_reply(
        &mut self,
        core: &mut Core,
        connector: &mut dyn Connector,
        reply: Reply,
        now: Instant,
    ) -> Result<(), Close> {
        tracing::debug!(phase = ?self.phase, code = reply.code, text = %reply.text, "Reply");
        match self.phase {
            FtpPhase::Greeting => match reply.code {
                220 => {
                    let cmd = format!("USER {}", self.user);
                    self.send(core, &cmd)?;
                    self.phase = FtpPhase::User;
                }
                120 => {}
                _ => return Err(Self::login_failed(&reply)),
            },
            FtpPhase::User => match reply.code {
                230 => self.send_type(core)?,
                331 | 332 => {
                    let cmd = format!("PASS {}", self.password);
                    self.send(core, &cmd)?;
                    self.phase = FtpPhase::Pass;
                }
                _ => return Err(Self::login_failed(&reply)),
            },
            FtpPhase::Pass => match reply.code {
                202 | 230 => self.send_type(core)?,
                _ => return Err(Self::login_failed(&reply)),
            },
            FtpPhase::Type => {
                if !reply.is_success() {
                    return Err(Self::login_failed(&reply));
                }
                tracing::info!(endpoint = %core.endpoint, user = %self.user, "Logged in");
                self.phase = FtpPhase::Ready;
                self.request_next(core)?;
            }
            FtpPhase::Ready => {
                if reply.code == 421 {
                    return Err(Close::Clean);
                }
            }
            FtpPhase::Pasv => {
                if reply.code != 227 {
                    return self.abort_transfer(core, reply.to_error(), now);
                }
                let addr = parse_pasv(&reply.text).ok_or_else(|| {
                    Close::Failed(FetchError::ProtocolViolation(format!(
                        "unparsable PASV reply '{}'",
                        reply.text
                    )))
                })?;
                tracing::debug!(data = %addr, "Opening data channel");
                let data = connector
                    .connect(&addr, false)
                    .map_err(|e| Close::Failed(FetchError::from(e)))?;
                self.data = Some(data);
                self.data_eof = false;
                self.final_reply = None;
                self.listing.clear();

                let Some(head) = core.sent.front() else {
                    return Ok(());
                };
                let verb = if head.target.is_dir() { "LIST" } else { "RETR" };
                let cmd = format!("{} {}", verb, head.target.decoded_path());
                self.send(core, &cmd)?;
                self.phase = FtpPhase::Start;
            }
            FtpPhase::Start => {
                if reply.is_failure() {
                    return self.abort_transfer(core, reply.to_error(), now);
                }
                if let Some(head) = core.sent.front_mut() {
                    head.in_use = true;
                    core.current = Some(head.id);
                }
                if reply.is_success() {
                    self.final_reply = Some(reply);
                }
                self.phase = FtpPhase::Transfer;
            }
            FtpPhase::Transfer => {
                if reply.is_failure() {
                    return self.abort_transfer(core, reply.to_error(), now);
                }
                if reply.is_success() {
                    self.final_reply = Some(reply);
                }
            }
        }
        Ok(())
    }

    fn send_type(&mut self, core: &mut Core) -> Result<(), Close> {
        self.send(core, "TYPE I")?;
        self.phase = FtpPhase::Type;
        Ok(())
    }

    /// Move data channel bytes into the current request's stream.
    fn pump_data(&mut self, core: &mut Core) -> Result<(), Close> {
        let Some(data) = self.data.as_mut() else {
            return Ok(());
        };
        loop {
            match data.poll_read(&mut self.data_buf) {
                Ok(ReadStatus::Data(_)) => core.touch(),
                Ok(ReadStatus::Pending) => break,
                Ok(ReadStatus::Closed) => {
                    self.data_eof = true;
                    break;
                }
                Err(e) => return Err(Close::Failed(FetchError::from(e))),
            }
        }

        let chunk = self.data_buf.split();
        if let Some(head) = core.sent.front() {
            if let Some(sink) = head.sink() {
                sink.write(&chunk);
            }
            if head.target.is_dir() {
                self.listing.extend_from_slice(&chunk);
                if self.data_eof && !self.listing.is_empty() && !self.listing.ends_with(b"\n") {
                    self.listing.extend_from_slice(b"\n");
                }
                while let Ok(Some(line)) = take_line(&mut self.listing) {
                    if let (Some(link), Some(sink)) =
                        (parse_listing_line(&line, &head.target), head.sink())
                    {
                        sink.add_link(link);
                    }
                }
            }
        }

        if self.data_eof {
            tracing::trace!("Data channel closed");
            if let Some(mut data) = self.data.take() {
                data.close();
            }
        }
        Ok(())
    }

    fn finish_transfer(&mut self, core: &mut Core, reply: Reply, now: Instant) -> Result<(), Close> {
        self.phase = FtpPhase::Ready;
        self.last_request_time = now;
        if let Some(mut req) = core.complete_head() {
            if let Some(sink) = req.sink() {
                sink.set_status("FTP", reply.code);
            }
            tracing::info!(endpoint = %core.endpoint, request = %req.id, url = %req.target, "Done URL");
            req.done();
        }
        self.request_next(core)
    }

    fn abort_transfer(&mut self, core: &mut Core, error: FetchError, now: Instant) -> Result<(), Close> {
        if let Some(mut data) = self.data.take() {
            data.close();
        }
        self.data_buf.clear();
        self.listing.clear();
        self.final_reply = None;
        self.phase = FtpPhase::Ready;
        self.last_request_time = now;
        if let Some(mut req) = core.complete_head() {
            tracing::warn!(request = %req.id, url = %req.target, error = %error, "Transfer refused");
            req.fail(error);
        }
        self.request_next(core)
    }

    pub fn on_eof(&mut self, core: &mut Core) -> Result<(), Close> {
        if self.phase == FtpPhase::Ready && core.sent.is_empty() {
            return Err(Close::Clean);
        }
        Err(Close::ServerClosed)
    }

    pub fn on_close(&mut self, core: &mut Core, kind: Close) -> Close {
        if let Some(mut data) = self.data.take() {
            data.close();
        }
        if kind == Close::Clean
            && !core.eof
            && self.phase == FtpPhase::Ready
            && let Err(Close::Failed(err)) = self.send(core, "QUIT")
        {
            tracing::debug!(endpoint = %core.endpoint, error = %err, "QUIT not sent");
        }
        kind
    }
}
