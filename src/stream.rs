//! Result streams handed back to callers.
//!
//! [`channel`] creates a connected pair: the [`Sink`] travels with the
//! request into a connection, the [`UrlStream`] goes back to the caller.
//! Decoded body bytes, response metadata and the final outcome all flow
//! from the sink to the stream.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::FetchError;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLink {
    /// Name as listed; directories end with `/`.
    pub name: String,
    /// Absolute URL of the entry.
    pub url: String,
}

#[derive(Debug, Default)]
struct Shared {
    body: BytesMut,
    version: Option<String>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    links: Vec<UrlLink>,
    error: Option<FetchError>,
    done: bool,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    url: String,
    state: Mutex<Shared>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create a connected sink/stream pair for `url`.
pub fn channel(url: impl Into<String>) -> (Sink, UrlStream) {
    let inner = Arc::new(Inner {
        url: url.into(),
        state: Mutex::new(Shared::default()),
        notify: Notify::new(),
    });
    (
        Sink {
            inner: inner.clone(),
        },
        UrlStream { inner },
    )
}

/// Engine side of a result stream.
#[derive(Debug)]
pub struct Sink {
    inner: Arc<Inner>,
}

impl Sink {
    /// URL this sink was created for.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// True once the caller closed or dropped its [`UrlStream`].
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.inner.lock();
            if state.done || state.closed {
                return;
            }
            state.body.extend_from_slice(data);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn set_status(&self, version: &str, status: u16) {
        let mut state = self.inner.lock();
        state.version = Some(version.to_string());
        state.status = Some(status);
    }

    pub fn add_header(&self, name: &str, value: &str) {
        self.inner
            .lock()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    pub fn add_link(&self, link: UrlLink) {
        self.inner.lock().links.push(link);
    }

    /// Complete the stream successfully. Later calls are ignored.
    pub fn finish(&self) {
        {
            let mut state = self.inner.lock();
            if state.done {
                return;
            }
            state.done = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// Complete the stream with `error`. Ignored if already complete.
    pub fn fail(&self, error: FetchError) {
        {
            let mut state = self.inner.lock();
            if state.done {
                return;
            }
            state.error = Some(error);
            state.done = true;
        }
        self.inner.notify.notify_waiters();
    }
}

impl Drop for Sink {
    /// A request that goes away without an outcome must not leave its
    /// caller waiting.
    fn drop(&mut self) {
        self.fail(FetchError::Cancelled);
    }
}

/// Caller side of a result stream.
///
/// Dropping the stream cancels the request at the engine's next
/// scheduling quantum.
#[derive(Debug)]
pub struct UrlStream {
    inner: Arc<Inner>,
}

impl UrlStream {
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Numeric status of the response, once the status line arrived.
    pub fn status(&self) -> Option<u16> {
        self.inner.lock().status
    }

    /// Protocol version from the status line (`"1.1"` for `HTTP/1.1`).
    pub fn version(&self) -> Option<String> {
        self.inner.lock().version.clone()
    }

    /// First response header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// All response headers in arrival order.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.inner.lock().headers.clone()
    }

    /// Directory entries collected from a listing.
    pub fn links(&self) -> Vec<UrlLink> {
        self.inner.lock().links.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// The error the request failed with, if any.
    pub fn error(&self) -> Option<FetchError> {
        self.inner.lock().error.clone()
    }

    /// Take all body bytes received so far without waiting.
    pub fn try_read(&self) -> Option<Bytes> {
        let mut state = self.inner.lock();
        if state.body.is_empty() {
            None
        } else {
            Some(state.body.split().freeze())
        }
    }

    /// Take everything buffered, whether or not the request finished.
    pub fn take_body(&self) -> Bytes {
        self.inner.lock().body.split().freeze()
    }

    /// Wait for the next piece of body data.
    ///
    /// Returns `None` once the request is complete and everything has been
    /// read.
    pub async fn chunk(&self) -> Option<Bytes> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.lock();
                if !state.body.is_empty() {
                    return Some(state.body.split().freeze());
                }
                if state.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait until the request completes.
    pub async fn wait(&self) -> Result<(), FetchError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                if state.done {
                    return match &state.error {
                        Some(err) => Err(err.clone()),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Stop receiving. The engine aborts the transfer when it notices.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.body.clear();
    }
}

impl Drop for UrlStream {
    fn drop(&mut self) {
        self.close();
    }
}
