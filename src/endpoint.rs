//! Endpoint identity used for connection pooling.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::FetchError;

/// URL schemes the engine can retrieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ftp" => Some(Scheme::Ftp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ftp => "ftp",
        }
    }

    /// True when the transport must be wrapped in TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// A remote `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Pooling key: two requests with equal endpoints may share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub authority: Authority,
    pub user: Option<String>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}://{}@{}", self.scheme.as_str(), user, self.authority),
            None => write!(f, "{}://{}", self.scheme.as_str(), self.authority),
        }
    }
}

/// A validated request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self, FetchError> {
        let url = Url::parse(input.trim())?;
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| FetchError::InvalidUrl(format!("unsupported scheme '{}'", url.scheme())))?;
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']').to_string(),
            _ => return Err(FetchError::InvalidUrl(format!("missing host in '{}'", input))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::InvalidUrl(format!("missing port in '{}'", input)))?;

        Ok(Self {
            url,
            scheme,
            host,
            port,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path plus query, always starting with `/`.
    pub fn path(&self) -> String {
        let path = if self.url.path().is_empty() {
            "/"
        } else {
            self.url.path()
        };
        match self.url.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }

    /// Path with percent escapes resolved, as FTP servers expect it.
    pub fn decoded_path(&self) -> String {
        let path = if self.url.path().is_empty() {
            "/"
        } else {
            self.url.path()
        };
        decode(path)
    }

    /// User name from the URL, percent escapes resolved.
    pub fn user(&self) -> Option<String> {
        match self.url.username() {
            "" => None,
            user => Some(decode(user)),
        }
    }

    pub fn password(&self) -> Option<String> {
        self.url.password().map(decode)
    }

    /// A URL whose path names a directory.
    pub fn is_dir(&self) -> bool {
        self.url.path().ends_with('/')
    }

    pub fn authority(&self) -> Authority {
        Authority::new(&self.host, self.port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            scheme: self.scheme,
            authority: self.authority(),
            user: self.user(),
        }
    }

    /// Same endpoint, different path.
    pub fn with_path(&self, path: &str) -> Self {
        let mut url = self.url.clone();
        url.set_query(None);
        url.set_path(path);
        Self {
            url,
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Resolve `name` relative to this URL's directory.
    pub fn join(&self, name: &str) -> Option<String> {
        self.url
            .join(&format!("./{}", name))
            .ok()
            .map(|u| u.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
