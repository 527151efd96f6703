use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Everything needed to put one request on the wire.
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub keep_alive: bool,
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
    pub headers: &'a str,
    pub body: Option<&'a [u8]>,
}

/// `Authorization` value for HTTP Basic auth.
pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

/// Rewrite every line ending as CRLF.
pub fn fix_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\r' => continue,
            '\n' => out.push_str("\r\n"),
            c => out.push(c),
        }
    }
    out
}

pub fn serialize_request(parts: &RequestParts<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Request line
    buf.extend_from_slice(
        format!("{} {} {}\r\n", parts.method, parts.path, HTTP_VERSION).as_bytes(),
    );

    let host = if parts.host.contains(':') {
        format!("[{}]", parts.host)
    } else {
        parts.host.to_string()
    };
    buf.extend_from_slice(format!("Host: {}:{}\r\n", host, parts.port).as_bytes());
    buf.extend_from_slice(
        format!(
            "Connection: {}\r\n",
            if parts.keep_alive { "keep-alive" } else { "close" }
        )
        .as_bytes(),
    );

    if let (Some(user), Some(password)) = (parts.user, parts.password) {
        buf.extend_from_slice(
            format!("Authorization: {}\r\n", basic_auth(user, password)).as_bytes(),
        );
    }

    if let Some(body) = parts.body
        && !body.is_empty()
    {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    let extra = fix_newlines(parts.headers.trim());
    if !extra.is_empty() {
        buf.extend_from_slice(extra.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    if let Some(body) = parts.body {
        buf.extend_from_slice(body);
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_encodes_user_and_password() {
        assert_eq!(basic_auth("Aladdin", "open sesame"), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn newlines_become_crlf() {
        assert_eq!(fix_newlines("a\nb\r\nc"), "a\r\nb\r\nc");
    }
}
