use bytes::BytesMut;

/// Longest line we are willing to buffer while waiting for its newline.
pub const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidStatusLine,
    InvalidContentLength,
    InvalidChunkSize,
    LineTooLong,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::InvalidStatusLine => "invalid status line",
            ParseError::InvalidContentLength => "invalid content-length",
            ParseError::InvalidChunkSize => "invalid chunk size",
            ParseError::LineTooLong => "line too long",
        };
        f.write_str(msg)
    }
}

/// Remove one line from the front of `buf`.
///
/// Returns `Ok(None)` until a full line has arrived. The line ending
/// (`\n` or `\r\n`) is stripped.
pub fn take_line(buf: &mut BytesMut) -> Result<Option<String>, ParseError> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let raw = buf.split_to(pos + 1);
            let mut line = &raw[..pos];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            Ok(Some(String::from_utf8_lossy(line).into_owned()))
        }
        None if buf.len() > MAX_LINE => Err(ParseError::LineTooLong),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// Version without the `HTTP/` prefix, e.g. `1.1`.
    pub version: String,
    pub code: u16,
}

/// Parse `HTTP/1.1 200 OK`.
pub fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    let mut parts = line.trim().splitn(3, ' ');
    let proto = parts.next().ok_or(ParseError::InvalidStatusLine)?;
    let version = proto
        .get(..5)
        .filter(|p| p.eq_ignore_ascii_case("HTTP/"))
        .map(|_| &proto[5..])
        .ok_or(ParseError::InvalidStatusLine)?;
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or(ParseError::InvalidStatusLine)?;

    Ok(StatusLine {
        version: version.to_string(),
        code,
    })
}

/// Split `Name: value`; both halves trimmed.
pub fn parse_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

pub fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidContentLength)
}

/// True if a `Transfer-Encoding` value ends in `chunked`.
pub fn is_chunked(value: &str) -> bool {
    value
        .rsplit(',')
        .next()
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Parse a chunk size line, ignoring chunk extensions.
pub fn parse_chunk_size(line: &str) -> Result<usize, ParseError> {
    let size = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}
