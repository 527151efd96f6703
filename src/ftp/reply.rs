//! FTP control channel parsing.

use bytes::BytesMut;

use crate::endpoint::{Authority, Target};
use crate::error::FetchError;
use crate::http::parser::take_line;
use crate::stream::UrlLink;

/// A complete server reply; for multi-line replies only the final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_failure(&self) -> bool {
        self.code >= 400
    }

    pub fn to_error(&self) -> FetchError {
        FetchError::Ftp {
            code: self.code,
            text: self.text.clone(),
        }
    }
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Assembles replies from control channel lines.
///
/// Lines of the form `123-text` open a multi-line reply; everything up to
/// the matching `123 text` is skipped.
#[derive(Debug, Default)]
pub struct ReplyReader {
    open: Option<u16>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>, FetchError> {
        loop {
            let line = take_line(buf)
                .map_err(|e| FetchError::ProtocolViolation(e.to_string()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            let code = reply_code(&line);
            let sep = line.as_bytes().get(3).copied();
            tracing::trace!(line = %line, "Control");

            if let Some(open) = self.open {
                if code == Some(open) && sep != Some(b'-') {
                    self.open = None;
                    return Ok(Some(Reply {
                        code: open,
                        text: line.get(4..).unwrap_or("").trim().to_string(),
                    }));
                }
                continue;
            }

            match (code, sep) {
                (Some(code), Some(b'-')) => self.open = Some(code),
                (Some(code), Some(b' ') | None) => {
                    return Ok(Some(Reply {
                        code,
                        text: line.get(4..).unwrap_or("").trim().to_string(),
                    }));
                }
                _ if line.trim().is_empty() => continue,
                _ => {
                    return Err(FetchError::ProtocolViolation(format!(
                        "malformed ftp reply '{}'",
                        line
                    )));
                }
            }
        }
    }
}

/// Extract the data channel address from a `227` reply text such as
/// `Entering Passive Mode (192,168,1,2,19,137)`.
pub fn parse_pasv(text: &str) -> Option<Authority> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == ','))
        .unwrap_or(rest.len());
    let nums: Vec<u16> = rest[..end]
        .split(',')
        .map(|n| n.parse::<u16>().ok().filter(|&v| v <= 255))
        .collect::<Option<Vec<_>>>()?;
    if nums.len() != 6 {
        return None;
    }
    let host = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
    Some(Authority::new(host, nums[4] * 256 + nums[5]))
}

/// Turn one directory listing line into a link.
///
/// Understands `ls -l` style lines and bare names; `.`, `..` and `total`
/// lines yield nothing.
pub fn parse_listing_line(line: &str, dir: &Target) -> Option<UrlLink> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with("total ") {
        return None;
    }

    let first = line.chars().next()?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (mut name, is_dir) = if "-dlbcps".contains(first) && fields.len() >= 9 {
        // Name is everything after the date; it may contain spaces.
        let mut rest = line;
        for _ in 0..8 {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            rest = &rest[end..];
        }
        (rest.trim().to_string(), first == 'd')
    } else {
        (line.trim().to_string(), false)
    };

    if first == 'l'
        && let Some(pos) = name.find(" -> ")
    {
        name.truncate(pos);
    }
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if is_dir {
        name.push('/');
    }

    let url = dir.join(&name)?;
    Some(UrlLink { name, url })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_yields_address() {
        let addr = parse_pasv("Entering Passive Mode (192,168,1,2,19,137)").unwrap();
        assert_eq!(addr.host, "192.168.1.2");
        assert_eq!(addr.port, 19 * 256 + 137);
    }

    #[test]
    fn pasv_rejects_short_tuple() {
        assert!(parse_pasv("Entering Passive Mode (1,2,3)").is_none());
    }

    #[test]
    fn multi_line_reply_keeps_final_line() {
        let mut reader = ReplyReader::new();
        let mut buf = BytesMut::from(&b"220-Welcome\r\n  to the server\r\n220 Ready\r\n"[..]);
        let reply = reader.next(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text, "Ready");
        assert!(reader.next(&mut buf).unwrap().is_none());
    }

    #[test]
    fn listing_line_with_spaces() {
        let dir = Target::parse("ftp://example.com/pub/").unwrap();
        let link = parse_listing_line(
            "-rw-r--r--   1 ftp ftp  1024 Jan 01 12:00 read me.txt",
            &dir,
        )
        .unwrap();
        assert_eq!(link.name, "read me.txt");
        assert_eq!(link.url, "ftp://example.com/pub/read%20me.txt");
    }

    #[test]
    fn listing_marks_directories() {
        let dir = Target::parse("ftp://example.com/").unwrap();
        let link =
            parse_listing_line("drwxr-xr-x   2 ftp ftp  4096 Jan 01 12:00 incoming", &dir).unwrap();
        assert_eq!(link.name, "incoming/");
        assert!(parse_listing_line("drwxr-xr-x 2 ftp ftp 4096 Jan 01 12:00 ..", &dir).is_none());
    }
}
