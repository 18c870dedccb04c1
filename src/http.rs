//! HTTP/1.0 request parsing.
//!
//! The served subset is deliberately small: a `GET` or `PUT` start line, an
//! absolute target beginning with `/`, and — for `PUT` only — a
//! `Content-Length` header. Everything else in the header block is ignored.
//! End-of-header detection is an incremental five-state machine over the
//! bytes as they arrive, so a request split across many packets costs no
//! rescanning.

use std::fmt;

/// Sent ahead of a GET body.
pub const OK_200: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
/// Sent after a PUT body has been written out completely.
pub const CREATED_201: &[u8] = b"HTTP/1.0 201 CREATED\r\n\r\n";
/// Malformed request line, unknown method, oversize header, idle timeout.
pub const BAD_REQUEST_400: &[u8] = b"HTTP/1.0 400 BAD REQUEST\r\n\r\n";
/// The target resource could not be opened.
pub const NOT_FOUND_404: &[u8] = b"HTTP/1.0 404 NOT FOUND\r\n\r\n";

/// A header block larger than this is rejected outright.
pub const MAX_HEADER_BYTES: usize = 8000;

/// Request method. Anything that is not GET or PUT fails the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

/// States of the end-of-header scanner.
///
/// The machine walks `\r` `\n` `\r` `\n`; any byte off that path drops it
/// back to `Initial`, except that the byte after a completed line (`FirstLf`)
/// may itself start the terminating `\r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Initial,
    FirstCr,
    FirstLf,
    LastCr,
    LastLf,
}

impl ScanState {
    fn step(self, byte: u8) -> ScanState {
        match (self, byte) {
            (ScanState::Initial, b'\r') => ScanState::FirstCr,
            (ScanState::Initial, _) => ScanState::Initial,
            (ScanState::FirstCr, b'\n') => ScanState::FirstLf,
            (ScanState::FirstCr, _) => ScanState::Initial,
            (ScanState::FirstLf, b'\r') => ScanState::LastCr,
            (ScanState::FirstLf, _) => ScanState::Initial,
            (ScanState::LastCr, b'\n') => ScanState::LastLf,
            (ScanState::LastCr, _) => ScanState::Initial,
            (ScanState::LastLf, _) => ScanState::LastLf,
        }
    }
}

/// Outcome of feeding bytes to the [`HeaderDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The terminating CRLFCRLF has been seen.
    Complete,
    /// More bytes are needed.
    Incomplete,
    /// `MAX_HEADER_BYTES` scanned without finding the terminator.
    TooBig,
}

/// Incremental end-of-header detector. Each byte is consumed exactly once;
/// the positions of the first line end and of the header end are recorded
/// relative to the start of the header block.
#[derive(Debug)]
pub struct HeaderDetector {
    state: ScanState,
    scanned: usize,
    first_line_end: Option<usize>,
    header_end: Option<usize>,
}

impl HeaderDetector {
    pub fn new() -> HeaderDetector {
        HeaderDetector {
            state: ScanState::Initial,
            scanned: 0,
            first_line_end: None,
            header_end: None,
        }
    }

    /// Feed the bytes that just arrived. Safe to call with an empty slice
    /// and after completion.
    pub fn feed(&mut self, bytes: &[u8]) -> ScanStatus {
        if self.header_end.is_some() {
            return ScanStatus::Complete;
        }

        for &byte in bytes {
            if self.scanned >= MAX_HEADER_BYTES {
                return ScanStatus::TooBig;
            }
            let pos = self.scanned;
            self.scanned += 1;

            let next = self.state.step(byte);
            if self.state == ScanState::FirstCr && next == ScanState::FirstLf {
                // End of the first line, excluding its CRLF.
                if self.first_line_end.is_none() {
                    self.first_line_end = Some(pos - 1);
                }
            }
            self.state = next;

            if self.state == ScanState::LastLf {
                self.header_end = Some(pos + 1);
                return ScanStatus::Complete;
            }
        }

        if self.scanned >= MAX_HEADER_BYTES {
            ScanStatus::TooBig
        } else {
            ScanStatus::Incomplete
        }
    }

    /// Length of the header block including the terminating CRLFCRLF, once
    /// detected.
    pub fn header_end(&self) -> Option<usize> {
        self.header_end
    }

    /// Length of the request line, excluding its CRLF, once seen.
    pub fn first_line_end(&self) -> Option<usize> {
        self.first_line_end
    }
}

impl Default for HeaderDetector {
    fn default() -> Self {
        HeaderDetector::new()
    }
}

/// A parsed request, ready for the transfer machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Target path as sent, including the leading `/`.
    pub target: String,
    /// Declared body size; zero for GET.
    pub content_length: u64,
}

/// Why a header block was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Start line does not begin with `GET ` or `PUT `.
    BadMethod,
    /// Target missing, not starting with `/`, unterminated, or not UTF-8.
    BadTarget,
    /// PUT without a parseable `Content-Length` header.
    BadContentLength,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadMethod => write!(f, "unknown request method"),
            ParseError::BadTarget => write!(f, "malformed request target"),
            ParseError::BadContentLength => write!(f, "missing or invalid Content-Length"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a complete header block. `first_line_end` comes from the
/// [`HeaderDetector`] that watched the block arrive.
pub fn parse_request(header: &[u8], first_line_end: usize) -> Result<Request, ParseError> {
    let line = &header[..first_line_end];

    let method = if line.starts_with(b"GET ") {
        Method::Get
    } else if line.starts_with(b"PUT ") {
        Method::Put
    } else {
        return Err(ParseError::BadMethod);
    };

    let rest = &line[4..];
    if rest.first() != Some(&b'/') {
        return Err(ParseError::BadTarget);
    }
    let target_end = rest
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::BadTarget)?;
    let target = std::str::from_utf8(&rest[..target_end])
        .map_err(|_| ParseError::BadTarget)?
        .to_string();

    let content_length = match method {
        Method::Get => 0,
        Method::Put => {
            content_length(&header[first_line_end..]).ok_or(ParseError::BadContentLength)?
        }
    };

    Ok(Request {
        method,
        target,
        content_length,
    })
}

/// Scan the remaining header lines for `Content-Length`. The name match is
/// ASCII case-insensitive; the first hit wins.
fn content_length(headers: &[u8]) -> Option<u64> {
    for raw_line in headers.split(|&b| b == b'\n') {
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}
