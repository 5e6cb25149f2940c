//! Protocol variants and request routing.
//!
//! The server exposes a single route:
//!
//! ```text
//! GET /<N>   -> 200, N bytes of payload
//! POST /100  -> 400 "unhandled method"
//! GET /      -> 404 "Not found (no regexp match)"
//! GET /abc   -> 400 parsing "abc": invalid syntax
//! ```

use hyper::Method;
use regex::Regex;

/// Largest byte count a client may request.
pub const MAX_STREAM_SIZE: u64 = i64::MAX as u64;

/// HTTP variant spoken by a server instance or a client download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 over plain TCP
    Http1,
    /// HTTP/2 over plain TCP with prior knowledge (h2c)
    H2c,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "http1.1"),
            Protocol::H2c => write!(f, "http/2 cleartext"),
        }
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Stream this many bytes
    Stream(u64),
    /// Anything but GET
    UnhandledMethod,
    /// Path is not a single segment
    NotFound,
    /// Segment is not a valid byte count
    InvalidSize(String),
}

/// Maps requests to routes. The pattern is compiled once and shared.
#[derive(Debug, Clone)]
pub struct Router {
    pattern: Regex,
}

impl Router {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"^/([^/]+)$")?,
        })
    }

    pub fn route(&self, method: &Method, path: &str) -> Route {
        if method != Method::GET {
            return Route::UnhandledMethod;
        }

        let segment = match self.pattern.captures(path).and_then(|c| c.get(1)) {
            Some(m) => m.as_str(),
            None => return Route::NotFound,
        };

        match parse_size(segment) {
            Ok(size) => Route::Stream(size),
            Err(msg) => Route::InvalidSize(msg),
        }
    }
}

/// Parse a base-10 byte count with no sign and no extraneous characters.
fn parse_size(segment: &str) -> Result<u64, String> {
    let reason = if !segment.bytes().all(|b| b.is_ascii_digit()) {
        "invalid syntax"
    } else {
        match segment.parse::<u64>() {
            Ok(size) if size <= MAX_STREAM_SIZE => return Ok(size),
            _ => "value out of range",
        }
    };

    Err(format!("parsing {segment:?}: {reason}"))
}
