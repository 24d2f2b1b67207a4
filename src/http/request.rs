use std::collections::HashMap;

/// One inbound request, framed by `Content-Length`.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn parse(raw_data: &[u8]) -> Option<Self> {
        let header_end = Self::find_header_end(raw_data)?;
        let header_bytes = &raw_data[..header_end];

        let content_length = Self::get_content_length(header_bytes).unwrap_or(0);
        let current_body_len = raw_data.len() - header_end;

        if current_body_len < content_length {
            return None;
        }

        let header_str = std::str::from_utf8(header_bytes).ok()?;
        let mut lines = header_str.split("\r\n");

        let first_line = lines.next()?;
        let mut parts = first_line.split_whitespace();
        let method = parts.next()?.to_string();
        let uri = parts.next()?.to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((key, val)) = line.split_once(':') {
                headers.insert(key.trim().to_lowercase(), val.trim().to_string());
            }
        }

        let body = raw_data[header_end..header_end + content_length].to_vec();

        Some(HttpRequest {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    pub fn query(&self) -> &str {
        match self.uri.split_once('?') {
            Some((_, query)) => query,
            None => "",
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `Host` header without the port.
    pub fn host_name(&self) -> Option<&str> {
        let host = self.header("host")?;
        // bracketed IPv6 literals keep their colons
        if let Some(end) = host.find(']') {
            return Some(&host[..=end]);
        }
        host.split(':').next()
    }

    /// Declared body length, falling back to the bytes actually received.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.body.len())
    }

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        Self::find_header_end_from(buf, 0)
    }

    /// Like `find_header_end`, but only looks at `buf[from..]`.
    fn find_header_end_from(buf: &[u8], from: usize) -> Option<usize> {
        let from = from.min(buf.len());
        buf[from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|pos| from + pos + 4)
    }

    fn get_content_length(header_bytes: &[u8]) -> Option<usize> {
        let header_str = std::str::from_utf8(header_bytes).ok()?;
        for line in header_str.lines() {
            let line_lower = line.to_lowercase();
            if line_lower.starts_with("content-length:") {
                return line_lower["content-length:".len()..].trim().parse().ok();
            }
        }
        None
    }
}

/// Where a connection's buffered request stands after the latest read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Incomplete,
    Complete,
    HeadersTooLarge,
    BodyTooLarge,
}

/// Accumulates request bytes and tracks the header boundary incrementally,
/// so each read only scans what it added.
#[derive(Debug)]
pub struct RequestFramer {
    buffer: Vec<u8>,
    header_end: Option<usize>,
    body_length: usize,
    max_header_size: usize,
    max_body_size: usize,
}

impl RequestFramer {
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            header_end: None,
            body_length: 0,
            max_header_size,
            max_body_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Framing {
        let old_len = self.buffer.len();
        self.buffer.extend_from_slice(data);

        if self.header_end.is_none() {
            // a separator may straddle the previous read
            let end = match HttpRequest::find_header_end_from(&self.buffer, old_len.saturating_sub(3)) {
                Some(end) => end,
                None if self.buffer.len() > self.max_header_size => {
                    return Framing::HeadersTooLarge;
                }
                None => {
                    return Framing::Incomplete;
                }
            };
            if end > self.max_header_size {
                return Framing::HeadersTooLarge;
            }
            self.header_end = Some(end);
            self.body_length = HttpRequest::get_content_length(&self.buffer[..end]).unwrap_or(0);
        }

        if self.body_length > self.max_body_size {
            return Framing::BodyTooLarge;
        }
        match self.header_end {
            Some(end) if self.buffer.len() - end >= self.body_length => Framing::Complete,
            _ => Framing::Incomplete,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let raw = b"GET /movies.php?id=7&sort=asc HTTP/1.1\r\nHost: localhost:8000\r\nX-Thing: a:b\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path(), "/movies.php");
        assert_eq!(req.query(), "id=7&sort=asc");
        assert_eq!(req.header("Host"), Some("localhost:8000"));
        assert_eq!(req.header("x-thing"), Some("a:b"));
        assert!(req.body.is_empty());
        assert_eq!(req.host_name(), Some("localhost"));
    }

    #[test]
    fn test_host_name_ipv6() {
        let req = HttpRequest::parse(b"GET / HTTP/1.1\r\nHost: [::1]:8000\r\n\r\n").unwrap();
        assert_eq!(req.host_name(), Some("[::1]"));
    }

    #[test]
    fn test_incomplete_body() {
        let raw = b"POST /api.php HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let mut framer = RequestFramer::new(8192, 1024);
        assert_eq!(framer.push(raw), Framing::Incomplete);
        assert!(HttpRequest::parse(raw).is_none());
        assert_eq!(framer.push(b"defghij"), Framing::Complete);
        assert_eq!(HttpRequest::parse(framer.buffer()).unwrap().body, b"abcdefghij");
    }

    #[test]
    fn test_post_body() {
        let raw = b"POST /api.php HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}";
        assert_eq!(RequestFramer::new(8192, 1024).push(raw), Framing::Complete);
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.body, b"{\"a\":1}");
        assert_eq!(req.content_length(), 7);
        assert_eq!(req.query(), "");
    }

    #[test]
    fn test_headers_not_terminated() {
        let mut framer = RequestFramer::new(8192, 1024);
        assert_eq!(framer.push(b"GET / HTTP/1.1\r\nHost: x\r\n"), Framing::Incomplete);
    }

    #[test]
    fn test_separator_split_across_reads() {
        let mut framer = RequestFramer::new(8192, 1024);
        assert_eq!(framer.push(b"GET /movies HTTP/1.1\r\nHost: x\r"), Framing::Incomplete);
        assert_eq!(framer.push(b"\n\r"), Framing::Incomplete);
        assert_eq!(framer.push(b"\n"), Framing::Complete);
        assert_eq!(HttpRequest::parse(framer.buffer()).unwrap().path(), "/movies");
    }

    #[test]
    fn test_endless_headers_hit_limit() {
        let mut framer = RequestFramer::new(1024, 1024);
        let chunk = [b'A'; 256];
        let mut pushes = 0;
        let outcome = loop {
            pushes += 1;
            match framer.push(&chunk) {
                Framing::Incomplete => assert!(pushes < 8192, "buffer grew past the header limit"),
                other => break other,
            }
        };
        assert_eq!(outcome, Framing::HeadersTooLarge);
        assert!(framer.buffer().len() <= 1024 + chunk.len());
    }

    #[test]
    fn test_terminated_but_oversized_headers() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend_from_slice(&[b'p'; 2000]);
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(RequestFramer::new(1024, 1024).push(&raw), Framing::HeadersTooLarge);
    }

    #[test]
    fn test_declared_body_over_limit() {
        let raw = b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n0123";
        assert_eq!(RequestFramer::new(8192, 8).push(raw), Framing::BodyTooLarge);
    }
}
