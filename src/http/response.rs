//! Status line, header list and body, plus wire serialization.

/// A fully buffered response.
///
/// `status` holds the whole status text (`"302 Found"`), since CGI scripts
/// may hand back reason phrases we do not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body and a matching `Content-Length`.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        self.headers.push(("Content-Length".to_string(), self.body.len().to_string()));
        self
    }

    /// Plain-text response, used for every error the client may see.
    pub fn text(status: &str, message: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain")
            .body(message.into().into_bytes())
    }

    pub fn html(status: &str, page: impl Into<Vec<u8>>) -> Self {
        Self::new(status).header("Content-Type", "text/html").body(page)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::text("500 Internal Server Error", message)
    }

    /// Numeric part of the status text, 0 when it is not a number.
    pub fn status_code(&self) -> u16 {
        self.status
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (k, v) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        if !self.has_header("connection") {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("Server: phpgate\r\n\r\n");

        [head.as_bytes(), &self.body].concat()
    }
}
