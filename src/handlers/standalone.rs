//! Hands clients over to the interpreter's own `-S` server.
//!
//! The server is started on the first request. It is relaunched if it has
//! died, unless it died right after launch. Every request is answered with
//! a redirect to it.

use crate::config::{ Config, InterpreterConfig };
use crate::error::SupervisorError;
use crate::http::{ HttpRequest, HttpResponse };
use crate::supervisor::{ port_in_use, spawn_server, terminate_child };
use html_escape::{ encode_double_quoted_attribute, encode_text };
use percent_encoding::{ utf8_percent_encode, AsciiSet, CONTROLS };
use std::path::PathBuf;
use std::process::Child;
use std::time::{ Duration, Instant };

/// A server that dies sooner than this after launch is not relaunched until
/// the window has passed.
const RELAUNCH_WINDOW: Duration = Duration::from_secs(5);

/// Bytes that may not appear raw in a redirect target. `%` stays, so
/// already-encoded sequences pass through unchanged.
const URI_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'\'')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'\\')
    .add(b'^')
    .add(b'{')
    .add(b'|')
    .add(b'}');

pub struct StandaloneLauncher {
    interpreter: InterpreterConfig,
    document_root: PathBuf,
    child: Option<Child>,
    launched_at: Option<Instant>,
    launches: usize,
}

impl StandaloneLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            document_root: config.document_root.clone(),
            child: None,
            launched_at: None,
            launches: 0,
        }
    }

    pub fn handle(&mut self, req: &HttpRequest) -> HttpResponse {
        if let Err(e) = self.ensure_running() {
            tracing::error!(error = %e, "could not start interpreter server");
            return HttpResponse::internal_error(e.to_string());
        }
        let location = self.redirect_target(req);
        tracing::debug!(location = %location, "redirecting to interpreter server");
        redirect(&location)
    }

    /// Pid of the live server child, starting one if needed.
    pub fn ensure_running(&mut self) -> Result<u32, SupervisorError> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(child.id()),
                Ok(Some(status)) => {
                    let lived = self.launched_at.map(|t| t.elapsed()).unwrap_or_default();
                    if lived < RELAUNCH_WINDOW {
                        tracing::error!(%status, ?lived, "interpreter server exited right after launch");
                        return Err(SupervisorError::Backoff(lived));
                    }
                    tracing::warn!(%status, "interpreter server exited, relaunching");
                }
                Err(e) => return Err(SupervisorError::Wait(e)),
            }
        }

        // someone else owns the port; a new server would only die on bind
        let port = self.interpreter.standalone_port;
        if port_in_use(port) {
            return Err(SupervisorError::PortInUse(port));
        }

        let child = spawn_server(&self.interpreter, &self.document_root)?;
        let pid = child.id();
        self.launches += 1;
        tracing::info!(
            pid,
            launches = self.launches,
            addr = %self.interpreter.standalone_addr(),
            "interpreter server started"
        );
        self.child = Some(child);
        self.launched_at = Some(Instant::now());
        Ok(pid)
    }

    /// Same host the client used, interpreter port, requested path and query.
    pub fn redirect_target(&self, req: &HttpRequest) -> String {
        let host = match req.host_name().filter(|h| is_host_name(h)) {
            Some(h) => h.to_string(),
            None if self.interpreter.standalone_host == "0.0.0.0" => "localhost".to_string(),
            None => self.interpreter.standalone_host.clone(),
        };
        let uri = if req.uri.starts_with('/') { req.uri.as_str() } else { "/" };
        format!(
            "http://{}:{}{}",
            host,
            self.interpreter.standalone_port,
            utf8_percent_encode(uri, URI_UNSAFE)
        )
    }
}

/// Letters, digits, dots, dashes, or a bracketed IPv6 literal.
fn is_host_name(host: &str) -> bool {
    !host.is_empty() &&
        host.bytes().all(|b| b.is_ascii_alphanumeric() || b".-[]:".contains(&b))
}

impl Drop for StandaloneLauncher {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, Duration::from_secs(5));
        }
    }
}

/// 302 plus a self-refreshing page for clients that do not follow redirects.
pub fn redirect(location: &str) -> HttpResponse {
    let attr = encode_double_quoted_attribute(location);
    let page = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta http-equiv=\"refresh\" content=\"0; url={0}\">\n\
         <title>Redirecting</title>\n</head>\n<body>\n<p>Redirecting to <a href=\"{0}\">{1}</a></p>\n</body>\n</html>\n",
        attr,
        encode_text(location)
    );
    HttpResponse::new("302 Found")
        .header("Location", location)
        .header("Content-Type", "text/html")
        .body(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn launcher_for(program: &str, port: u16) -> StandaloneLauncher {
        let mut config = Config::default();
        config.interpreter.path = program.to_string();
        config.interpreter.standalone_port = port;
        StandaloneLauncher::new(&config)
    }

    fn launcher(host: &str) -> StandaloneLauncher {
        let mut config = Config::default();
        config.interpreter.standalone_host = host.to_string();
        config.interpreter.standalone_port = 5000;
        StandaloneLauncher::new(&config)
    }

    #[test]
    fn test_redirect_uses_request_host() {
        let req = HttpRequest::parse(b"GET /movie_details.php?id=3 HTTP/1.1\r\nHost: nas.local:8000\r\n\r\n").unwrap();
        assert_eq!(
            launcher("0.0.0.0").redirect_target(&req),
            "http://nas.local:5000/movie_details.php?id=3"
        );
    }

    #[test]
    fn test_redirect_without_host_header() {
        let req = HttpRequest::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(launcher("0.0.0.0").redirect_target(&req), "http://localhost:5000/");
        assert_eq!(launcher("10.0.0.2").redirect_target(&req), "http://10.0.0.2:5000/");
    }

    #[test]
    fn test_redirect_response() {
        let res = redirect("http://localhost:5000/");
        assert_eq!(res.status, "302 Found");
        assert_eq!(res.get_header("Location"), Some("http://localhost:5000/"));
        let body = String::from_utf8(res.body.clone()).unwrap();
        assert!(body.contains("http-equiv=\"refresh\""));
        assert_eq!(res.get_header("Content-Length"), Some(body.len().to_string().as_str()));
    }

    #[test]
    fn test_markup_in_target_is_escaped() {
        let req = HttpRequest::parse(b"GET /\"><script>alert(1)</script> HTTP/1.1\r\nHost: nas.local\r\n\r\n").unwrap();
        let location = launcher("0.0.0.0").redirect_target(&req);
        assert_eq!(location, "http://nas.local:5000/%22%3E%3Cscript%3Ealert(1)%3C/script%3E");

        let page = String::from_utf8(redirect("http://x/\"><b>").body).unwrap();
        assert!(!page.contains("<b>"));
        assert!(!page.contains("/\">"));
        assert!(page.contains("&lt;b&gt;"));
    }

    #[test]
    fn test_hostile_host_header_ignored() {
        let req = HttpRequest::parse(b"GET / HTTP/1.1\r\nHost: a\"><i>\r\n\r\n").unwrap();
        assert_eq!(launcher("0.0.0.0").redirect_target(&req), "http://localhost:5000/");
    }

    #[cfg(unix)]
    #[test]
    fn test_server_dying_at_launch_is_not_respawned() {
        // `false -S ...` exits straight away, like `php -S` on a taken port
        let mut launcher = launcher_for("false", free_port());
        launcher.ensure_running().unwrap();
        thread::sleep(Duration::from_millis(300));

        let req = HttpRequest::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        for _ in 0..3 {
            assert_eq!(launcher.handle(&req).status_code(), 500);
        }
        assert!(matches!(launcher.ensure_running(), Err(SupervisorError::Backoff(_))));
        assert_eq!(launcher.launches, 1);
    }

    #[test]
    fn test_taken_port_is_not_launched_on() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut launcher = launcher_for("false", port);

        assert!(matches!(launcher.ensure_running(), Err(SupervisorError::PortInUse(p)) if p == port));
        assert_eq!(launcher.launches, 0);
    }

    #[test]
    fn test_launch_failure_is_500() {
        let mut launcher = launcher_for("/nonexistent/php", free_port());
        let req = HttpRequest::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let res = launcher.handle(&req);
        assert_eq!(res.status_code(), 500);
        assert_eq!(res.get_header("Content-Type"), Some("text/plain"));
        assert!(String::from_utf8_lossy(&res.body).contains("failed to start"));
    }
}
