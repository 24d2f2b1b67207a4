pub mod connection;
use crate::config::Config;
use crate::error::ServerError;
use crate::handlers::Dispatcher;
use crate::http::{ Framing, HttpRequest, HttpResponse, RequestFramer };
use crate::server::connection::{ Connection, ConnectionState };

use mio::net::TcpListener;
use mio::{ Interest, Poll, Token };
use std::collections::HashMap;
use std::io::{ self, Read, Write };
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::{ Duration, Instant };

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Single-threaded reactor. Requests are answered one at a time; a slow
/// script holds up the loop until it finishes or times out.
pub struct Server {
    poll: Poll,
    listener: Option<TcpListener>,
    connections: HashMap<Token, Connection>,
    dispatcher: Dispatcher,
    config: Config,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config, dispatcher: Dispatcher) -> Result<Self, ServerError> {
        Ok(Self {
            poll: Poll::new()?,
            listener: None,
            connections: HashMap::new(),
            dispatcher,
            config,
            next_token: LISTENER.0 + 1,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Raising this flag makes `run` return after the current iteration.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        let addr_str = self.config.listen_addr();
        let addr: SocketAddr = addr_str.parse().map_err(|e: std::net::AddrParseError| {
            ServerError::Address { addr: addr_str.clone(), reason: e.to_string() }
        })?;

        let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            addr: addr_str.clone(),
            source,
        })?;
        self.poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        let local = listener.local_addr()?;
        tracing::info!(addr = %local, root = %self.config.document_root.display(), mode = %self.config.mode, "listening");
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = mio::Events::with_capacity(1024);

        tracing::debug!("event loop started");
        while !self.stopping() {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();

                if token == LISTENER {
                    self.accept_connection();
                } else {
                    self.handle_client_event(token, event);
                }
            }
            self.check_timeouts();
        }

        tracing::info!("shutting down");
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || crate::signals::requested()
    }

    fn handle_client_event(&mut self, token: Token, event: &mio::event::Event) {
        if event.is_readable() {
            self.read_from_client(token);
        }

        if event.is_writable() {
            self.write_to_client(token);
        }

        if event.is_error() || event.is_write_closed() {
            self.close_connection(token);
        }
    }

    fn read_from_client(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) if c.state == ConnectionState::ReadRequest => c,
            _ => {
                return;
            }
        };

        let mut buf = [0u8; 4096];
        let mut framing = Framing::Incomplete;
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.close_connection(token);
                    return;
                }
                Ok(n) => {
                    conn.touch();
                    framing = conn.request.push(&buf[..n]);
                    if framing != Framing::Incomplete {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.close_connection(token);
                    return;
                }
            }
        }

        match framing {
            Framing::Incomplete => {}
            Framing::Complete => self.process_request(token),
            Framing::HeadersTooLarge => {
                let response = HttpResponse::text(
                    "431 Request Header Fields Too Large",
                    "Request Header Fields Too Large"
                );
                self.finalize_response(token, "-", "-", response);
            }
            Framing::BodyTooLarge => {
                let response = HttpResponse::text("413 Payload Too Large", "Payload Too Large");
                self.finalize_response(token, "-", "-", response);
            }
        }
    }

    fn write_to_client(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) if c.state == ConnectionState::WriteResponse => c,
            _ => {
                return;
            }
        };

        while conn.bytes_written < conn.write_buffer.len() {
            let to_write = &conn.write_buffer[conn.bytes_written..];

            match conn.stream.write(to_write) {
                Ok(n) => {
                    conn.bytes_written += n;
                    conn.touch();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.close_connection(token);
                    return;
                }
            }
        }

        tracing::trace!(?token, "response sent");
        self.close_connection(token);
    }

    fn process_request(&mut self, token: Token) {
        let request = match self.connections.get(&token) {
            Some(conn) => HttpRequest::parse(conn.request.buffer()),
            None => {
                return;
            }
        };

        let request = match request {
            Some(req) => req,
            None => {
                let response = HttpResponse::text("400 Bad Request", "Bad Request");
                self.finalize_response(token, "-", "-", response);
                return;
            }
        };

        let response = self.dispatcher.dispatch(&request);
        self.finalize_response(token, &request.method, &request.uri, response);
    }

    fn finalize_response(&mut self, token: Token, method: &str, uri: &str, response: HttpResponse) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => {
                return;
            }
        };

        tracing::info!(
            peer = %conn.peer,
            method,
            uri,
            status = response.status_code(),
            bytes = response.body.len(),
            "request"
        );

        conn.write_buffer = response.to_bytes();
        conn.bytes_written = 0;
        conn.state = ConnectionState::WriteResponse;
        conn.touch();

        if let Err(e) = self.poll.registry().reregister(&mut conn.stream, token, Interest::WRITABLE) {
            tracing::warn!(?token, error = %e, "failed to reregister connection");
            self.close_connection(token);
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let to_remove: Vec<Token> = self.connections
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_activity) > timeout)
            .map(|(&t, _)| t)
            .collect();

        for t in to_remove {
            tracing::debug!(token = ?t, "closing idle connection");
            self.close_connection(t);
        }
    }

    fn accept_connection(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => {
                    return;
                }
            };

            match accepted {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        tracing::warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }

                    let framer = RequestFramer::new(self.config.max_header_size, self.config.max_body_size);
                    self.connections.insert(token, Connection::new(stream, peer, framer));
                    tracing::trace!(?token, %peer, "accepted");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServeMode;
    use std::fs;
    use std::net::TcpStream;
    use std::thread;

    fn start(mode: ServeMode, max_body_size: usize) -> (tempfile::TempDir, SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
        start_with(Config { mode, max_body_size, ..Config::default() })
    }

    fn start_with(base: Config) -> (tempfile::TempDir, SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>media</h1>").unwrap();

        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            document_root: dir.path().to_path_buf(),
            ..base
        };
        let dispatcher = Dispatcher::from_config(&config);
        let mut server = Server::new(config, dispatcher).unwrap();
        let addr = server.bind().unwrap();
        let stop = server.shutdown_handle();
        let handle = thread::spawn(move || {
            server.run().unwrap();
        });
        (dir, addr, stop, handle)
    }

    fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(raw).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    #[test]
    fn test_serves_static_and_404_over_tcp() {
        let (_dir, addr, stop, handle) = start(ServeMode::Static, 1024);

        let ok = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(ok.contains("Content-Type: text/html\r\n"));
        assert!(ok.contains("Content-Length: 14\r\n"));
        assert!(ok.ends_with("\r\n\r\n<h1>media</h1>"));

        let missing = roundtrip(addr, b"GET /nope.txt HTTP/1.1\r\n\r\n");
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(missing.contains("404 - File Not Found"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_oversized_body_rejected() {
        let (_dir, addr, stop, handle) = start(ServeMode::Static, 8);

        let res = roundtrip(addr, b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n0123456789");
        assert!(res.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_oversized_headers_rejected() {
        let (_dir, addr, stop, handle) = start_with(Config {
            mode: ServeMode::Static,
            max_header_size: 1024,
            max_body_size: 1024,
            ..Config::default()
        });

        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend_from_slice(&[b'A'; 2048]);
        let started = Instant::now();
        let res = roundtrip(addr, &raw);
        assert!(res.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(started.elapsed() < Duration::from_secs(2));

        // the reactor is still serving other clients
        let ok = roundtrip(addr, b"GET / HTTP/1.1\r\n\r\n");
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_garbage_request_line() {
        let (_dir, addr, stop, handle) = start(ServeMode::Static, 1024);

        let res = roundtrip(addr, b"\r\n\r\n");
        assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
