use std::net::SocketAddr;
use std::time::Instant;
use mio::net::TcpStream;

use crate::http::RequestFramer;

#[derive(Debug, PartialEq)]
pub enum ConnectionState {
    ReadRequest,
    WriteResponse,
}

pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,

    pub state: ConnectionState,
    pub request: RequestFramer,
    pub write_buffer: Vec<u8>,
    pub bytes_written: usize,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, request: RequestFramer) -> Self {
        Self {
            stream,
            peer,
            state: ConnectionState::ReadRequest,
            request,
            write_buffer: Vec::new(),
            bytes_written: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
