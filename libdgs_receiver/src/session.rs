//! Request/reply session with the event server.
//!
//! The protocol is a strict client-driven loop: send a 4-byte request, read a
//! 16-byte reply header, and, when the server has a summary ready, read the
//! payload it describes. A second request is pipelined as soon as a summary
//! header arrives so the server can stage the next pool while this one
//! drains. Any I/O failure tears the connection down; the caller retries with
//! backoff, so no fault here is fatal.

use byteorder::{ByteOrder, NetworkEndian};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::constants::*;
use super::error::SessionError;

/// Cumulative traffic counters for one receiver instance. The counters
/// survive reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub seq_errors: u64,
    pub bytes_received: u64,
}

/// Owns the one outstanding connection to the event server.
#[derive(Debug)]
pub struct ServerSession {
    endpoint: String,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    counters: SessionCounters,
    ever_connected: bool,
}

impl ServerSession {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            stream: None,
            buffer: Vec::new(),
            counters: SessionCounters::default(),
            ever_connected: false,
        }
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Whether a connection has ever been established. Used to tell "server
    /// not up yet" apart from "server went away" in user-facing output.
    pub fn has_connected(&self) -> bool {
        self.ever_connected
    }

    /// Request a buffer of raw event bytes from the server.
    ///
    /// Connects first if needed. Returns the payload of one summary reply,
    /// `NoDataYet` when the server reports insufficient data (the request
    /// pipeline stays primed), or `Disconnected`/`UnexpectedReply` after
    /// tearing the connection down.
    pub fn fetch(&mut self) -> Result<&[u8], SessionError> {
        if self.stream.is_none() {
            self.connect()?;
        }

        let mut reply = [0u8; REPLY_HEADER_BYTES];
        if self.read_reply(&mut reply).is_err() {
            self.drop_connection();
            return Err(SessionError::Disconnected);
        }
        self.counters.packets_received += 1;

        let kind = NetworkEndian::read_i32(&reply[0..4]);
        let record_unit_size = NetworkEndian::read_i32(&reply[4..8]);
        let status = NetworkEndian::read_i32(&reply[8..12]);
        let record_count = NetworkEndian::read_i32(&reply[12..16]);
        spdlog::trace!(
            "reply kind {kind}, unit {record_unit_size}, status {status}, records {record_count}"
        );

        match kind {
            SERVER_SUMMARY => {
                // Pipeline the next request; the payload below still belongs
                // to the request already in flight.
                self.send_request()?;

                let need = record_unit_size.max(0) as usize * record_count.max(0) as usize;
                self.buffer.resize(need, 0);
                let stream = self.stream.as_mut().ok_or(SessionError::Disconnected)?;
                if stream.read_exact(&mut self.buffer).is_err() {
                    self.drop_connection();
                    return Err(SessionError::Disconnected);
                }
                self.counters.bytes_received += need as u64;
                Ok(&self.buffer)
            }
            INSUFF_DATA => {
                self.send_request()?;
                Err(SessionError::NoDataYet)
            }
            SERVER_SENDER_OFF => {
                spdlog::info!("Server reports sender off; closing connection");
                self.drop_connection();
                Err(SessionError::Disconnected)
            }
            other => {
                self.counters.seq_errors += 1;
                spdlog::error!("Illegal reply kind {other} from server; closing connection");
                self.drop_connection();
                Err(SessionError::UnexpectedReply(other))
            }
        }
    }

    /// Open the stream socket and prime the request pipeline.
    fn connect(&mut self) -> Result<(), SessionError> {
        let stream = match TcpStream::connect(&self.endpoint) {
            Ok(stream) => stream,
            Err(e) => {
                if self.ever_connected {
                    spdlog::warn!("Connect to {} failed: {e}", self.endpoint);
                }
                return Err(SessionError::Disconnected);
            }
        };
        set_socket_buffers(&stream);
        spdlog::info!("Connected to event server at {}", self.endpoint);
        self.stream = Some(stream);
        self.ever_connected = true;
        self.send_request()
    }

    /// Send the single request word the protocol knows.
    fn send_request(&mut self) -> Result<(), SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::Disconnected)?;
        let mut request = [0u8; SIZE_UNIT];
        NetworkEndian::write_u32(&mut request, CLIENT_REQUEST_EVENTS);
        if stream.write_all(&request).is_err() {
            spdlog::warn!("Request send failed");
            self.drop_connection();
            return Err(SessionError::Disconnected);
        }
        self.counters.packets_sent += 1;
        Ok(())
    }

    /// Read exactly one reply header, looping over partial reads. A read of
    /// zero bytes (peer closed) surfaces as an error here.
    fn read_reply(&mut self, reply: &mut [u8; REPLY_HEADER_BYTES]) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        stream.read_exact(reply)
    }

    /// Discard the connection. The next `fetch` reconnects from scratch.
    fn drop_connection(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Be generous with the kernel buffers; the server can burst a whole record
/// pool at once.
#[cfg(unix)]
fn set_socket_buffers(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;

    let size = SOCKET_BUF_BYTES as libc::c_int;
    let len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let fd = stream.as_raw_fd();
    for (name, opt) in [("SO_RCVBUF", libc::SO_RCVBUF), ("SO_SNDBUF", libc::SO_SNDBUF)] {
        // SAFETY: fd is a valid socket owned by `stream` for the duration of
        // this call, and the option value points at a live c_int.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &size as *const libc::c_int as *const libc::c_void,
                len,
            )
        };
        if ret != 0 {
            spdlog::warn!("could not set {name}");
        }
    }
}

#[cfg(not(unix))]
fn set_socket_buffers(_stream: &TcpStream) {}

/// Exponential polling backoff used when the server has nothing for us.
/// Starts at one microsecond, doubles per failure up to a ceiling, and is
/// halved again after each successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current_us: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current_us: BACKOFF_START_US,
        }
    }

    /// The delay to sleep before the next attempt. Each call doubles the
    /// following delay, up to the ceiling.
    pub fn delay(&mut self) -> Duration {
        let delay = Duration::from_micros(self.current_us);
        self.current_us = (self.current_us * 2).min(BACKOFF_MAX_US);
        delay
    }

    /// Register a successful fetch, halving the next delay.
    pub fn succeed(&mut self) {
        if self.current_us > BACKOFF_START_US {
            self.current_us /= 2;
        }
    }

    /// True once the delay has saturated; used to throttle idle reporting.
    pub fn at_ceiling(&self) -> bool {
        self.current_us >= BACKOFF_MAX_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn write_reply(stream: &mut TcpStream, kind: i32, unit: i32, count: i32) {
        let mut reply = [0u8; REPLY_HEADER_BYTES];
        NetworkEndian::write_i32(&mut reply[0..4], kind);
        NetworkEndian::write_i32(&mut reply[4..8], unit);
        NetworkEndian::write_i32(&mut reply[8..12], 0);
        NetworkEndian::write_i32(&mut reply[12..16], count);
        stream.write_all(&reply).unwrap();
    }

    fn read_request(stream: &mut TcpStream) {
        let mut request = [0u8; SIZE_UNIT];
        stream.read_exact(&mut request).unwrap();
        assert_eq!(NetworkEndian::read_u32(&request), CLIENT_REQUEST_EVENTS);
    }

    #[test]
    fn test_summary_reply_returns_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            write_reply(&mut stream, SERVER_SUMMARY, 8, 3);
            stream.write_all(&[0xAB; 24]).unwrap();
            // The pipelined request must already be in flight.
            read_request(&mut stream);
        });

        let mut session = ServerSession::new(addr.to_string());
        let payload = session.fetch().unwrap().to_vec();
        assert_eq!(payload, vec![0xAB; 24]);
        assert_eq!(session.counters().bytes_received, 24);
        assert_eq!(session.counters().packets_sent, 2);
        server.join().unwrap();
    }

    #[test]
    fn test_insufficient_data_is_not_a_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            write_reply(&mut stream, INSUFF_DATA, 0, 0);
            read_request(&mut stream);
            write_reply(&mut stream, INSUFF_DATA, 0, 0);
            read_request(&mut stream);
        });

        let mut session = ServerSession::new(addr.to_string());
        assert!(matches!(session.fetch(), Err(SessionError::NoDataYet)));
        assert!(matches!(session.fetch(), Err(SessionError::NoDataYet)));
        assert!(session.has_connected());
        server.join().unwrap();
    }

    #[test]
    fn test_sender_off_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            write_reply(&mut stream, SERVER_SENDER_OFF, 0, 0);
        });

        let mut session = ServerSession::new(addr.to_string());
        assert!(matches!(session.fetch(), Err(SessionError::Disconnected)));
        server.join().unwrap();
    }

    #[test]
    fn test_unknown_reply_counts_seq_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            write_reply(&mut stream, 42, 0, 0);
        });

        let mut session = ServerSession::new(addr.to_string());
        assert!(matches!(
            session.fetch(),
            Err(SessionError::UnexpectedReply(42))
        ));
        assert_eq!(session.counters().seq_errors, 1);
        server.join().unwrap();
    }

    #[test]
    fn test_peer_close_is_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            // Close without replying.
        });

        let mut session = ServerSession::new(addr.to_string());
        assert!(matches!(session.fetch(), Err(SessionError::Disconnected)));
        server.join().unwrap();
    }

    #[test]
    fn test_backoff_doubles_then_halves() {
        let mut backoff = Backoff::new();
        // Two consecutive empty polls: the interval doubles between them.
        let first = backoff.delay();
        let second = backoff.delay();
        assert_eq!(second, first * 2);

        for _ in 0..32 {
            backoff.delay();
        }
        assert!(backoff.at_ceiling());
        assert_eq!(backoff.delay(), Duration::from_micros(BACKOFF_MAX_US));

        backoff.succeed();
        assert_eq!(
            backoff.delay(),
            Duration::from_micros(BACKOFF_MAX_US / 2)
        );
    }
}
