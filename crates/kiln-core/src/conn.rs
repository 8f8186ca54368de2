// src/conn.rs
use crate::error::KilnResult;
use crate::http::{self, CANNED_CONTENT_TYPE, StatusCode};
use crate::metrics::ServerMetrics;
use crate::parser::{ParseOutcome, ReadBuf, RequestParser};
use crate::resource::{DocRoot, MappedFile, Resolution};
use crate::syscalls;
use libc::c_int;
use std::net::SocketAddrV4;
use tracing::{debug, trace};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

/// Result of draining the socket into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket would block; `n` new bytes were buffered.
    Data(usize),
    /// The peer closed its side.
    Closed,
    /// The buffer was already full before reading.
    Full,
}

/// What a connection needs after a processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm for read readiness.
    Read,
    /// Re-arm for write readiness; a response is partially sent.
    Write,
    /// A complete request may already be buffered; hand it to a worker.
    Process,
    /// Tear the connection down.
    Close,
}

enum Body {
    Empty,
    Canned(&'static [u8]),
    Mapped(MappedFile),
}

impl Body {
    fn as_slice(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Canned(bytes) => bytes,
            Body::Mapped(map) => map.as_slice(),
        }
    }
}

struct PendingResponse {
    status: StatusCode,
    keep_alive: bool,
    body: Body,
    /// Bytes of head + body already accepted by the kernel.
    written: usize,
}

enum Flush {
    Done,
    Blocked,
}

pub struct Connection {
    fd: c_int,
    peer: Option<SocketAddrV4>,
    buf: ReadBuf,
    parser: RequestParser,
    head: Vec<u8>,
    response: Option<PendingResponse>,
    scheduled: bool,
    requests_served: u32,
}

impl Connection {
    pub fn new(read_capacity: usize) -> Self {
        Self {
            fd: -1,
            peer: None,
            buf: ReadBuf::with_capacity(read_capacity),
            parser: RequestParser::new(),
            head: Vec::with_capacity(WRITE_BUF_SIZE),
            response: None,
            scheduled: false,
            requests_served: 0,
        }
    }

    /// Attach a freshly accepted socket, reusing this slot's allocations.
    pub fn init(&mut self, fd: c_int, peer: Option<SocketAddrV4>) {
        self.fd = fd;
        self.peer = peer;
        self.buf.clear();
        self.parser.reset();
        self.response = None;
        self.scheduled = false;
        self.requests_served = 0;
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// Claim the connection for a worker. `false` if a task is already
    /// outstanding.
    pub fn try_schedule(&mut self) -> bool {
        if self.scheduled {
            return false;
        }
        self.scheduled = true;
        true
    }

    pub fn clear_scheduled(&mut self) {
        self.scheduled = false;
    }

    /// Detach the socket and release the mapping. Returns the descriptor
    /// for the caller to deregister and close.
    pub fn release(&mut self) -> Option<c_int> {
        if self.fd < 0 {
            return None;
        }
        let fd = self.fd;
        self.fd = -1;
        self.peer = None;
        self.response = None;
        self.buf.clear();
        self.parser.reset();
        self.scheduled = false;
        Some(fd)
    }

    /// Read until the socket would block, the peer closes or the buffer
    /// fills up.
    pub fn fill_from_socket(&mut self) -> KilnResult<Fill> {
        if self.buf.is_full() {
            return Ok(Fill::Full);
        }
        let mut total = 0;
        while !self.buf.is_full() {
            match syscalls::read_nonblocking(self.fd, self.buf.spare_mut())? {
                None => break,
                Some(0) => return Ok(Fill::Closed),
                Some(n) => {
                    self.buf.advance(n);
                    total += n;
                }
            }
        }
        trace!(fd = self.fd, bytes = total, "read");
        Ok(Fill::Data(total))
    }

    /// Worker entry point: parse what is buffered, resolve, respond.
    pub fn process(&mut self, docs: &DocRoot, metrics: &ServerMetrics) -> Next {
        loop {
            match self.parser.parse(&mut self.buf) {
                ParseOutcome::NeedMore => {
                    if self.buf.is_full() {
                        debug!(fd = self.fd, "request does not fit the read buffer");
                        return Next::Close;
                    }
                    return Next::Read;
                }
                ParseOutcome::Malformed(reason) => {
                    debug!(fd = self.fd, ?reason, "malformed request");
                    self.respond_canned(StatusCode::BadRequest, false);
                }
                ParseOutcome::Complete => self.respond(docs),
            }
            metrics.inc_req();

            match self.write_pending(metrics) {
                Next::Process => continue,
                next => return next,
            }
        }
    }

    /// Resume a response that blocked earlier.
    pub fn resume_write(&mut self, metrics: &ServerMetrics) -> Next {
        self.write_pending(metrics)
    }

    fn write_pending(&mut self, metrics: &ServerMetrics) -> Next {
        match self.flush(metrics) {
            Ok(Flush::Blocked) => Next::Write,
            Ok(Flush::Done) => self.finish_response(),
            Err(e) => {
                debug!(fd = self.fd, error = %e, "write failed");
                Next::Close
            }
        }
    }

    fn respond(&mut self, docs: &DocRoot) {
        // A mapping left over from a previous keep-alive request goes first.
        self.response = None;
        let head = self.parser.head();
        let keep_alive = head.keep_alive;
        let resolution = docs.resolve(&head.path);
        debug!(
            fd = self.fd,
            peer = ?self.peer,
            method = head.method.as_str(),
            path = %head.path,
            status = resolution.status().code(),
            "request"
        );

        match resolution {
            Resolution::File { path, map, .. } => {
                let content_type = http::content_type_for(&path);
                let body = map.map_or(Body::Empty, Body::Mapped);
                self.start_response(StatusCode::Ok, body, content_type, keep_alive);
            }
            // Directories are answered like a malformed request and closed.
            Resolution::Directory => self.respond_canned(StatusCode::BadRequest, false),
            other => self.respond_canned(other.status(), keep_alive),
        }
    }

    fn respond_canned(&mut self, status: StatusCode, keep_alive: bool) {
        self.response = None;
        let body = Body::Canned(status.canned_body());
        self.start_response(status, body, CANNED_CONTENT_TYPE, keep_alive);
    }

    fn start_response(&mut self, status: StatusCode, body: Body, content_type: &str, keep_alive: bool) {
        http::write_head(&mut self.head, status, body.as_slice().len(), content_type, keep_alive);
        self.response = Some(PendingResponse {
            status,
            keep_alive,
            body,
            written: 0,
        });
    }

    fn flush(&mut self, metrics: &ServerMetrics) -> KilnResult<Flush> {
        let Some(resp) = self.response.as_mut() else {
            return Ok(Flush::Done);
        };
        loop {
            let head_len = self.head.len();
            let body = resp.body.as_slice();
            if resp.written >= head_len + body.len() {
                return Ok(Flush::Done);
            }
            let (head, body) = if resp.written < head_len {
                (&self.head[resp.written..], body)
            } else {
                (&[][..], &body[resp.written - head_len..])
            };
            match syscalls::writev_nonblocking(self.fd, &[head, body])? {
                None | Some(0) => return Ok(Flush::Blocked),
                Some(n) => {
                    resp.written += n;
                    metrics.add_bytes(n);
                }
            }
        }
    }

    /// The response is fully sent: drop the mapping and either prepare the
    /// connection for its next request or close it.
    fn finish_response(&mut self) -> Next {
        let Some(resp) = self.response.take() else {
            return Next::Read;
        };
        self.requests_served += 1;
        trace!(fd = self.fd, status = resp.status.code(), "response sent");
        if !resp.keep_alive {
            return Next::Close;
        }
        self.buf.discard(self.parser.consumed());
        self.parser.reset();
        if self.buf.filled() > 0 {
            Next::Process
        } else {
            Next::Read
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn socket_pair() -> (TcpStream, c_int) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = server.into_raw_fd();
        syscalls::set_nonblocking(fd).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (client, fd)
    }

    fn docs() -> (tempfile::TempDir, DocRoot) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.html");
        fs::write(&file, b"hello kiln").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
        let root = DocRoot::new(dir.path());
        (dir, root)
    }

    fn read_response(client: &mut TcpStream, expected_body: &[u8]) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        while !out.ends_with(expected_body) {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed early");
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    fn wait_for_data(conn: &mut Connection) -> Fill {
        for _ in 0..100 {
            match conn.fill_from_socket().unwrap() {
                Fill::Data(0) => std::thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        Fill::Data(0)
    }

    #[test]
    fn serves_file_and_stays_open_with_keep_alive() {
        let (_dir, docs) = docs();
        let metrics = ServerMetrics::new();
        let (mut client, fd) = socket_pair();
        let mut conn = Connection::new(READ_BUF_SIZE);
        conn.init(fd, None);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(matches!(wait_for_data(&mut conn), Fill::Data(n) if n > 0));
        assert_eq!(conn.process(&docs, &metrics), Next::Read);

        let res = read_response(&mut client, b"hello kiln");
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(res.contains("Content-Length: 10\r\n"));
        assert!(res.contains("Content-Type: text/html\r\n"));
        assert!(res.contains("Connection: keep-alive\r\n"));
        assert_eq!(conn.requests_served(), 1);
        assert_eq!(metrics.requests(), 1);

        let fd = conn.release().unwrap();
        syscalls::close_fd(fd);
    }

    #[test]
    fn partial_request_waits_for_more() {
        let (_dir, docs) = docs();
        let metrics = ServerMetrics::new();
        let (mut client, fd) = socket_pair();
        let mut conn = Connection::new(READ_BUF_SIZE);
        conn.init(fd, None);

        client.write_all(b"GET /index.html HTTP/1.1\r").unwrap();
        wait_for_data(&mut conn);
        assert_eq!(conn.process(&docs, &metrics), Next::Read);

        client.write_all(b"\n\r\n").unwrap();
        wait_for_data(&mut conn);
        assert_eq!(conn.process(&docs, &metrics), Next::Close);
        let res = read_response(&mut client, b"hello kiln");
        assert!(res.contains("Connection: close\r\n"));

        syscalls::close_fd(conn.release().unwrap());
    }

    #[test]
    fn malformed_request_gets_400_and_closes() {
        let (_dir, docs) = docs();
        let metrics = ServerMetrics::new();
        let (mut client, fd) = socket_pair();
        let mut conn = Connection::new(READ_BUF_SIZE);
        conn.init(fd, None);

        client.write_all(b"POST / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
        wait_for_data(&mut conn);
        assert_eq!(conn.process(&docs, &metrics), Next::Close);
        let res = read_response(&mut client, StatusCode::BadRequest.canned_body());
        assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        syscalls::close_fd(conn.release().unwrap());
    }

    #[test]
    fn pipelined_requests_are_answered_in_one_task() {
        let (_dir, docs) = docs();
        let metrics = ServerMetrics::new();
        let (mut client, fd) = socket_pair();
        let mut conn = Connection::new(READ_BUF_SIZE);
        conn.init(fd, None);

        client
            .write_all(
                b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            )
            .unwrap();
        wait_for_data(&mut conn);
        assert_eq!(conn.process(&docs, &metrics), Next::Read);
        let res = read_response(&mut client, StatusCode::NotFound.canned_body());
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(res.contains("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(conn.requests_served(), 2);

        syscalls::close_fd(conn.release().unwrap());
    }

    #[test]
    fn oversized_request_closes() {
        let (_dir, docs) = docs();
        let metrics = ServerMetrics::new();
        let (mut client, fd) = socket_pair();
        let mut conn = Connection::new(32);
        conn.init(fd, None);

        client.write_all(b"GET /index.html HTTP/1.1\r\nHost: a-very-long-host\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.fill_from_socket().unwrap();
        assert_eq!(conn.process(&docs, &metrics), Next::Close);
        assert_eq!(conn.fill_from_socket().unwrap(), Fill::Full);

        syscalls::close_fd(conn.release().unwrap());
    }

    #[test]
    fn schedule_flag_is_exclusive() {
        let mut conn = Connection::new(64);
        conn.init(99, None);
        assert!(conn.try_schedule());
        assert!(!conn.try_schedule());
        conn.clear_scheduled();
        assert!(conn.try_schedule());
        assert_eq!(conn.release(), Some(99));
        assert!(!conn.is_scheduled());
        assert_eq!(conn.release(), None);
    }
}
