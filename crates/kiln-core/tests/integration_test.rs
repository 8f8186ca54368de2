use kiln_core::metrics::ServerMetrics;
use kiln_core::{Reactor, ReactorHandle, ServerConfig, syscalls};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct TestServer {
    port: u16,
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
    metrics: Arc<ServerMetrics>,
    _root: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn write_file(dir: &tempfile::TempDir, name: &str, body: &[u8], mode: u32) {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

fn setup_test_server() -> TestServer {
    syscalls::ignore_sigpipe().unwrap();

    let root = tempfile::tempdir().unwrap();
    write_file(&root, "index.html", b"<h1>kiln</h1>", 0o644);
    write_file(&root, "secret.txt", b"top secret", 0o640);
    write_file(&root, "empty.txt", b"", 0o644);
    fs::create_dir(root.path().join("docs")).unwrap();
    fs::set_permissions(root.path().join("docs"), fs::Permissions::from_mode(0o755)).unwrap();

    let config = ServerConfig {
        port: 0,
        doc_root: root.path().to_path_buf(),
        workers: 2,
        queue_capacity: 64,
        max_fds: 65535,
        max_connections: 128,
        ..ServerConfig::default()
    };
    let metrics = Arc::new(ServerMetrics::new());
    let reactor = Reactor::bind(&config, metrics.clone()).unwrap();
    let port = reactor.local_port();
    let handle = reactor.handle();
    let thread = thread::spawn(move || reactor.run().unwrap());

    TestServer {
        port,
        handle,
        thread: Some(thread),
        metrics,
        _root: root,
    }
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Read one response: head as text, body sized by Content-Length.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed before the response head ended");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("Content-Length header")
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_keep_alive_serves_two_requests() {
    let server = setup_test_server();
    let mut stream = connect(&server);

    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, b"<h1>kiln</h1>");
    }

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    assert_closed(&mut stream);
    assert!(server.metrics.requests() >= 3);
}

#[test]
fn test_error_statuses() {
    let server = setup_test_server();

    let cases: [(&[u8], &str); 4] = [
        (b"GET /secret.txt HTTP/1.1\r\n\r\n", "HTTP/1.1 403 Forbidden\r\n"),
        (b"GET /missing.html HTTP/1.1\r\n\r\n", "HTTP/1.1 404 Not Found\r\n"),
        (b"POST /index.html HTTP/1.1\r\n\r\n", "HTTP/1.1 400 Bad Request\r\n"),
        (b"GET /docs HTTP/1.1\r\n\r\n", "HTTP/1.1 400 Bad Request\r\n"),
    ];
    for (request, status) in cases {
        let mut stream = connect(&server);
        stream.write_all(request).unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with(status), "{head}");
        assert!(!body.is_empty());
        assert_closed(&mut stream);
    }
}

#[test]
fn test_not_found_keeps_connection_alive() {
    let server = setup_test_server();
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, b"The requested file was not found on this server.\n");

    stream.write_all(b"GET /empty.txt HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 0\r\n"));
    assert!(body.is_empty());
}

#[test]
fn test_large_file_to_slow_reader_then_keep_alive() {
    let server = setup_test_server();
    let big: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    write_file(&server._root, "big.bin", &big, 0o644);

    // The second request sits in the read buffer while the first response
    // is still blocked on the socket.
    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /big.bin HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
    thread::sleep(Duration::from_millis(300));

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Length: {}\r\n", big.len())));
    assert!(body == big, "large body differs");

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<h1>kiln</h1>");

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(server.metrics.bytes_sent() >= big.len());
}

#[test]
fn test_huge_content_length_gets_400() {
    let server = setup_test_server();
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_closed(&mut stream);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server.metrics.active() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.metrics.active(), 0);
}

#[test]
fn test_request_split_across_writes() {
    let server = setup_test_server();
    let mut stream = connect(&server);
    stream.set_nodelay(true).unwrap();

    for part in [&b"GE"[..], b"T /index.html HTTP/1.1\r", b"\nHost: x\r\n", b"\r\n"] {
        stream.write_all(part).unwrap();
        thread::sleep(Duration::from_millis(20));
    }
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<h1>kiln</h1>");
}

#[test]
fn test_body_is_consumed_before_next_request() {
    let server = setup_test_server();
    let mut stream = connect(&server);

    stream
        .write_all(
            b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nhelloGET /empty.txt HTTP/1.1\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<h1>kiln</h1>");

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(body.is_empty());
    assert_closed(&mut stream);
}

#[test]
fn test_oversized_request_is_dropped() {
    let server = setup_test_server();
    let mut stream = connect(&server);

    let mut request = b"GET /index.html HTTP/1.1\r\n".to_vec();
    while request.len() < 4096 {
        request.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
    }
    // The server may close while we are still writing.
    let _ = stream.write_all(&request);
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

#[test]
fn test_shutdown_closes_connections() {
    let mut server = setup_test_server();
    let mut stream = connect(&server);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.metrics.active(), 1);

    server.handle.shutdown();
    server.thread.take().unwrap().join().unwrap();
    assert_eq!(server.metrics.active(), 0);
    assert_closed(&mut stream);
}
