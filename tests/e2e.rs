//! End-to-end tests: a bound server, real sockets, on-disk templates.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tclscgi::server::Server;
use tclscgi::{protocol, Config};


struct FixtureDir(PathBuf);

impl FixtureDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("tclscgi-e2e-{:08x}", fastrand::u32(..)));
        std::fs::create_dir_all(&dir).expect("create fixture dir");
        Self(dir)
    }

    fn file(&self, name: &str, contents: &str) -> &Self {
        std::fs::write(self.0.join(name), contents).expect("write fixture");
        self
    }

    fn path(&self) -> String {
        self.0.display().to_string()
    }
}

impl Drop for FixtureDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Binds a server on an ephemeral port and runs it in the background.
async fn start(config: Config) -> SocketAddr {
    let server = Server::bind(Config { port: 0, ..config }).await.expect("bind server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

fn scgi_bytes(headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let pairs: Vec<(&[u8], &[u8])> =
        headers.iter().map(|&(n, v)| (n.as_bytes(), v.as_bytes())).collect();
    let mut buf = Vec::with_capacity(256);
    protocol::write(pairs.iter().copied(), body, &mut buf).expect("write to Vec");
    buf
}

/// Sends raw bytes and reads the full response until the server closes.
async fn roundtrip(addr: SocketAddr, request: Vec<u8>) -> String {
    tokio::task::spawn_blocking(move || {
        let mut socket = std::net::TcpStream::connect(addr).expect("connect");
        socket.write_all(&request).expect("send request");
        let mut response = String::new();
        socket.read_to_string(&mut response).expect("read response");
        response
    })
    .await
    .expect("client task")
}

fn config_for(dir: &FixtureDir) -> Config {
    Config { script_path: dir.path(), ..Config::default() }
}


#[tokio::test]
async fn minimal_request_index_fallback() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "Hello");
    let addr = start(config_for(&dir)).await;

    // The smallest valid request, byte for byte
    let response = roundtrip(addr, b"24:CONTENT_LENGTH\x000\x00SCGI\x001\x00,".to_vec()).await;
    assert_eq!(response, "Status: 200\nContent-type: text/html;charset=utf-8\n\nHello\n");
}

#[tokio::test]
async fn template_execution() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "<p><?@ 1 + 2 ?></p>");
    let addr = start(config_for(&dir)).await;

    let request = scgi_bytes(&[("CONTENT_LENGTH", "0"), ("SCGI", "1")], b"");
    let response = roundtrip(addr, request).await;
    let (_, body) = response.split_once("\n\n").expect("header separator");
    assert_eq!(body, "<p>3</p>\n");
}

#[tokio::test]
async fn form_post_params() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "a=<? puts $params(a) ?> b=<? puts $params(b) ?>");
    let addr = start(config_for(&dir)).await;

    let request = scgi_bytes(
        &[
            ("CONTENT_LENGTH", "7"),
            ("SCGI", "1"),
            ("HTTP_CONTENT_TYPE", "application/x-www-form-urlencoded"),
        ],
        b"a=1&b=2",
    );
    let response = roundtrip(addr, request).await;
    let (_, body) = response.split_once("\n\n").expect("header separator");
    assert_eq!(body, "a=1 b=2\n");
}

#[tokio::test]
async fn missing_template_is_404() {
    let dir = FixtureDir::new();
    let addr = start(Config::default()).await;

    let root = dir.path();
    let request = scgi_bytes(
        &[
            ("CONTENT_LENGTH", "0"),
            ("SCGI", "1"),
            ("DOCUMENT_ROOT", root.as_str()),
            ("SCRIPT_NAME", "/missing.tcl"),
        ],
        b"",
    );
    let response = roundtrip(addr, request).await;
    assert!(response.starts_with("Status: 404 Not found\n"), "{response}");
    assert!(response.contains("Could not find"));
}

#[tokio::test]
async fn script_error_is_500() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "<? error oops ?>");
    let addr = start(config_for(&dir)).await;

    let request = scgi_bytes(&[("CONTENT_LENGTH", "0"), ("SCGI", "1")], b"");
    let response = roundtrip(addr, request).await;
    assert!(response.starts_with("Status: 500 Internal server error\n"), "{response}");
    let (_, body) = response.split_once("\n\n").expect("header separator");
    assert!(body.starts_with("<pre>"), "{body}");
    assert!(body.contains("oops"));
}

#[tokio::test]
async fn location_header_implies_redirect() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "<? header Location /next ?>");
    let addr = start(config_for(&dir)).await;

    let request = scgi_bytes(&[("CONTENT_LENGTH", "0"), ("SCGI", "1")], b"");
    let response = roundtrip(addr, request).await;
    assert!(response.starts_with("Location: /next\nStatus: 302 Found\n"), "{response}");
}

#[tokio::test]
async fn saturation_then_recovery() {
    let dir = FixtureDir::new();
    // A deliberately slow template keeps the single worker busy
    dir.file("slow.tcl", "<? set i 0\nwhile {$i < 200000} { incr i } ?>slow done");
    dir.file("index.tcl", "fast done");
    let addr = start(Config { max_threads: 1, min_threads: 1, ..config_for(&dir) }).await;

    let slow = scgi_bytes(
        &[("CONTENT_LENGTH", "0"), ("SCGI", "1"), ("DOCUMENT_URI", "/slow.tcl")],
        b"",
    );
    let fast = scgi_bytes(&[("CONTENT_LENGTH", "0"), ("SCGI", "1")], b"");

    // The fast request is fully read while the slow one occupies the
    // worker; it only waits on worker acquisition
    let slow_task = tokio::spawn(roundtrip(addr, slow));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast_task = tokio::spawn(roundtrip(addr, fast));

    let slow_response = slow_task.await.expect("slow client");
    let fast_response = fast_task.await.expect("fast client");
    assert!(slow_response.ends_with("\n\nslow done\n"), "{slow_response}");
    assert!(fast_response.ends_with("\n\nfast done\n"), "{fast_response}");
}

#[tokio::test]
async fn idle_timeout_drops_connection() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "never served");
    let config = Config {
        conn_keepalive: Some(Duration::from_millis(100)),
        ..config_for(&dir)
    };
    let addr = start(config).await;

    let response = tokio::task::spawn_blocking(move || {
        let mut socket = std::net::TcpStream::connect(addr).expect("connect");
        // Half a request, then silence: the idle timer must fire
        socket.write_all(b"24:CONTENT_LEN").expect("send partial");
        let mut response = Vec::new();
        socket.read_to_end(&mut response).expect("read until close");
        response
    })
    .await
    .expect("client task");
    assert!(response.is_empty());
}

#[tokio::test]
async fn malformed_framing_closes_without_response() {
    let dir = FixtureDir::new();
    dir.file("index.tcl", "never served");
    let addr = start(config_for(&dir)).await;

    let response = tokio::task::spawn_blocking(move || {
        let mut socket = std::net::TcpStream::connect(addr).expect("connect");
        socket.write_all(b"not a netstring").expect("send garbage");
        let mut response = Vec::new();
        socket.read_to_end(&mut response).expect("read until close");
        response
    })
    .await
    .expect("client task");
    assert!(response.is_empty());
}
