//! Shared test harness: an in-process fake rsyncd upstream and a
//! fully wired proxy on ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use rsync_proxy::{ProxyServer, ShutdownHandle};

pub const GREETING: &[u8] = b"@RSYNCD: 31.0\n";

/// Behavior knobs for a fake upstream rsyncd.
#[derive(Default, Clone)]
pub struct FakeUpstreamOptions {
    /// Raw bytes sent right after the greeting line (an upstream motd).
    pub motd: Vec<u8>,
    /// Expect a PROXY v1 line before the client greeting.
    pub expect_proxy_protocol: bool,
    /// Payload written back once a module is requested. Modules named
    /// "echo" ignore this and echo the spliced stream instead.
    pub payloads: HashMap<String, Vec<u8>>,
}

/// Handle to a running fake upstream.
pub struct FakeUpstream {
    pub addr: String,
    pub seen_proxy_headers: Arc<Mutex<Vec<String>>>,
    pub seen_modules: Arc<Mutex<Vec<String>>>,
}

/// Spawn a fake rsyncd daemon on an ephemeral port. Each accepted
/// connection speaks just enough of the rsyncd handshake for the
/// proxy's relay: greeting in, greeting (+motd) out, module in,
/// payload out.
pub async fn spawn_fake_rsyncd(options: FakeUpstreamOptions) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let seen_proxy_headers = Arc::new(Mutex::new(Vec::new()));
    let seen_modules = Arc::new(Mutex::new(Vec::new()));

    let headers = Arc::clone(&seen_proxy_headers);
    let modules = Arc::clone(&seen_modules);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let options = options.clone();
            let headers = Arc::clone(&headers);
            let modules = Arc::clone(&modules);
            tokio::spawn(async move {
                let _ = serve_one(stream, options, headers, modules).await;
            });
        }
    });

    FakeUpstream {
        addr,
        seen_proxy_headers,
        seen_modules,
    }
}

async fn serve_one(
    stream: TcpStream,
    options: FakeUpstreamOptions,
    headers: Arc<Mutex<Vec<String>>>,
    modules: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if options.expect_proxy_protocol {
        let mut header = Vec::new();
        reader.read_until(b'\n', &mut header).await?;
        headers
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&header).into_owned());
    }

    let mut greeting = Vec::new();
    reader.read_until(b'\n', &mut greeting).await?;
    assert!(
        greeting.starts_with(b"@RSYNCD:"),
        "fake upstream got a non-rsyncd greeting: {greeting:?}"
    );

    write_half.write_all(GREETING).await?;
    if !options.motd.is_empty() {
        write_half.write_all(&options.motd).await?;
    }

    let mut module_line = Vec::new();
    reader.read_until(b'\n', &mut module_line).await?;
    let module = String::from_utf8_lossy(&module_line)
        .trim_end_matches('\n')
        .to_string();
    modules.lock().unwrap().push(module.clone());

    if module == "echo" {
        // Transparent echo until the peer goes away, to exercise the
        // splice stage in both directions.
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            write_half.write_all(&buf[..n]).await?;
        }
    }

    if let Some(payload) = options.payloads.get(&module) {
        write_half.write_all(payload).await?;
    }
    Ok(())
}

/// A bound-and-running proxy plus everything a test needs to poke it.
pub struct TestProxy {
    pub addr: String,
    pub http_addr: String,
    pub config_file: tempfile::NamedTempFile,
    shutdown: ShutdownHandle,
}

impl TestProxy {
    /// Rewrite the config file in place, e.g. before a reload.
    pub fn rewrite_config(&mut self, config_toml: &str) {
        let mut file = std::fs::File::create(self.config_file.path()).unwrap();
        file.write_all(config_toml.as_bytes()).unwrap();
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

pub async fn start_proxy(config_toml: &str) -> TestProxy {
    start_proxy_with_read_timeout(config_toml, Duration::from_secs(5)).await
}

pub async fn start_proxy_with_read_timeout(
    config_toml: &str,
    read_timeout: Duration,
) -> TestProxy {
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    config_file.write_all(config_toml.as_bytes()).unwrap();
    config_file.flush().unwrap();

    let mut server = ProxyServer::new(config_file.path().to_path_buf());
    server.listen_addr = "127.0.0.1:0".to_string();
    server.http_listen_addr = "127.0.0.1:0".to_string();
    server.read_timeout = read_timeout;
    server.write_timeout = Duration::from_secs(5);

    server.load_config().await.expect("config must load");
    server.bind().await.expect("bind must succeed");

    let addr = server.listen_addr.clone();
    let http_addr = server.http_listen_addr.clone();
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move { server.run().await });

    TestProxy {
        addr,
        http_addr,
        config_file,
        shutdown,
    }
}

/// An rsync client halfway through the handshake: greeting exchanged,
/// ready to send a request line.
pub struct TestClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: tokio::net::tcp::OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        writer.write_all(GREETING).await.unwrap();
        let mut server_greeting = Vec::new();
        reader.read_until(b'\n', &mut server_greeting).await.unwrap();
        assert_eq!(server_greeting, GREETING);

        Self { reader, writer }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line).await.unwrap();
        String::from_utf8_lossy(&line).into_owned()
    }

    /// Drain the connection to EOF.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.reader.read_to_end(&mut rest).await.unwrap();
        rest
    }

    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await.unwrap();
        buf
    }
}

/// GET a control plane path and return (status, body).
pub async fn http_get(http_addr: &str, path: &str) -> (u16, String) {
    http_request(http_addr, path, hyper::Method::GET).await
}

pub async fn http_request(http_addr: &str, path: &str, method: hyper::Method) -> (u16, String) {
    use http_body_util::BodyExt;

    let client: hyper_util::client::legacy::Client<_, http_body_util::Full<bytes::Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http();
    let request = hyper::Request::builder()
        .method(method)
        .uri(format!("http://{http_addr}{path}"))
        .body(http_body_util::Full::default())
        .unwrap();

    let response = client.request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
