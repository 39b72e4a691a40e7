use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use url::Url;

use crate::bridge::BridgeError;
use crate::config::{BridgeConfig, ToolConfig, TransportConfig, TrustPolicy, TunnelConfig};
use crate::credentials::NoCredentials;
use crate::dial::{DialError, DialStage};
use crate::handshake::read_response_head;
use crate::session::{release, run_session, SessionError, SessionState, TunnelSession};
use crate::supervisor::{ProcessOutcome, ProcessToolRunner, ToolError, ToolRunner};
use crate::transport::{TunnelConnection, TunnelStream};

const SWITCHED: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: rsync\r\nConnection: Upgrade\r\n\r\n@RSYNCD: 31.0\n";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
const GREETING: &[u8] = b"@RSYNCD: 31.0\n";

/// Answers the upgrade request, then echoes tunnel bytes until EOF.
/// Returns the number of tunnel bytes echoed.
async fn answer_and_echo<S>(mut stream: S, response: &'static [u8]) -> usize
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = read_response_head(&mut stream, 8192).await.unwrap();
    stream.write_all(response).await.unwrap();
    stream.flush().await.unwrap();

    let mut echoed = 0;
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return echoed,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return echoed;
                }
                echoed += n;
            }
        }
    }
}

async fn plain_server(response: &'static [u8]) -> (Url, tokio::task::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/flamenco", listener.local_addr().unwrap())).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        answer_and_echo(stream, response).await
    });
    (url, server)
}

struct TlsServer {
    port: u16,
    certificate: Vec<u8>,
    handle: tokio::task::JoinHandle<Option<usize>>,
}

async fn tls_server(response: &'static [u8]) -> TlsServer {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certificate = cert.serialize_der().unwrap();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(certificate.clone())],
            rustls::PrivateKey(cert.serialize_private_key_der()),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        match acceptor.accept(tcp).await {
            Ok(tls) => Some(answer_and_echo(tls, response).await),
            Err(_) => None,
        }
    });

    TlsServer {
        port,
        certificate,
        handle,
    }
}

fn trusting(certificate: &[u8]) -> TrustPolicy {
    TrustPolicy {
        use_native_roots: false,
        ..TrustPolicy::default()
    }
    .with_root_certificate(certificate.to_vec())
}

fn quick_config(url: Url) -> TunnelConfig {
    let mut config = TunnelConfig::new(url);
    config.transport = TransportConfig {
        connect_timeout: Duration::from_secs(2),
        tls_handshake_timeout: Some(Duration::from_secs(2)),
        response_header_timeout: Some(Duration::from_secs(2)),
        ..TransportConfig::default()
    };
    config.bridge = BridgeConfig {
        drain_timeout: Duration::from_millis(300),
        ..BridgeConfig::default()
    };
    config
}

/// Fails the test if the session ever gets as far as the tool
#[derive(Default)]
struct NeverRun {
    ran: AtomicBool,
}

#[async_trait]
impl ToolRunner for NeverRun {
    async fn run(&self, _endpoint: SocketAddr) -> Result<ProcessOutcome, ToolError> {
        self.ran.store(true, Ordering::SeqCst);
        Ok(success(""))
    }
}

/// Reads the daemon greeting, sends `payload` and expects it echoed back
struct EchoTool {
    payload: Vec<u8>,
}

#[async_trait]
impl ToolRunner for EchoTool {
    async fn run(&self, endpoint: SocketAddr) -> Result<ProcessOutcome, ToolError> {
        let mut local = TcpStream::connect(endpoint).await.unwrap();

        let mut greeting = vec![0u8; GREETING.len()];
        local.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, GREETING);

        let (mut rd, mut wr) = local.split();
        let mut echoed = vec![0u8; self.payload.len()];
        let (written, read) = tokio::join!(wr.write_all(&self.payload), rd.read_exact(&mut echoed));
        written.unwrap();
        read.unwrap();
        assert!(echoed == self.payload, "echo differs from payload");

        Ok(success("sent 65.54K bytes"))
    }
}

fn success(stderr: &str) -> ProcessOutcome {
    ProcessOutcome {
        status: ExitStatus::from_raw(0),
        stderr: stderr.to_string(),
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn connect_deadline_yields_dial_timeout_and_no_bridge() {
    // A listener whose accept queue is full silently drops further SYNs.
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket
        .bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())
        .unwrap();
    socket.listen(0).unwrap();
    let addr = socket.local_addr().unwrap().as_socket().unwrap();
    let mut queued = Vec::new();
    for _ in 0..64 {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => queued.push(stream),
            Err(_) => break,
        }
    }

    let mut config = quick_config(Url::parse(&format!("http://{}/", addr)).unwrap());
    config.transport.connect_timeout = Duration::from_millis(300);
    let tool = Arc::new(NeverRun::default());
    let mut session = TunnelSession::new(config, tool.clone());

    let err = session.run().await.unwrap_err();
    assert!(
        matches!(err, SessionError::Dial(DialError::Timeout { stage: DialStage::Connect, .. })),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!tool.ran.load(Ordering::SeqCst));
    drop(queued);
}

#[tokio::test]
async fn tls_404_is_rejected_and_connection_closed() {
    let server = tls_server(NOT_FOUND).await;
    let mut config = quick_config(
        Url::parse(&format!("https://localhost:{}/flamenco", server.port)).unwrap(),
    );
    config.trust = trusting(&server.certificate);
    let tool = Arc::new(NeverRun::default());
    let mut session = TunnelSession::new(config, tool.clone());

    let err = session.run().await.unwrap_err();
    assert!(
        matches!(err, SessionError::Dial(DialError::UpgradeRejected { status: 404, .. })),
        "unexpected error: {err}"
    );
    assert!(!tool.ran.load(Ordering::SeqCst));

    // The server only returns once the client closed its side.
    let echoed = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("rejected connection was left open")
        .unwrap();
    assert_eq!(echoed, Some(0));
}

#[tokio::test]
async fn certificate_for_another_host_is_an_identity_error() {
    let server = tls_server(SWITCHED).await;
    let mut config =
        quick_config(Url::parse(&format!("https://127.0.0.1:{}/", server.port)).unwrap());
    config.trust = trusting(&server.certificate);

    let err = TunnelSession::new(config, Arc::new(NeverRun::default()))
        .run()
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Dial(DialError::TlsIdentity { .. })),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn untrusted_certificate_fails_the_handshake() {
    let server = tls_server(SWITCHED).await;
    let mut config =
        quick_config(Url::parse(&format!("https://localhost:{}/", server.port)).unwrap());
    config.trust = TrustPolicy {
        use_native_roots: false,
        ..TrustPolicy::default()
    };

    let err = TunnelSession::new(config, Arc::new(NeverRun::default()))
        .run()
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Dial(DialError::TlsHandshake { .. })),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn insecure_mode_skips_certificate_checks() {
    let server = tls_server(SWITCHED).await;
    let mut config =
        quick_config(Url::parse(&format!("https://127.0.0.1:{}/", server.port)).unwrap());
    config.trust = TrustPolicy {
        use_native_roots: false,
        ..TrustPolicy::insecure()
    };
    let data = payload(4096);

    let report = TunnelSession::new(config, Arc::new(EchoTool { payload: data }))
        .run()
        .await
        .unwrap();
    assert_eq!(report.bridge.totals.to_tunnel, 4096);
    drop(server);
}

#[tokio::test]
async fn full_session_over_tls_is_done() {
    let server = tls_server(SWITCHED).await;
    let mut config =
        quick_config(Url::parse(&format!("https://localhost:{}/flamenco", server.port)).unwrap());
    config.trust = trusting(&server.certificate);
    let data = payload(64 * 1024 + 123);
    let mut session = TunnelSession::new(config, Arc::new(EchoTool { payload: data }));

    let report = session.run().await.unwrap();
    assert_eq!(session.state(), SessionState::Done);
    assert!(report.tool.status.success());
    assert_eq!(report.bridge.totals.to_tunnel, 64 * 1024 + 123);
    assert_eq!(
        report.bridge.totals.from_tunnel,
        (GREETING.len() + 64 * 1024 + 123) as u64
    );

    let echoed = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("tunnel was not closed after the session")
        .unwrap();
    assert_eq!(echoed, Some(64 * 1024 + 123));
}

#[tokio::test]
async fn full_session_over_plain_http_is_done() {
    let (url, server) = plain_server(SWITCHED).await;
    let mut session = TunnelSession::new(
        quick_config(url),
        Arc::new(EchoTool {
            payload: payload(300 * 1024),
        }),
    );

    let report = session.run().await.unwrap();
    assert_eq!(session.state(), SessionState::Done);
    assert!(report.remote_addr.ip().is_loopback());
    assert_eq!(server.await.unwrap(), 300 * 1024);
}

#[tokio::test]
async fn failing_tool_reports_trimmed_stderr() {
    let (url, _server) = plain_server(SWITCHED).await;
    let runner = ProcessToolRunner::new(ToolConfig::new(
        "sh",
        vec![
            "-c".to_string(),
            "echo 'connection refused' >&2; exit 1".to_string(),
        ],
    ));
    let mut session = TunnelSession::new(quick_config(url), Arc::new(runner));

    let err = session.run().await.unwrap_err();
    match err {
        SessionError::Tool(ToolError::Execution { stderr, status, .. }) => {
            assert_eq!(stderr, "connection refused");
            assert_eq!(status.code(), Some(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn tool_that_never_connects_fails_the_session() {
    let (url, _server) = plain_server(SWITCHED).await;
    let runner = ProcessToolRunner::new(ToolConfig::new("true", Vec::new()));
    let mut session = TunnelSession::new(quick_config(url), Arc::new(runner));

    let err = session.run().await.unwrap_err();
    assert!(
        matches!(err, SessionError::Bridge(BridgeError::NoPeer)),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn missing_tool_fails_without_waiting_for_a_peer() {
    let (url, _server) = plain_server(SWITCHED).await;
    let mut config = quick_config(url);
    config.bridge.drain_timeout = Duration::from_secs(5);
    let runner = ProcessToolRunner::new(ToolConfig::new(
        "/nonexistent/rsync-tunnel-test-binary",
        Vec::new(),
    ));

    let started = Instant::now();
    let err = run_session(config, Arc::new(runner), Arc::new(NoCredentials))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Tool(ToolError::Spawn { .. })),
        "unexpected error: {err}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "spawn failure took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn releasing_twice_only_warns() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let response =
        crate::handshake::UpgradeResponse::parse(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
            .unwrap();
    let mut tunnel =
        TunnelConnection::new(TunnelStream::Plain(client.unwrap()), Vec::new(), addr, response);

    assert!(release(&mut tunnel).await);
    assert!(!release(&mut tunnel).await);
    assert!(tunnel.is_closed());
}
