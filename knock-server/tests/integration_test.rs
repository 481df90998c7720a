//! End-to-end tests: real client handshakes, real gates, real backends,
//! all on 127.0.0.1

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use knock_client::AuthSender;
use knock_core::{AuthCodec, ForwardRule, GlobalPolicy, HandshakeRequest, RuleId, Shutdown, TokenPattern};
use knock_server::{Server, ServerError, ServerSettings};

const SECRET: &[u8] = b"integration-secret";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ============================================================================
// Helpers
// ============================================================================

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn rule(token: &str) -> ForwardRule {
    let mut rule = ForwardRule::new(
        SocketAddr::new(LOCALHOST, free_port()),
        echo_backend(),
    );
    rule.allow_tokens = vec![TokenPattern::new(token).unwrap()];
    rule
}

fn settings(rules: Vec<ForwardRule>) -> ServerSettings {
    ServerSettings {
        auth_addr: "127.0.0.1:0".parse().unwrap(),
        auth_key: SECRET.to_vec(),
        rules,
        global: GlobalPolicy::default(),
    }
}

fn knock(server: &Server, token: &str, port: u16) {
    let codec = Arc::new(AuthCodec::new(SECRET).unwrap());
    let sender = AuthSender::new(
        server.auth_addr().to_string(),
        codec,
        token,
        port,
        Arc::new(knock_client::Metrics::new()),
    );
    sender.send_once().unwrap();
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(payload).unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

/// Connection is closed by the gate without any data
fn assert_closed(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("expected close, got {:?}", other),
    }
}

fn stop(mut server: Server, shutdown: &Shutdown) {
    shutdown.trigger();
    server.join();
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_knock_proxy_expire_and_delayed_drop() {
    let mut config = rule("svc-*");
    config.grant_lifetime = Duration::from_secs(1);
    config.drop_delay = Duration::from_millis(300);
    let port = config.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![config]), &shutdown).unwrap();
    let gate = server.gate_addr(RuleId(0)).unwrap();

    // Before the handshake: held for the drop delay, then closed
    let start = Instant::now();
    let mut early = TcpStream::connect(gate).unwrap();
    assert_closed(&mut early);
    assert!(start.elapsed() >= Duration::from_millis(250));

    knock(&server, "svc-web", port);
    assert!(wait_until(|| server.store().is_authorized(RuleId(0), LOCALHOST)));

    let mut proxied = TcpStream::connect(gate).unwrap();
    echo_roundtrip(&mut proxied, b"through the gate");

    // After expiry new connections are refused, the open one keeps working
    assert!(wait_until(|| !server.store().is_authorized(RuleId(0), LOCALHOST)));
    let mut late = TcpStream::connect(gate).unwrap();
    assert_closed(&mut late);
    echo_roundtrip(&mut proxied, b"still open");

    let metrics = server.metrics();
    assert_eq!(metrics.handshakes_accepted_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.connections_admitted_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.connections_dropped_total.load(Ordering::Relaxed), 2);

    drop(proxied);
    stop(server, &shutdown);
}

#[test]
fn test_grant_is_per_rule() {
    let first = rule("tok");
    let second = rule("tok");
    let port = first.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![first, second]), &shutdown).unwrap();

    knock(&server, "tok", port);
    assert!(wait_until(|| server.store().is_authorized(RuleId(0), LOCALHOST)));
    assert!(!server.store().is_authorized(RuleId(1), LOCALHOST));

    let mut other = TcpStream::connect(server.gate_addr(RuleId(1)).unwrap()).unwrap();
    assert_closed(&mut other);

    stop(server, &shutdown);
}

#[test]
fn test_wrong_token_not_granted() {
    let config = rule("right");
    let port = config.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![config]), &shutdown).unwrap();

    knock(&server, "wrong", port);
    let metrics = Arc::clone(server.metrics());
    assert!(wait_until(|| metrics.handshakes_rejected_total.load(Ordering::Relaxed) == 1));
    assert!(!server.store().is_authorized(RuleId(0), LOCALHOST));

    stop(server, &shutdown);
}

#[test]
fn test_max_connections_limit() {
    let mut config = rule("tok");
    config.allow_ips = vec!["127.0.0.1".parse().unwrap()];
    config.max_connections = Some(1);

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![config]), &shutdown).unwrap();
    let gate = server.gate_addr(RuleId(0)).unwrap();
    let metrics = Arc::clone(server.metrics());

    let mut first = TcpStream::connect(gate).unwrap();
    echo_roundtrip(&mut first, b"one");

    let mut second = TcpStream::connect(gate).unwrap();
    assert_closed(&mut second);
    assert_eq!(metrics.connections_limited_total.load(Ordering::Relaxed), 1);

    // Capacity returns once the first pair is torn down
    drop(first);
    assert!(wait_until(|| metrics.active_connections.load(Ordering::Relaxed) == 0));
    let mut third = TcpStream::connect(gate).unwrap();
    echo_roundtrip(&mut third, b"three");

    drop(third);
    stop(server, &shutdown);
}

#[test]
fn test_global_deny_overrides_allow() {
    let mut config = rule("tok");
    config.allow_ips = vec!["127.0.0.1".parse().unwrap()];
    let mut settings = settings(vec![config]);
    settings.global.deny_ips = vec!["127.0.0.0/8".parse().unwrap()];

    let shutdown = Shutdown::new();
    let server = Server::start(settings, &shutdown).unwrap();

    let mut denied = TcpStream::connect(server.gate_addr(RuleId(0)).unwrap()).unwrap();
    assert_closed(&mut denied);
    assert_eq!(server.metrics().connections_dropped_total.load(Ordering::Relaxed), 1);

    stop(server, &shutdown);
}

#[test]
fn test_replayed_datagram_rejected() {
    let config = rule("tok");
    let port = config.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![config]), &shutdown).unwrap();
    let metrics = Arc::clone(server.metrics());

    let codec = AuthCodec::new(SECRET).unwrap();
    let datagram = codec.seal_request(&mut HandshakeRequest::new("tok", port)).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(&datagram, server.auth_addr()).unwrap();
    assert!(wait_until(|| metrics.handshakes_accepted_total.load(Ordering::Relaxed) == 1));

    socket.send_to(&datagram, server.auth_addr()).unwrap();
    assert!(wait_until(|| metrics.replays_detected_total.load(Ordering::Relaxed) == 1));
    assert_eq!(metrics.handshakes_accepted_total.load(Ordering::Relaxed), 1);

    stop(server, &shutdown);
}

#[test]
fn test_garbage_datagram_does_not_stop_listener() {
    let config = rule("tok");
    let port = config.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![config]), &shutdown).unwrap();
    let metrics = Arc::clone(server.metrics());

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(b"definitely not a handshake", server.auth_addr()).unwrap();
    assert!(wait_until(|| metrics.decrypt_failures_total.load(Ordering::Relaxed) == 1));

    knock(&server, "tok", port);
    assert!(wait_until(|| server.store().is_authorized(RuleId(0), LOCALHOST)));

    stop(server, &shutdown);
}

#[test]
fn test_gate_bind_failure_isolated() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut broken = rule("tok");
    broken.bind_addr = occupied.local_addr().unwrap();
    let healthy = rule("tok");
    let port = healthy.port();

    let shutdown = Shutdown::new();
    let server = Server::start(settings(vec![broken, healthy]), &shutdown).unwrap();

    assert_eq!(server.gate_errors().len(), 1);
    assert_eq!(server.gate_errors()[0].0, RuleId(0));
    assert!(matches!(server.gate_errors()[0].1, ServerError::GateBind { .. }));
    assert!(server.gate_addr(RuleId(0)).is_none());

    knock(&server, "tok", port);
    assert!(wait_until(|| server.store().is_authorized(RuleId(1), LOCALHOST)));
    let mut stream = TcpStream::connect(server.gate_addr(RuleId(1)).unwrap()).unwrap();
    echo_roundtrip(&mut stream, b"healthy rule");

    drop(stream);
    stop(server, &shutdown);
}

#[test]
fn test_auth_bind_failure_is_fatal() {
    let occupied = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut settings = settings(vec![rule("tok")]);
    settings.auth_addr = occupied.local_addr().unwrap();

    let shutdown = Shutdown::new();
    match Server::start(settings, &shutdown) {
        Err(ServerError::AuthBind { .. }) => {}
        other => panic!("expected auth bind error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_shutdown_drains_open_connections() {
    let mut config = rule("tok");
    config.allow_ips = vec!["127.0.0.1".parse().unwrap()];

    let shutdown = Shutdown::new();
    let mut server = Server::start(settings(vec![config]), &shutdown).unwrap();
    let gate = server.gate_addr(RuleId(0)).unwrap();

    let mut open = TcpStream::connect(gate).unwrap();
    echo_roundtrip(&mut open, b"before");

    shutdown.trigger();
    assert!(wait_until(|| TcpStream::connect(gate).is_err()));
    echo_roundtrip(&mut open, b"after shutdown");

    let joiner = thread::spawn(move || server.join());
    thread::sleep(Duration::from_millis(100));
    assert!(!joiner.is_finished());

    drop(open);
    joiner.join().unwrap();
}
