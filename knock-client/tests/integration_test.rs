//! Client senders against a UDP capture socket

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use knock_client::config::{AuthEntry, ClientSettings, ServerTarget};
use knock_core::{AuthCodec, Shutdown};

const SECRET: &[u8] = b"integration-secret";

fn capture() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    (socket, addr)
}

fn settings(addr: &str, entries: Vec<AuthEntry>) -> ClientSettings {
    ClientSettings {
        servers: vec![ServerTarget {
            addr: addr.to_string(),
            key: SECRET.to_vec(),
            entries,
        }],
    }
}

fn entry(token: &str, port: u16) -> AuthEntry {
    AuthEntry {
        token: token.to_string(),
        port,
        interval: Duration::from_secs(60),
    }
}

#[test]
fn test_handshake_sent_on_start() {
    let (socket, addr) = capture();
    let shutdown = Shutdown::new();
    let mut client = knock_client::start(&settings(&addr, vec![entry("tok1", 8080)]), &shutdown).unwrap();

    let mut buf = [0u8; 4096];
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    let request = AuthCodec::new(SECRET).unwrap().open_request(&buf[..n]).unwrap();
    assert_eq!(request.token, "tok1");
    assert_eq!(request.port, 8080);
    assert_eq!(request.nonce.len(), 12);
    assert_eq!(&request.nonce[..], &buf[..12]);

    shutdown.trigger();
    client.join();
    assert_eq!(client.metrics().handshakes_sent_total.load(Ordering::Relaxed), 1);
}

#[test]
fn test_every_entry_gets_a_sender() {
    let (socket, addr) = capture();
    let shutdown = Shutdown::new();
    let entries = vec![entry("a", 1001), entry("b", 1002)];
    let mut client = knock_client::start(&settings(&addr, entries), &shutdown).unwrap();
    assert_eq!(client.task_count(), 2);

    let codec = AuthCodec::new(SECRET).unwrap();
    let mut ports = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..2 {
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        ports.push(codec.open_request(&buf[..n]).unwrap().port);
    }
    ports.sort();
    assert_eq!(ports, vec![1001, 1002]);

    shutdown.trigger();
    client.join();
}

#[test]
fn test_zero_port_entry_stops_without_sending() {
    let (socket, addr) = capture();
    socket.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let shutdown = Shutdown::new();
    let mut client = knock_client::start(&settings(&addr, vec![entry("tok", 0)]), &shutdown).unwrap();

    // The task ends by itself, no shutdown needed
    client.join();
    let mut buf = [0u8; 64];
    assert!(socket.recv_from(&mut buf).is_err());
    assert!(!shutdown.is_triggered());
}

#[test]
fn test_shutdown_stops_within_a_tick() {
    let (_socket, addr) = capture();
    let shutdown = Shutdown::new();
    let mut client = knock_client::start(&settings(&addr, vec![entry("tok", 9000)]), &shutdown).unwrap();

    let start = Instant::now();
    shutdown.trigger();
    client.join();
    assert!(start.elapsed() < Duration::from_secs(5));
}
