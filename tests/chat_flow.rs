//! End-to-end tests driving a real server over loopback TCP.

use chat_relay::config::Config;
use chat_relay::framing::Framing;
use chat_relay::registry::ConnectionRegistry;
use chat_relay::{MemoryUserStore, Server};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start(framing: Framing) -> (SocketAddr, Arc<ConnectionRegistry>) {
    let config = Config {
        listen: "127.0.0.1:0".to_string(),
        framing,
        ..Config::default()
    };
    let users = Arc::new(MemoryUserStore::new(8, 1).unwrap());
    let server = Server::bind(config, users).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());
    (addr, registry)
}

/// Minimal newline-framed client.
struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut frame = serde_json::to_vec(&value).unwrap();
        frame.push(b'\n');
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn assert_silent(&mut self) {
        let pending = timeout(Duration::from_millis(200), self.lines.next_line()).await;
        assert!(pending.is_err(), "unexpected frame: {:?}", pending);
    }

    /// Register and authenticate, returning the session id.
    async fn login(&mut self, username: &str) -> String {
        self.send(json!({"type": "REGISTER", "username": username, "password": "p"}))
            .await;
        assert_eq!(self.recv().await["type"], "SUCCESS");

        self.send(json!({"type": "AUTHENTICATE", "username": username, "password": "p"}))
            .await;
        let reply = self.recv().await;
        reply["session_id"].as_str().unwrap().to_string()
    }
}

async fn wait_for_len(registry: &ConnectionRegistry, expected: usize) {
    for _ in 0..500 {
        if registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry has {} entries, expected {}", registry.len(), expected);
}

#[tokio::test]
async fn register_authenticate_broadcast() {
    let (addr, _registry) = start(Framing::Lines).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    let mut carol = Client::connect(addr).await;

    alice
        .send(json!({"type": "REGISTER", "username": "alice", "password": "p"}))
        .await;
    assert_eq!(alice.recv().await["type"], "SUCCESS");

    alice
        .send(json!({"type": "AUTHENTICATE", "username": "alice", "password": "p"}))
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply["status"], "OK");
    let session_id = reply["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    bob.login("bob").await;
    carol.login("carol").await;

    alice
        .send(json!({
            "type": "MESSAGE",
            "session_id": session_id,
            "receiver": "BROADCAST",
            "message": "hi"
        }))
        .await;

    for client in [&mut bob, &mut carol] {
        let frame = client.recv().await;
        assert_eq!(frame["type"], "MESSAGE");
        assert_eq!(frame["message"], "hi");
        assert_eq!(frame["sender"], "alice");
        assert!(frame.get("session_id").is_none());
    }
    alice.assert_silent().await;
}

#[tokio::test]
async fn duplicate_registration_fails() {
    let (addr, _registry) = start(Framing::Lines).await;
    let mut client = Client::connect(addr).await;

    client
        .send(json!({"type": "REGISTER", "username": "alice", "password": "p"}))
        .await;
    assert_eq!(client.recv().await["type"], "SUCCESS");

    client
        .send(json!({"type": "REGISTER", "username": "alice", "password": "p"}))
        .await;
    let reply = client.recv().await;
    assert_ne!(reply["type"], "SUCCESS");
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["reason"], "username already taken: alice");
}

#[tokio::test]
async fn wrong_password_returns_no_session() {
    let (addr, _registry) = start(Framing::Lines).await;
    let mut client = Client::connect(addr).await;
    client.login("alice").await;

    client
        .send(json!({"type": "AUTHENTICATE", "username": "alice", "password": "nope"}))
        .await;
    let reply = client.recv().await;
    assert!(reply.get("session_id").is_none());
    assert_eq!(reply["status"], "ERROR");
}

#[tokio::test]
async fn direct_message_and_offline_receiver() {
    let (addr, _registry) = start(Framing::Lines).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    let mut carol = Client::connect(addr).await;
    let session_id = alice.login("alice").await;
    bob.login("bob").await;
    carol.login("carol").await;

    alice
        .send(json!({
            "type": "MESSAGE",
            "session_id": session_id,
            "receiver": "bob",
            "message": "just you"
        }))
        .await;
    let frame = bob.recv().await;
    assert_eq!(frame["message"], "just you");
    assert_eq!(frame["receiver"], "bob");
    carol.assert_silent().await;

    alice
        .send(json!({
            "type": "MESSAGE",
            "session_id": session_id,
            "receiver": "dave",
            "message": "anyone?"
        }))
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["request"], "MESSAGE");
    assert_eq!(reply["reason"], "receiver is not online: dave");
    bob.assert_silent().await;
}

#[tokio::test]
async fn disconnect_removes_user_from_routing() {
    let (addr, registry) = start(Framing::Lines).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    let session_id = alice.login("alice").await;
    bob.login("bob").await;
    wait_for_len(&registry, 2).await;

    drop(bob);
    wait_for_len(&registry, 1).await;

    alice
        .send(json!({
            "type": "MESSAGE",
            "session_id": session_id,
            "receiver": "bob",
            "message": "still there?"
        }))
        .await;
    assert_eq!(alice.recv().await["reason"], "receiver is not online: bob");
}

#[tokio::test]
async fn malformed_json_does_not_affect_others() {
    let (addr, registry) = start(Framing::Lines).await;
    let mut good = Client::connect(addr).await;
    let mut noisy = Client::connect(addr).await;
    wait_for_len(&registry, 2).await;

    noisy.writer.write_all(b"}{ definitely not json\n").await.unwrap();
    noisy.writer.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();

    noisy.login("noisy").await;
    good.login("good").await;
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn concurrent_connects_and_disconnects() {
    let (addr, registry) = start(Framing::Lines).await;
    let n = 20;
    let m = 12;

    let mut clients = Vec::new();
    for _ in 0..n {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for_len(&registry, n).await;

    let leaving: Vec<_> = clients.drain(..m).collect();
    let tasks: Vec<_> = leaving
        .into_iter()
        .map(|stream| tokio::spawn(async move { drop(stream) }))
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    wait_for_len(&registry, n - m).await;
}

#[tokio::test]
async fn chunk_framing_accepts_bare_json() {
    let (addr, _registry) = start(Framing::Chunk).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(br#"{"type":"REGISTER","username":"legacy","password":"p"}"#)
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    let reply: Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(reply["type"], "SUCCESS");

    stream
        .write_all(br#"{"type":"AUTHENTICATION","username":"legacy","password":"p"}"#)
        .await
        .unwrap();
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    let reply: Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert!(reply["session_id"].as_str().is_some_and(|id| !id.is_empty()));
}
