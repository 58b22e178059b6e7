//! Control plane tests over real TCP connections

#![cfg(unix)]

mod common;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use common::{fake_backend, http_request, write_snapshot, SLEEPING_BACKEND};
use portwarden::control::ControlServer;
use portwarden::state::{self, Snapshot};
use portwarden::supervisor::Supervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FORM: &str = "method=chacha20-ietf-poly1305&plugin=none";

struct Node {
    dir: TempDir,
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Node {
    async fn start(min: u16, max: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_backend(dir.path(), "fake-ssserver", SLEEPING_BACKEND);
        let config = common::config(dir.path(), &program, "");
        write_snapshot(dir.path(), &Snapshot::empty(min, max));

        let supervisor = Supervisor::bootstrap(&config).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ControlServer::new(
            addr,
            Arc::clone(&supervisor),
            shutdown_rx,
            "s3cret".to_string(),
        );
        let server = tokio::spawn(server.serve(listener));

        Self {
            dir,
            addr,
            supervisor,
            shutdown_tx,
            server,
        }
    }

    async fn create(&self, name: &str) -> common::HttpResponse {
        let body = format!("name={}&{}", name, FORM);
        http_request(self.addr, "POST", "/s3cret/", Some(&body)).await
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.supervisor.stop_all().await;
    }
}

fn decode_descriptor(connect_url: &str) -> String {
    let encoded = connect_url.strip_prefix("ss://").unwrap();
    String::from_utf8(STANDARD_NO_PAD.decode(encoded).unwrap()).unwrap()
}

#[tokio::test]
async fn test_ping_and_version() {
    let node = Node::start(10000, 10003).await;

    let response = http_request(node.addr, "GET", "/ping", None).await;
    assert_eq!(response.status, 200);

    let response = http_request(node.addr, "POST", "/ping", Some("")).await;
    assert_eq!(response.status, 405);

    let response = http_request(node.addr, "GET", "/version", None).await;
    assert_eq!(response.status, 200);
    let json = response.json();
    assert_eq!(json["name"], "portwarden");
    assert!(json["version"].is_string());

    node.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_is_not_found() {
    let node = Node::start(10000, 10003).await;

    let response = http_request(node.addr, "POST", "/wrong/", Some("name=alice&method=aes-256-gcm")).await;
    assert_eq!(response.status, 404);

    let response = http_request(node.addr, "GET", "/wrong/alice", None).await;
    assert_eq!(response.status, 404);

    assert_eq!(node.supervisor.free_ports(), 3);
    node.stop().await;
}

#[tokio::test]
async fn test_create_inspect_delete() {
    let node = Node::start(10000, 10003).await;

    let response = node.create("alice").await;
    assert_eq!(response.status, 201);
    assert_eq!(response.json()["port"], 10000);

    let response = http_request(node.addr, "GET", "/s3cret/alice", None).await;
    assert_eq!(response.status, 200);
    let connect_url = response.json()["connect_url"].as_str().unwrap().to_string();

    let saved = state::load(&common::state_path(node.dir.path())).unwrap();
    let alice = &saved.state[0];
    assert_eq!(
        decode_descriptor(&connect_url),
        format!("chacha20-ietf-poly1305:{}@vpn.example.com:10000", alice.passphrase)
    );

    let response = http_request(node.addr, "DELETE", "/s3cret/alice", None).await;
    assert_eq!(response.status, 200);

    let response = http_request(node.addr, "GET", "/s3cret/alice", None).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("X-Portwarden-Error"), Some("NOT_FOUND"));

    let response = http_request(node.addr, "DELETE", "/s3cret/alice", None).await;
    assert_eq!(response.status, 404);

    let saved = state::load(&common::state_path(node.dir.path())).unwrap();
    assert!(saved.state.is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_create_errors() {
    let node = Node::start(10000, 10002).await;

    let response = http_request(node.addr, "POST", "/s3cret/", Some("method=aes-256-gcm")).await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("X-Portwarden-Error"), Some("VALIDATION"));

    let response = http_request(node.addr, "POST", "/s3cret/", Some("name=alice")).await;
    assert_eq!(response.status, 400);

    let response = http_request(
        node.addr,
        "POST",
        "/s3cret/",
        Some("name=alice&method=aes-256-gcm&plugin=kcptun"),
    )
    .await;
    assert_eq!(response.status, 400);
    assert!(response.body.contains("kcptun"));

    assert_eq!(node.create("alice").await.status, 201);

    let response = node.create("alice").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("X-Portwarden-Error"), Some("CONFLICT"));
    assert!(response.body.contains("alice"));

    assert_eq!(node.create("bob").await.status, 201);

    let response = node.create("carol").await;
    assert_eq!(response.status, 400);
    assert_eq!(
        response.header("X-Portwarden-Error"),
        Some("RESOURCE_EXHAUSTED")
    );

    node.stop().await;
}

#[tokio::test]
async fn test_unsupported_methods() {
    let node = Node::start(10000, 10003).await;

    let response = http_request(node.addr, "DELETE", "/s3cret/", None).await;
    assert_eq!(response.status, 405);

    let response = http_request(node.addr, "POST", "/s3cret/alice", Some(FORM)).await;
    assert_eq!(response.status, 405);

    node.stop().await;
}

#[tokio::test]
async fn test_list_hides_passphrases() {
    let node = Node::start(10000, 10003).await;
    node.create("alice").await;
    node.create("bob").await;

    let response = http_request(node.addr, "GET", "/s3cret/", None).await;
    assert_eq!(response.status, 200);

    let json = response.json();
    assert_eq!(json["count"], 2);
    assert_eq!(json["free_ports"], 1);
    assert_eq!(json["instances"][0]["name"], "alice");
    assert_eq!(json["instances"][0]["state"], "running");
    assert!(json["instances"][0]["pid"].is_u64());
    assert_eq!(json["instances"][1]["port"], 10001);

    let saved = state::load(&common::state_path(node.dir.path())).unwrap();
    for instance in &saved.state {
        assert!(!response.body.contains(&instance.passphrase));
    }

    node.stop().await;
}

#[tokio::test]
async fn test_form_encoded_name() {
    let node = Node::start(10000, 10003).await;

    let response = node.create("user%40example.com").await;
    assert_eq!(response.status, 201);
    assert_eq!(response.json()["name"], "user@example.com");

    let response = http_request(node.addr, "GET", "/s3cret/user%40example.com", None).await;
    assert_eq!(response.status, 200);

    node.stop().await;
}

#[tokio::test]
async fn test_concurrent_http_creates_for_last_port() {
    let node = Node::start(10000, 10001).await;
    let addr = node.addr;

    let requests: Vec<_> = (0..6)
        .map(|i| {
            tokio::spawn(async move {
                let body = format!("name=user{}&{}", i, FORM);
                http_request(addr, "POST", "/s3cret/", Some(&body)).await.status
            })
        })
        .collect();

    let mut statuses = Vec::new();
    for request in requests {
        statuses.push(request.await.unwrap());
    }

    assert_eq!(statuses.iter().filter(|s| **s == 201).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 400).count(), 5);

    node.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let node = Node::start(10000, 10003).await;
    let addr = node.addr;
    node.create("alice").await;
    let state_before = std::fs::read_to_string(common::state_path(node.dir.path())).unwrap();
    let state_file = common::state_path(node.dir.path());

    let dir = {
        let Node {
            dir,
            supervisor,
            shutdown_tx,
            server,
            ..
        } = node;
        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        supervisor.stop_all().await;
        dir
    };

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    // Shutdown keeps instances in the snapshot for the next start
    assert_eq!(std::fs::read_to_string(&state_file).unwrap(), state_before);
    drop(dir);
}
