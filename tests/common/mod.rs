//! Shared helpers for the integration tests

#![allow(dead_code)]

use portwarden::config::Config;
use portwarden::state::{self, Snapshot};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Backend stand-in that ignores its arguments and stays up
pub const SLEEPING_BACKEND: &str = "exec sleep 60";

/// Write an executable shell script standing in for `ssserver`
pub fn fake_backend(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config pointing the `ssserver` backend at `program`, with `extra` appended
pub fn config(dir: &Path, program: &Path, extra: &str) -> Config {
    Config::parse(&format!(
        r#"
[server]
bind = "127.0.0.1:0"
secret = "s3cret"
hostname = "vpn.example.com"
state_path = "{state}"

[backends.ssserver]
program = "{program}"

{extra}
"#,
        state = state_path(dir).display(),
        program = program.display(),
    ))
    .unwrap()
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

pub fn write_snapshot(dir: &Path, snapshot: &Snapshot) {
    state::save(&state_path(dir), snapshot).unwrap();
}

/// Parsed HTTP/1.1 response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Send one request with `Connection: close` and read the whole response
pub async fn http_request(
    addr: std::net::SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        method, path, addr
    );
    if let Some(body) = body {
        request.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
        request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    } else {
        request.push_str("\r\n");
    }
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    parse_response(&raw)
}

fn parse_response(raw: &str) -> HttpResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}
