use crate::error::error_response;
use crate::supervisor::{CreateRequest, Supervisor};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Version information for the supervisor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted create form body
const MAX_FORM_BYTES: usize = 16 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// HTTP control plane: create, inspect, delete and list instances
pub struct ControlServer {
    bind_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    secret: Arc<String>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
        secret: String,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            tls_acceptor: None,
            secret: Arc::new(secret),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Control plane listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let secret = Arc::clone(&self.secret);

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_control_connection(tls_stream, supervisor, secret).await {
                                                debug!(addr = %addr, error = %e, "Control TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "Control TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_control_connection(stream, supervisor, secret).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control plane shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection<S>(
    stream: S,
    supervisor: Arc<Supervisor>,
    secret: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = Arc::clone(&supervisor);
        let secret = Arc::clone(&secret);
        async move { handle_control_request(req, supervisor, secret).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

/// Secret-protected resources
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// `/{secret}/`
    Collection,
    /// `/{secret}/{name}`
    Instance(String),
}

/// Match `path` against the secret prefix; `None` means not found
fn route(path: &str, secret: &str) -> Option<Route> {
    let rest = path.strip_prefix('/')?;
    let (head, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if head != secret {
        return None;
    }

    let tail = tail.trim_end_matches('/');
    if tail.is_empty() {
        return Some(Route::Collection);
    }
    if tail.contains('/') {
        return None;
    }

    let name = urlencoding::decode(tail).ok()?;
    Some(Route::Instance(name.into_owned()))
}

/// Decode an `application/x-www-form-urlencoded` body
fn parse_form(body: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(body)
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((decode_form_component(key)?, decode_form_component(value)?))
        })
        .collect()
}

fn decode_form_component(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}

async fn handle_control_request(
    req: Request<Incoming>,
    supervisor: Arc<Supervisor>,
    secret: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control request");

    let response = match (&method, path.as_str()) {
        // Liveness probe (no secret required)
        (&Method::GET, "/ping") => response(StatusCode::OK, "pong"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (_, "/ping") | (_, "/version") => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        _ => match route(&path, &secret) {
            None => {
                warn!(%method, "Control request outside the secret prefix");
                response(StatusCode::NOT_FOUND, "not found")
            }
            Some(Route::Collection) => match method {
                Method::POST => handle_create(req, &supervisor).await,
                Method::GET => handle_list(&supervisor),
                _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            },
            Some(Route::Instance(name)) => match method {
                Method::GET => handle_inspect(&name, &supervisor),
                Method::DELETE => handle_delete(&name, &supervisor).await,
                _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            },
        },
    };

    Ok(response)
}

async fn handle_create(req: Request<Incoming>, supervisor: &Supervisor) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read create request body");
            return response(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    let mut form = parse_form(&body);
    let request = CreateRequest {
        name: form.remove("name").unwrap_or_default(),
        method: form.remove("method"),
        plugin: form.remove("plugin"),
    };

    match supervisor.create(request).await {
        Ok(instance) => {
            let body = serde_json::json!({
                "name": instance.name,
                "port": instance.port,
            });
            json_response(StatusCode::CREATED, body.to_string())
        }
        Err(e) => {
            debug!(error = %e, "Create rejected");
            error_response(&e)
        }
    }
}

fn handle_inspect(name: &str, supervisor: &Supervisor) -> Response<Full<Bytes>> {
    match supervisor.inspect(name) {
        Ok(connect_url) => {
            let body = serde_json::json!({ "connect_url": connect_url });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(e) => {
            debug!(name, error = %e, "Inspect failed");
            error_response(&e)
        }
    }
}

async fn handle_delete(name: &str, supervisor: &Supervisor) -> Response<Full<Bytes>> {
    match supervisor.delete(name).await {
        Ok(()) => response(StatusCode::OK, "ok"),
        Err(e) => {
            debug!(name, error = %e, "Delete failed");
            error_response(&e)
        }
    }
}

fn handle_list(supervisor: &Supervisor) -> Response<Full<Bytes>> {
    let instances = supervisor.list();
    let body = serde_json::json!({
        "count": instances.len(),
        "free_ports": supervisor.free_ports(),
        "instances": instances,
    });
    json_response(StatusCode::OK, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_matches_secret_prefix() {
        assert_eq!(route("/s3cret/", "s3cret"), Some(Route::Collection));
        assert_eq!(route("/s3cret", "s3cret"), Some(Route::Collection));
        assert_eq!(
            route("/s3cret/alice", "s3cret"),
            Some(Route::Instance("alice".to_string()))
        );
        assert_eq!(
            route("/s3cret/alice/", "s3cret"),
            Some(Route::Instance("alice".to_string()))
        );
    }

    #[test]
    fn test_route_rejects_wrong_secret() {
        assert_eq!(route("/wrong/", "s3cret"), None);
        assert_eq!(route("/wrong/alice", "s3cret"), None);
        assert_eq!(route("/", "s3cret"), None);
        assert_eq!(route("/s3cretx/alice", "s3cret"), None);
    }

    #[test]
    fn test_route_decodes_name_and_rejects_nesting() {
        assert_eq!(
            route("/s3cret/user%40example.com", "s3cret"),
            Some(Route::Instance("user@example.com".to_string()))
        );
        assert_eq!(route("/s3cret/a/b", "s3cret"), None);
    }

    #[test]
    fn test_parse_form() {
        let form = parse_form(b"name=alice&method=chacha20-ietf-poly1305&plugin=v2ray");
        assert_eq!(form.get("name").unwrap(), "alice");
        assert_eq!(form.get("method").unwrap(), "chacha20-ietf-poly1305");
        assert_eq!(form.get("plugin").unwrap(), "v2ray");
    }

    #[test]
    fn test_parse_form_decoding() {
        let form = parse_form(b"name=John+Doe%21&empty=&flag&&method=aes-256-gcm");
        assert_eq!(form.get("name").unwrap(), "John Doe!");
        assert_eq!(form.get("empty").unwrap(), "");
        assert_eq!(form.get("flag").unwrap(), "");
        assert_eq!(form.get("method").unwrap(), "aes-256-gcm");
        assert!(!form.contains_key(""));
    }

    #[test]
    fn test_parse_form_empty() {
        assert!(parse_form(b"").is_empty());
    }
}
