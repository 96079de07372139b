//! Inbound webhook through which the ICP bridge canister pushes messages.
//!
//! The canister calls `POST /message` over HTTPS with a JSON-encoded message.
//! Replies are short plain-text codes the canister matches on.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use eyre::{eyre, Result, WrapErr};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{report_rejected, Listener, MessageSink};
use crate::config::IcpConfig;
use crate::error::RelayError;
use crate::metrics;
use crate::types::{ChainId, Message};

/// Request bodies above this are rejected before parsing, after the
/// content-type check
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// How long in-flight requests get once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub const SUCCESS: &str = "success";
pub const INVALID_CONTENT_TYPE: &str = "invalid_content_type";
pub const SERVER_SIDE_ERROR: &str = "server_side_error";
pub const NOT_FOUND: &str = "not_found";

#[derive(Clone)]
struct WebhookState {
    sink: MessageSink,
}

/// Build the webhook application. Exposed for in-process testing.
pub fn webhook_router(sink: MessageSink) -> Router {
    Router::new()
        .route("/message", post(receive_message).fallback(not_found))
        .fallback(not_found)
        .with_state(WebhookState { sink })
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

fn parse_body(body: &[u8]) -> std::result::Result<Message, RelayError> {
    let message: Message =
        serde_json::from_slice(body).map_err(|e| RelayError::Parse(e.to_string()))?;
    message
        .validate()
        .map_err(|e| RelayError::Parse(e.to_string()))?;
    Ok(message)
}

async fn receive_message(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Body,
) -> (StatusCode, &'static str) {
    let chain = state.sink.chain_id();
    metrics::record_event_observed(chain.name());

    if !is_json(&headers) {
        debug!(chain = chain.name(), "Webhook request without JSON content type");
        return (StatusCode::BAD_REQUEST, INVALID_CONTENT_TYPE);
    }

    if state.sink.is_closed() {
        warn!(chain = chain.name(), "Webhook request while router intake is closed");
        return (StatusCode::BAD_REQUEST, SERVER_SIDE_ERROR);
    }

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            report_rejected(chain, "webhook", &RelayError::Parse(e.to_string()));
            return (StatusCode::BAD_REQUEST, SERVER_SIDE_ERROR);
        }
    };

    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(e) => {
            report_rejected(chain, "webhook", &e);
            return (StatusCode::BAD_REQUEST, SERVER_SIDE_ERROR);
        }
    };

    if message.src_chain_id() != chain {
        let err = RelayError::Parse(format!(
            "webhook for {} received a message from {}",
            chain,
            message.src_chain_id()
        ));
        report_rejected(chain, message.id(), &err);
        return (StatusCode::BAD_REQUEST, SERVER_SIDE_ERROR);
    }

    info!(
        message_id = message.id(),
        src_chain = message.src_chain_id().name(),
        dest_chain = message.dest_chain_id().name(),
        op_type = %message.op_type(),
        "Message received on webhook"
    );

    match state.sink.deliver(message).await {
        Ok(()) => (StatusCode::OK, SUCCESS),
        Err(_) => (StatusCode::BAD_REQUEST, SERVER_SIDE_ERROR),
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND)
}

/// Read and parse the PEM certificate chain and private key into a server
/// config. Runs at construction so bad TLS material stops startup.
fn load_tls(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .wrap_err_with(|| format!("Failed to read TLS certificate {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .wrap_err_with(|| format!("Failed to read TLS key {}", key_path.display()))?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| eyre!("Invalid TLS certificate {}: {}", cert_path.display(), e))?;
    if certs.is_empty() {
        return Err(eyre!("No certificate found in {}", cert_path.display()));
    }
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| eyre!("Invalid TLS key {}: {}", key_path.display(), e))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .wrap_err("TLS provider has no usable protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .wrap_err("TLS certificate and key do not form a usable pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// HTTPS webhook listener for the ICP bridge canister
pub struct IcpListener {
    chain: ChainId,
    addr: SocketAddr,
    tls: RustlsConfig,
}

impl IcpListener {
    pub fn new(config: &IcpConfig) -> Result<Self> {
        let tls = load_tls(&config.tls_cert_path, &config.tls_key_path)?;
        Ok(Self {
            chain: config.chain_id,
            addr: SocketAddr::from(([0, 0, 0, 0], config.listener_port)),
            tls: RustlsConfig::from_config(Arc::new(tls)),
        })
    }
}

#[async_trait]
impl Listener for IcpListener {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    async fn run(&self, sink: MessageSink, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let handle = Handle::new();
        let app = webhook_router(sink);
        let server = axum_server::bind_rustls(self.addr, self.tls.clone())
            .handle(handle.clone())
            .serve(app.into_make_service());
        tokio::pin!(server);

        info!(chain = self.chain.name(), addr = %self.addr, "ICP webhook listening on https");

        tokio::select! {
            result = &mut server => {
                result.wrap_err("ICP webhook server stopped")?;
            }
            _ = shutdown.changed() => {
                info!(chain = self.chain.name(), "Stopping ICP webhook");
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                server.await.wrap_err("ICP webhook server failed during shutdown")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const BODY: &str = r#"{
        "id": "icp-1",
        "nonce": "3",
        "op_type": 2,
        "src_chain_id": 2,
        "dest_chain_id": 1,
        "dest_address": "0x0000000000000000000000000000000000000001",
        "contract_address": "ryjl3-tyaaa-aaaaa-aaaba-cai",
        "token_id": "7"
    }"#;

    fn app() -> (Router, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (webhook_router(MessageSink::new(ChainId::Icp, tx)), rx)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn post(content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/message")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_message_is_delivered() {
        let (app, mut rx) = app();
        let (status, body) = send(app, post("application/json; charset=utf-8", BODY)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, SUCCESS);
        let message = rx.try_recv().unwrap();
        assert_eq!(message.id(), "icp-1");
        assert_eq!(message.dest_chain_id(), ChainId::Ethereum);
    }

    #[tokio::test]
    async fn test_text_plain_is_rejected() {
        let (app, mut rx) = app();
        let (status, body) = send(app, post("text/plain", BODY)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, INVALID_CONTENT_TYPE);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_content_type_is_rejected() {
        let (app, _rx) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/message")
            .body(Body::from(BODY))
            .unwrap();
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, INVALID_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_malformed_body_is_server_side_error() {
        let (app, mut rx) = app();
        let (status, body) = send(app, post("application/json", "{\"id\": 1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, SERVER_SIDE_ERROR);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_source_chain_is_rejected() {
        let (app, mut rx) = app();
        let body = BODY
            .replace("\"src_chain_id\": 2", "\"src_chain_id\": 31337")
            .replace("\"dest_chain_id\": 1", "\"dest_chain_id\": 2");
        let (status, text) = send(app, post("application/json", &body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text, SERVER_SIDE_ERROR);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_intake_is_server_side_error() {
        let (app, rx) = app();
        drop(rx);
        let (status, body) = send(app, post("application/json", BODY)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, SERVER_SIDE_ERROR);
    }

    #[tokio::test]
    async fn test_get_message_is_not_found() {
        let (app, _rx) = app();
        let request = Request::builder()
            .method("GET")
            .uri("/message")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (app, _rx) = app();
        let (status, body) = send(
            app,
            Request::builder()
                .method("POST")
                .uri("/other")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_body_is_server_side_error() {
        let (app, mut rx) = app();
        let huge = format!("{{\"pad\":\"{}\"}}", "x".repeat(MAX_BODY_BYTES + 1));
        let (status, body) = send(app, post("application/json", &huge)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, SERVER_SIDE_ERROR);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_text_plain_is_invalid_content_type() {
        let (app, _rx) = app();
        let huge = "x".repeat(MAX_BODY_BYTES * 2);
        let (status, body) = send(app, post("text/plain", &huge)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, INVALID_CONTENT_TYPE);
    }

    fn icp_config(cert: &Path, key: &Path) -> IcpConfig {
        IcpConfig {
            chain_id: ChainId::Icp,
            host_url: "http://127.0.0.1:4943".to_string(),
            canister_id: "bkyz2-fmaaa-aaaaa-qaaaq-cai".to_string(),
            secret_key: "11".repeat(32),
            fetch_root_key: true,
            listener_port: 8443,
            tls_cert_path: cert.to_path_buf(),
            tls_key_path: key.to_path_buf(),
        }
    }

    #[test]
    fn test_missing_tls_files_fail_construction() {
        let dir = std::env::temp_dir().join(format!("relay-tls-missing-{}", std::process::id()));
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");

        let err = IcpListener::new(&icp_config(&cert, &key)).err().unwrap();
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn test_non_pem_tls_files_fail_construction() {
        let dir = std::env::temp_dir().join(format!("relay-tls-garbage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let err = IcpListener::new(&icp_config(&cert, &key)).err().unwrap();
        assert!(err.to_string().contains("No certificate found"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
