//! Node bootstrap requests against a remote controller.
//!
//! The node sends the public halves of freshly generated keys and gets back
//! signed certificates. While the request is in flight the node can prove it
//! holds the bootstrap secret by answering challenges on a local port.

use anyhow::{Context, Result};
use assets::Cancellation;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.kops.k8s.io/v1alpha1";

/// Port the challenge responder listens on.
pub const CHALLENGE_PORT: u16 = 3989;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub api_version: String,
    /// Certificate name to PEM public key.
    pub certs: BTreeMap<String, String>,
    /// Keyset name to the primary id the node already trusts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keypair_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub include_node_config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<Challenge>,
}

/// Where and how the controller can challenge this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub endpoint: String,
    /// Hex SHA-256 of the challenge secret.
    pub secret_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    /// Certificate name to signed PEM certificate.
    #[serde(default)]
    pub certs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<String>,
}

/// Carries a bootstrap request to the controller.
pub trait BootstrapTransport: Send + Sync + fmt::Debug {
    fn query(&self, request: &BootstrapRequest) -> Result<BootstrapResponse>;
}

/// JSON over HTTPS with a bearer token.
#[derive(Debug)]
pub struct HttpTransport {
    agent: ureq::Agent,
    server: String,
    token: String,
}

impl HttpTransport {
    pub fn new(server: &str, token: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            server: server.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        }
    }
}

impl BootstrapTransport for HttpTransport {
    fn query(&self, request: &BootstrapRequest) -> Result<BootstrapResponse> {
        let url = format!("{}/bootstrap", self.server);
        log::info!("sending bootstrap request to {url}");
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send_json(request)
            .with_context(|| format!("bootstrap request to {url} failed"))?;
        response
            .body_mut()
            .read_json::<BootstrapResponse>()
            .with_context(|| format!("invalid bootstrap response from {url}"))
    }
}

/// Random hex secret for the challenge responder.
pub fn new_challenge_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Answer to a challenge nonce.
pub fn challenge_answer(nonce: &str, secret: &str) -> String {
    sha256_hex(format!("{nonce}{secret}").as_bytes())
}

/// Answers challenge nonces until stopped or dropped.
#[derive(Debug)]
pub struct ChallengeResponder {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChallengeResponder {
    pub fn start(addr: &str, secret: String, cancel: Cancellation) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("error listening on {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("error configuring challenge listener")?;
        let local_addr = listener.local_addr()?;
        log::info!("challenge responder listening on {local_addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("challenge-responder".to_string())
            .spawn(move || serve(&listener, &secret, &flag, &cancel))
            .context("error starting challenge responder")?;

        Ok(Self {
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChallengeResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(listener: &TcpListener, secret: &str, stop: &AtomicBool, cancel: &Cancellation) {
    while !stop.load(Ordering::SeqCst) && !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = answer(stream, secret) {
                    log::warn!("challenge from {peer} failed: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("challenge listener error: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn answer(stream: TcpStream, secret: &str) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut nonce = String::new();
    reader.read_line(&mut nonce)?;
    let mut stream = stream;
    writeln!(stream, "{}", challenge_answer(nonce.trim(), secret))?;
    stream.flush()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Signs nothing; echoes a canned certificate per requested name.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        pub requests: Mutex<Vec<BootstrapRequest>>,
    }

    impl BootstrapTransport for RecordingTransport {
        fn query(&self, request: &BootstrapRequest) -> Result<BootstrapResponse> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());
            Ok(BootstrapResponse {
                certs: request
                    .certs
                    .keys()
                    .map(|name| (name.clone(), format!("CERT FOR {name}")))
                    .collect(),
                node_config: None,
            })
        }
    }

    #[test]
    fn test_request_json_shape() {
        let mut request = BootstrapRequest {
            api_version: BOOTSTRAP_API_VERSION.to_string(),
            include_node_config: true,
            ..Default::default()
        };
        request.certs.insert("kubelet".into(), "PUBLIC".into());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["apiVersion"], BOOTSTRAP_API_VERSION);
        assert_eq!(json["certs"]["kubelet"], "PUBLIC");
        assert_eq!(json["includeNodeConfig"], true);
        assert!(json.get("keypairIds").is_none());
        assert!(json.get("challenge").is_none());
    }

    #[test]
    fn test_recording_transport() {
        let transport = RecordingTransport::default();
        let mut request = BootstrapRequest::default();
        request.certs.insert("kube-proxy".into(), "PUBLIC".into());
        let response = transport.query(&request).unwrap();
        assert_eq!(response.certs["kube-proxy"], "CERT FOR kube-proxy");
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_challenge_responder_answers_nonce() {
        let secret = new_challenge_secret();
        assert_eq!(secret.len(), 64);
        let mut responder =
            ChallengeResponder::start("127.0.0.1:0", secret.clone(), Cancellation::new()).unwrap();

        let mut stream = TcpStream::connect(responder.local_addr()).unwrap();
        writeln!(stream, "nonce-123").unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        assert_eq!(line.trim(), challenge_answer("nonce-123", &secret));

        responder.stop();
    }
}
