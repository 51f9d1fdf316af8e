//! TCP transport carrying framed envelopes, optionally over mTLS.

use crate::ca::{CaError, IssuedCert};
use crate::framing::{EnvelopeCodec, FrameError};
use futures::{SinkExt, StreamExt};
use meshhub_core::Envelope;
use parking_lot::RwLock;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("ca error: {0}")]
    Ca(#[from] CaError),
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),
    #[error("peer revoked: {0}")]
    PeerRevoked(String),
}

/// A live outbound send handle to one peer.
#[derive(Clone)]
struct Connection {
    tx: mpsc::Sender<Envelope>,
}

/// Event surfaced to the caller as envelopes arrive from any peer.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(String),
    Disconnected(String),
    Envelope(Envelope),
}

type RevocationCheckFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Manages inbound/outbound TCP connections, each carrying length-prefixed
/// JSON envelopes, with optional mTLS for confidentiality and device
/// identity binding.
pub struct Transport {
    listen_addr: SocketAddr,
    connections: RwLock<HashMap<String, Connection>>,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
    max_frame_size: usize,
    pub revocation_check_fn: RwLock<Option<RevocationCheckFn>>,
}

impl Transport {
    pub fn new(listen_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            listen_addr,
            connections: RwLock::new(HashMap::new()),
            tls_acceptor: None,
            tls_connector: None,
            max_frame_size,
            revocation_check_fn: RwLock::new(None),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor, connector: TlsConnector) -> Self {
        self.tls_acceptor = Some(acceptor);
        self.tls_connector = Some(connector);
        self
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connections.read().contains_key(node_id)
    }

    pub async fn send(&self, node_id: &str, env: Envelope) -> Result<(), TransportError> {
        let conn = self
            .connections
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotConnected(node_id.to_string()))?;
        conn.tx.send(env).await.map_err(|_| TransportError::PeerNotConnected(node_id.to_string()))
    }

    pub async fn broadcast(&self, env: Envelope) {
        let conns: Vec<_> = self.connections.read().values().cloned().collect();
        for conn in conns {
            let _ = conn.tx.send(env.clone()).await;
        }
    }

    /// Accept loop: binds `listen_addr` and spawns a handler per inbound
    /// connection. Runs until cancelled.
    pub async fn run_listener(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "mesh transport listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_inbound(stream, peer_addr, events).await {
                    warn!(peer = %peer_addr, error = %e, "inbound connection ended");
                }
            });
        }
    }

    async fn handle_inbound(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(acceptor) = &self.tls_acceptor {
            let tls_stream = acceptor.accept(stream).await.map_err(|e| TransportError::Tls(e.to_string()))?;
            // Node identity for an mTLS-authenticated inbound peer is
            // established by the first envelope's `source` field, not by
            // parsing the certificate; the handshake having succeeded at
            // all already proves the peer holds a cert signed by our CA.
            self.run_connection(peer_addr.to_string(), tls_stream, events).await
        } else {
            self.run_connection(peer_addr.to_string(), stream, events).await
        }
    }

    pub async fn connect(self: &Arc<Self>, node_id: &str, addr: SocketAddr, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        if let Some(connector) = &self.tls_connector {
            let server_name = ServerName::try_from(node_id.to_string()).map_err(|e| TransportError::Tls(e.to_string()))?;
            let tls_stream = connector.connect(server_name, stream).await.map_err(|e| TransportError::Tls(e.to_string()))?;
            self.clone().run_connection(node_id.to_string(), tls_stream, events).await
        } else {
            self.clone().run_connection(node_id.to_string(), stream, events).await
        }
    }

    async fn run_connection<S>(self: Arc<Self>, node_id: String, stream: S, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some(check) = self.revocation_check_fn.read().as_ref() {
            if check(&node_id) {
                return Err(TransportError::PeerRevoked(node_id));
            }
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, EnvelopeCodec::with_max_frame_size(self.max_frame_size));
        let mut writer = FramedWrite::new(write_half, EnvelopeCodec::with_max_frame_size(self.max_frame_size));

        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        let mut current_id = node_id;
        self.connections.write().insert(current_id.clone(), Connection { tx });
        let _ = events.send(TransportEvent::Connected(current_id.clone())).await;

        let write_task = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if writer.send(env).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(env) => {
                    // Inbound connections are keyed by socket address until
                    // the first envelope reveals the device's real node id;
                    // rekey and re-check revocation before this (or any
                    // later) envelope reaches the dispatcher.
                    if env.source != current_id {
                        if let Some(check) = self.revocation_check_fn.read().as_ref() {
                            if check(&env.source) {
                                warn!(peer = %env.source, "dropping connection from revoked device");
                                break;
                            }
                        }
                        let mut conns = self.connections.write();
                        if let Some(conn) = conns.remove(&current_id) {
                            conns.insert(env.source.clone(), conn);
                        }
                        drop(conns);
                        current_id = env.source.clone();
                    }
                    if events.send(TransportEvent::Envelope(env)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(peer = %current_id, error = %e, "frame decode error, closing");
                    break;
                }
            }
        }

        self.connections.write().remove(&current_id);
        write_task.abort();
        let _ = events.send(TransportEvent::Disconnected(current_id)).await;
        Ok(())
    }
}

pub fn issued_cert_to_pems(cert: &IssuedCert) -> (String, String) {
    (cert.cert_pem.clone(), cert.key_pem.clone())
}


fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(e.to_string()))
}

fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .ok_or_else(|| TransportError::Tls("no private key found in PEM".into()))
}

/// Builds a mutual-TLS acceptor/connector pair: both sides present a leaf
/// cert issued by `root_pem` and require the peer to present one too.
pub fn build_mtls(root_pem: &str, cert_pem: &str, key_pem: &str) -> Result<(TlsAcceptor, TlsConnector), TransportError> {
    let root_certs = load_certs(root_pem)?;
    let mut roots = RootCertStore::empty();
    for cert in &root_certs {
        roots.add(cert.clone()).map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    let roots = Arc::new(roots);

    let leaf_certs = load_certs(cert_pem)?;
    let leaf_key = load_key(key_pem)?;

    let client_verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(leaf_certs.clone(), leaf_key.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let client_config = ClientConfig::builder()
        .with_root_certificates((*roots).clone())
        .with_client_auth_cert(leaf_certs, leaf_key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok((TlsAcceptor::from(Arc::new(server_config)), TlsConnector::from(Arc::new(client_config))))
}
