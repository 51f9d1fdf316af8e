//! A minimal local certificate authority for mesh mTLS.
//!
//! Issues one self-signed EC P-256 root and per-device leaf certificates
//! signed by that root. Device identity is carried in the certificate's
//! common name (the node id) rather than DNS SAN — hostname verification is
//! intentionally disabled in `transport`, since node ids are not hostnames.

use parking_lot::RwLock;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair as RcgenKeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaError>;

/// PEM-encoded certificate + private key pair for one identity.
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl IssuedCert {
    pub fn certificate_der(&self) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = std::io::Cursor::new(self.cert_pem.as_bytes());
        let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>> {
        let mut reader = std::io::Cursor::new(self.key_pem.as_bytes());
        let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in pem"))??;
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.secret_pkcs8_der().to_vec())))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RevocationState {
    #[serde(default)]
    revoked: HashSet<String>,
    #[serde(default)]
    issued: HashSet<String>,
}

/// One entry in [`MeshCa::list_device_certs`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCertEntry {
    pub node_id: String,
    pub revoked: bool,
}

/// Local CA: one root keypair plus an issuance/revocation ledger persisted
/// to disk.
pub struct MeshCa {
    root_cert_pem: String,
    root_issuer_key: RcgenKeyPair,
    root_cert: Certificate,
    revocation_path: PathBuf,
    revoked: RwLock<HashSet<String>>,
    issued: RwLock<HashSet<String>>,
}

impl MeshCa {
    /// Load an existing root from `root_cert_path`/`root_key_path`, or
    /// generate a fresh one and write it there.
    pub fn load_or_create(root_cert_path: &std::path::Path, root_key_path: &std::path::Path, revocation_path: impl Into<PathBuf>) -> Result<Self> {
        let revocation_path = revocation_path.into();
        let state = if revocation_path.exists() {
            let raw = fs::read_to_string(&revocation_path)?;
            serde_json::from_str::<RevocationState>(&raw)?
        } else {
            RevocationState::default()
        };

        if root_cert_path.exists() && root_key_path.exists() {
            let cert_pem = fs::read_to_string(root_cert_path)?;
            let key_pem = fs::read_to_string(root_key_path)?;
            let key_pair = RcgenKeyPair::from_pem(&key_pem)?;
            let root_cert = root_params().self_signed(&key_pair)?;
            let _ = cert_pem;
            return Ok(Self {
                root_cert_pem: fs::read_to_string(root_cert_path)?,
                root_issuer_key: key_pair,
                root_cert,
                revocation_path,
                revoked: RwLock::new(state.revoked),
                issued: RwLock::new(state.issued),
            });
        }

        let key_pair = RcgenKeyPair::generate()?;
        let cert = root_params().self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        if let Some(parent) = root_cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(root_cert_path, &cert_pem)?;
        fs::write(root_key_path, &key_pem)?;

        Ok(Self {
            root_cert_pem: cert_pem,
            root_issuer_key: key_pair,
            root_cert: cert,
            revocation_path,
            revoked: RwLock::new(state.revoked),
            issued: RwLock::new(state.issued),
        })
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// Issue a leaf certificate for `node_id`, valid immediately.
    pub fn issue(&self, node_id: &str) -> Result<IssuedCert> {
        let mut params = CertificateParams::new(vec![])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        params.distinguished_name = dn;

        let leaf_key = RcgenKeyPair::generate()?;
        let cert = params.signed_by(&leaf_key, &self.root_cert, &self.root_issuer_key)?;

        self.issued.write().insert(node_id.to_string());
        self.persist_ledger()?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    pub fn is_revoked(&self, node_id: &str) -> bool {
        self.revoked.read().contains(node_id)
    }

    pub fn revoke(&self, node_id: &str) -> Result<()> {
        self.revoked.write().insert(node_id.to_string());
        self.persist_ledger()
    }

    /// Every device ever issued a certificate by this CA, each marked
    /// whether it's currently revoked.
    pub fn list_device_certs(&self) -> Vec<DeviceCertEntry> {
        let revoked = self.revoked.read();
        let mut entries: Vec<_> = self
            .issued
            .read()
            .iter()
            .map(|node_id| DeviceCertEntry { node_id: node_id.clone(), revoked: revoked.contains(node_id) })
            .collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }

    fn persist_ledger(&self) -> Result<()> {
        let state = RevocationState { revoked: self.revoked.read().clone(), issued: self.issued.read().clone() };
        let body = serde_json::to_string_pretty(&state)?;
        let tmp = self.revocation_path.with_extension("tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &self.revocation_path)?;
        Ok(())
    }
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::new(vec![]).expect("empty SAN list is always valid");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "lan-mesh-hub-root");
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
}
