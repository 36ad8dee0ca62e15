//! # Identity and Trust
//!
//! This module owns everything that decides whether a remote device is trusted:
//! - The local identity string (`HOSTNAME-SUFFIX`), computed once per process
//! - The shared group code, hashed into a symmetric group key
//! - The local self-signed certificate and its key pair
//! - The locked certificate exchange (NaCl secretbox sealed with the group key)
//!
//! A peer that does not know the group code cannot produce a locked certificate
//! that [`TrustStore::open_remote_certificate`] will accept, and that is the only
//! gate standing between discovery and a pinned TLS channel.
//!
//! Algorithms in use:
//! - SHA-256 for group key derivation
//! - XSalsa20-Poly1305 (secretbox) for the certificate payload
//! - ECDSA P-256 self-signed X.509 certificates

use base64::prelude::*;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const CERTIFICATE_FILE: &str = "certificate.der";
const PRIVATE_KEY_FILE: &str = "private_key.der";

/// Errors raised while establishing trust with a peer.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("group code cannot be turned into a group key")]
    InvalidGroupKey,
    #[error("failed to open secret box: the peer uses a different group code")]
    FailedToOpenSecretBox,
    #[error("failed processing remote certificate: {0}")]
    FailedProcessingRemoteCertificate(String),
    #[error("failed to seal certificate")]
    SealFailed,
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),
    #[error("certificate storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of this node as announced to peers.
///
/// The string form is `HOSTNAME-SUFFIX`; the suffix keeps two processes on the
/// same host apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    hostname: String,
    unique_suffix: String,
}

impl Identity {
    pub fn new(hostname: impl Into<String>, unique_suffix: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            unique_suffix: unique_suffix.into(),
        }
    }

    /// The process-wide identity. Computed on first use and never changes afterwards.
    pub fn local() -> &'static Identity {
        static LOCAL: OnceLock<Identity> = OnceLock::new();
        LOCAL.get_or_init(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
            Identity::new(local_hostname(), suffix)
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn unique_suffix(&self) -> &str {
        &self.unique_suffix
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hostname, self.unique_suffix)
    }
}

pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname never writes past it.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The shared group passphrase. Never leaves this process.
#[derive(Clone)]
pub struct GroupSecret(String);

impl GroupSecret {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Hash the group code into the symmetric key used to seal certificates.
    pub fn derive_group_key(&self) -> Result<GroupKey, AuthError> {
        if self.0.trim().is_empty() {
            return Err(AuthError::InvalidGroupKey);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        Ok(GroupKey(hasher.finalize().into()))
    }
}

impl fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupSecret(<redacted>)")
    }
}

/// Symmetric key derived from the group code.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey([u8; 32]);

impl GroupKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupKey(<redacted>)")
    }
}

/// Seal a certificate for delivery: `base64(nonce || secretbox(certificate))`.
pub fn seal_certificate(certificate: &[u8], key: &GroupKey) -> Result<String, AuthError> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), certificate)
        .map_err(|_| AuthError::SealFailed)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(BASE64_STANDARD.encode(blob))
}

/// Inverse of [`seal_certificate`]. The opened payload must parse as an X.509 certificate.
pub fn open_certificate(locked: &str, key: &GroupKey) -> Result<Vec<u8>, AuthError> {
    let blob = BASE64_STANDARD
        .decode(locked.trim())
        .map_err(|e| AuthError::FailedProcessingRemoteCertificate(format!("bad base64: {}", e)))?;

    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(AuthError::FailedProcessingRemoteCertificate(format!(
            "locked certificate is only {} bytes",
            blob.len()
        )));
    }

    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let certificate = cipher
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| AuthError::FailedToOpenSecretBox)?;

    if let Err(e) = x509_parser::parse_x509_certificate(&certificate) {
        return Err(AuthError::FailedProcessingRemoteCertificate(format!(
            "payload is not a certificate: {}",
            e
        )));
    }

    Ok(certificate)
}

/// Short, human-comparable fingerprint of a DER certificate.
pub fn certificate_fingerprint(certificate_der: &[u8]) -> String {
    let digest = Sha256::digest(certificate_der);
    hex::encode(&digest[..8])
}

/// The local certificate and its private key, both DER encoded.
#[derive(Clone)]
pub struct LocalCertificate {
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
}

impl LocalCertificate {
    pub fn generate(identity: &Identity) -> Result<Self, AuthError> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| AuthError::CertificateGeneration(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(vec!["lanwarp.local".to_string()])
            .map_err(|e| AuthError::CertificateGeneration(e.to_string()))?;

        let mut distinguished_name = rcgen::DistinguishedName::new();
        distinguished_name.push(rcgen::DnType::CommonName, identity.to_string());
        params.distinguished_name = distinguished_name;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| AuthError::CertificateGeneration(e.to_string()))?;

        Ok(Self {
            certificate_der: cert.der().to_vec(),
            private_key_der: key_pair.serialize_der(),
        })
    }

    pub fn load_or_generate(dir: &Path, identity: &Identity) -> Result<Self, AuthError> {
        if dir.join(CERTIFICATE_FILE).exists() && dir.join(PRIVATE_KEY_FILE).exists() {
            Self::load(dir)
        } else {
            let certificate = Self::generate(identity)?;
            certificate.save(dir)?;
            Ok(certificate)
        }
    }

    pub fn load(dir: &Path) -> Result<Self, AuthError> {
        let certificate_der = std::fs::read(dir.join(CERTIFICATE_FILE))?;
        let private_key_der = std::fs::read(dir.join(PRIVATE_KEY_FILE))?;

        if x509_parser::parse_x509_certificate(&certificate_der).is_err() {
            return Err(AuthError::CertificateGeneration(
                "stored certificate is corrupt".to_string(),
            ));
        }

        Ok(Self {
            certificate_der,
            private_key_der,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), AuthError> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CERTIFICATE_FILE), &self.certificate_der)?;

        let key_path = dir.join(PRIVATE_KEY_FILE);
        std::fs::write(&key_path, &self.private_key_der)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&key_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&key_path, perms)?;
        }

        Ok(())
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    pub fn fingerprint(&self) -> String {
        certificate_fingerprint(&self.certificate_der)
    }
}

/// Holder of the local identity, group key and certificate.
///
/// Readers take cheap snapshots; [`TrustStore::regenerate_certificate`] swaps the
/// certificate wholesale. Callers are responsible for invalidating any peer
/// certificates pinned under the old one.
pub struct TrustStore {
    identity: Identity,
    group_key: RwLock<GroupKey>,
    certificate: RwLock<LocalCertificate>,
    storage_dir: Option<PathBuf>,
}

impl TrustStore {
    /// Build a trust store. With a storage directory the certificate is loaded from
    /// (or generated into) it; without one it lives only in memory.
    pub fn new(
        identity: Identity,
        group: &GroupSecret,
        storage_dir: Option<PathBuf>,
    ) -> Result<Self, AuthError> {
        let group_key = group.derive_group_key()?;
        let certificate = match &storage_dir {
            Some(dir) => LocalCertificate::load_or_generate(dir, &identity)?,
            None => LocalCertificate::generate(&identity)?,
        };

        info!(
            "Trust store ready for {} (certificate {})",
            identity,
            certificate.fingerprint()
        );

        Ok(Self {
            identity,
            group_key: RwLock::new(group_key),
            certificate: RwLock::new(certificate),
            storage_dir,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn certificate(&self) -> LocalCertificate {
        self.certificate.read().clone()
    }

    /// This node's certificate sealed with the group key, ready for `RequestCertificate`.
    pub fn locked_certificate(&self) -> Result<String, AuthError> {
        let certificate = self.certificate.read();
        seal_certificate(certificate.certificate_der(), &self.group_key.read())
    }

    /// Open a locked certificate delivered by a peer.
    pub fn open_remote_certificate(&self, locked: &str) -> Result<Vec<u8>, AuthError> {
        let certificate = open_certificate(locked, &self.group_key.read())?;
        debug!("Opened remote certificate {}", certificate_fingerprint(&certificate));
        Ok(certificate)
    }

    /// Replace the local certificate and key pair.
    pub fn regenerate_certificate(&self) -> Result<LocalCertificate, AuthError> {
        let certificate = LocalCertificate::generate(&self.identity)?;
        if let Some(dir) = &self.storage_dir {
            certificate.save(dir)?;
        }

        info!("Regenerated local certificate ({})", certificate.fingerprint());
        *self.certificate.write() = certificate.clone();
        Ok(certificate)
    }

    /// Switch to a new group code. The certificate is regenerated as well, so every
    /// peer has to go through the exchange again.
    pub fn set_group_secret(&self, group: &GroupSecret) -> Result<LocalCertificate, AuthError> {
        let key = group.derive_group_key()?;
        *self.group_key.write() = key;
        self.regenerate_certificate()
    }
}
