//! PEM-backed TLS material and rustls configuration builders.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::x509;

/// File name of the CA certificate inside a credentials directory.
pub const CA_FILE: &str = "ca.pem";
/// File name of the identity certificate inside a credentials directory.
pub const CERT_FILE: &str = "cert.pem";
/// File name of the identity private key inside a credentials directory.
pub const KEY_FILE: &str = "key.pem";

const CA_PATH_ENV: &str = "NODESIGN_CA_PATH";
const CERT_PATH_ENV: &str = "NODESIGN_CERT_PATH";
const KEY_PATH_ENV: &str = "NODESIGN_KEY_PATH";

/// Errors from loading TLS material or building TLS configurations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("No certificates found in PEM")]
    NoCertificates,

    #[error("No private key found in PEM")]
    NoPrivateKey,

    #[error("No identity certificate configured")]
    MissingIdentity,

    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Certificate parse error: {0}")]
    Parse(String),

    #[error("Client verifier error: {0}")]
    Verifier(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Certificate generation error: {0}")]
    Generate(#[from] rcgen::Error),
}

/// TLS material used to authenticate one end of a scheduler connection.
///
/// Holds the CA certificate the peer must chain to and, optionally, the
/// identity (certificate chain and private key) presented to the peer.
#[derive(Clone)]
pub struct TlsConfig {
    ca_pem: Vec<u8>,
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Zeroizing<Vec<u8>>>,
}

impl TlsConfig {
    /// Create a configuration that trusts `ca_pem` and presents no identity.
    pub fn new(ca_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            cert_pem: None,
            key_pem: None,
        }
    }

    /// Attach an identity certificate chain and its private key.
    pub fn with_identity(
        mut self,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        self.cert_pem = Some(cert_pem.into());
        self.key_pem = Some(Zeroizing::new(key_pem.into()));
        self
    }

    /// Replace the trusted CA certificate.
    pub fn with_ca(mut self, ca_pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pem = ca_pem.into();
        self
    }

    /// Load `ca.pem` and, if both exist, `cert.pem` and `key.pem` from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, TlsError> {
        let dir = dir.as_ref();
        let ca_pem = read_file(&dir.join(CA_FILE))?;
        let mut config = Self::new(ca_pem);

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if cert_path.exists() && key_path.exists() {
            config = config.with_identity(read_file(&cert_path)?, read_file(&key_path)?);
        }

        debug!(
            "Loaded TLS material from {:?} (identity: {})",
            dir,
            config.has_identity()
        );
        Ok(config)
    }

    /// Load TLS material from the paths in `NODESIGN_CA_PATH`,
    /// `NODESIGN_CERT_PATH` and `NODESIGN_KEY_PATH`.
    ///
    /// The CA path is required; the identity is loaded only when both the
    /// certificate and key paths are set.
    pub fn from_env() -> Result<Self, TlsError> {
        let ca_path = std::env::var_os(CA_PATH_ENV).ok_or(TlsError::MissingEnv(CA_PATH_ENV))?;
        let mut config = Self::new(read_file(Path::new(&ca_path))?);

        if let (Some(cert), Some(key)) = (
            std::env::var_os(CERT_PATH_ENV),
            std::env::var_os(KEY_PATH_ENV),
        ) {
            config =
                config.with_identity(read_file(Path::new(&cert))?, read_file(Path::new(&key))?);
        }

        Ok(config)
    }

    /// Write the material to `dir` using the same layout as [`from_dir`](Self::from_dir).
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), TlsError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| TlsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        write_file(&dir.join(CA_FILE), &self.ca_pem)?;
        if let (Some(cert), Some(key)) = (&self.cert_pem, &self.key_pem) {
            write_file(&dir.join(CERT_FILE), cert)?;
            let key_path = dir.join(KEY_FILE);
            write_file(&key_path, key)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o600);
                fs::set_permissions(&key_path, perms).map_err(|source| TlsError::Io {
                    path: key_path.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Whether an identity certificate and key are configured.
    pub fn has_identity(&self) -> bool {
        self.cert_pem.is_some() && self.key_pem.is_some()
    }

    pub fn ca_pem(&self) -> &[u8] {
        &self.ca_pem
    }

    pub fn cert_pem(&self) -> Option<&[u8]> {
        self.cert_pem.as_deref()
    }

    pub fn key_pem(&self) -> Option<&[u8]> {
        self.key_pem.as_ref().map(|k| k.as_slice())
    }

    /// Subject common name of the identity certificate, if one is configured.
    pub fn identity_common_name(&self) -> Result<Option<String>, TlsError> {
        match &self.cert_pem {
            Some(pem) => x509::common_name_from_pem(pem),
            None => Ok(None),
        }
    }

    /// Build a rustls client configuration.
    ///
    /// Only the configured CA is trusted. The identity, if present, is
    /// offered for client authentication.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let roots = self.root_store()?;
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match self.identity()? {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Build a rustls server configuration.
    ///
    /// Requires an identity. Clients must present a certificate chaining to
    /// the configured CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let (certs, key) = self.identity()?.ok_or(TlsError::MissingIdentity)?;
        let roots = Arc::new(self.root_store()?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem)? {
            roots.add(cert)?;
        }
        Ok(roots)
    }

    fn identity(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, TlsError> {
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert), Some(key)) => Ok(Some((parse_certs(cert)?, parse_key(key)?))),
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("has_identity", &self.has_identity())
            .field("key_pem", &self.key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Parse a host name or IP literal into a rustls server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or(TlsError::NoPrivateKey)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), TlsError> {
    fs::write(path, contents).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}
