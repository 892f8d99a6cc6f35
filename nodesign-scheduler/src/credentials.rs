//! Client credentials.
//!
//! A client starts out with the shared `/users/nobody` identity, which only
//! allows registering or recovering a node. Enrolment exchanges it for
//! device credentials: a certificate whose common name names the node, and
//! the rune issued alongside it.

use nodesign_signer::{NodeId, Signer};
use nodesign_tls::{
    common_name_from_pem, device_common_name, TlsConfig, TlsError, NOBODY_COMMON_NAME,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::client::{Scheduler, SchedulerError};
use crate::runes;

/// Version tag of the serialized device credentials blob.
const BLOB_VERSION: u32 = 1;

/// Errors from handling credentials.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Credentials are not {0} credentials")]
    WrongKind(&'static str),

    #[error("Unsupported credentials version {0}")]
    Version(u32),

    #[error("Identity mismatch: certificate is for {actual:?}, expected {expected:?}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-node credentials issued by the scheduler.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    tls: TlsConfig,
    node_id: NodeId,
    rune: String,
}

impl DeviceCredentials {
    pub fn new(tls: TlsConfig, node_id: NodeId, rune: impl Into<String>) -> Self {
        Self {
            tls,
            node_id,
            rune: rune.into(),
        }
    }

    pub fn tls_config(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn rune(&self) -> &str {
        &self.rune
    }

    /// Whether a usable rune is attached. Credentials written before runes
    /// were issued carry none.
    pub fn has_rune(&self) -> bool {
        runes::is_well_formed(&self.rune)
    }

    /// Check that the certificate was issued for this node.
    pub fn verify_identity(&self) -> Result<(), CredentialsError> {
        let expected = device_common_name(&self.node_id.to_hex());
        let actual = self.tls.identity_common_name()?.unwrap_or_default();
        if actual != expected {
            return Err(CredentialsError::IdentityMismatch { expected, actual });
        }
        Ok(())
    }

    /// Serialize to a self-contained blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CredentialsError> {
        let (cert, key) = match (self.tls.cert_pem(), self.tls.key_pem()) {
            (Some(cert), Some(key)) => (cert.to_vec(), key.to_vec()),
            _ => return Err(TlsError::MissingIdentity.into()),
        };

        let mut blob = CredentialsBlob {
            version: BLOB_VERSION,
            ca: self.tls.ca_pem().to_vec(),
            cert,
            key,
            node_id: self.node_id,
            rune: self.rune.clone(),
        };
        let bytes = bincode::serialize(&blob);
        blob.key.zeroize();
        Ok(bytes?)
    }

    /// Parse a blob produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CredentialsError> {
        let blob: CredentialsBlob = bincode::deserialize(bytes)?;
        if blob.version != BLOB_VERSION {
            return Err(CredentialsError::Version(blob.version));
        }

        let tls = TlsConfig::new(blob.ca).with_identity(blob.cert, blob.key);
        let creds = Self::new(tls, blob.node_id, blob.rune);
        creds.verify_identity()?;
        Ok(creds)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let path = path.as_ref();
        let bytes = Zeroizing::new(fs::read(path).map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })?);
        debug!("Loaded device credentials from {:?}", path);
        Self::from_bytes(&bytes)
    }

    /// Write the blob to `path`, readable only by the owner on unix.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), CredentialsError> {
        let path = path.as_ref();
        let bytes = Zeroizing::new(self.to_bytes()?);
        let io_err = |source: std::io::Error| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, &bytes[..]).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        debug!("Wrote device credentials to {:?}", path);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CredentialsBlob {
    version: u32,
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
    node_id: NodeId,
    rune: String,
}

/// Identity a client presents to the scheduler.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Shared pre-enrolment identity
    Nobody(TlsConfig),
    /// Identity bound to one node
    Device(DeviceCredentials),
}

impl Credentials {
    /// Wrap nobody TLS material, checking its common name.
    pub fn nobody(tls: TlsConfig) -> Result<Self, CredentialsError> {
        let actual = tls.identity_common_name()?.unwrap_or_default();
        if actual != NOBODY_COMMON_NAME {
            return Err(CredentialsError::IdentityMismatch {
                expected: NOBODY_COMMON_NAME.to_string(),
                actual,
            });
        }
        Ok(Credentials::Nobody(tls))
    }

    pub fn tls_config(&self) -> &TlsConfig {
        match self {
            Credentials::Nobody(tls) => tls,
            Credentials::Device(device) => device.tls_config(),
        }
    }

    pub fn node_id(&self) -> Result<NodeId, CredentialsError> {
        Ok(self.ensure_device()?.node_id())
    }

    pub fn rune(&self) -> Result<&str, CredentialsError> {
        Ok(self.ensure_device()?.rune())
    }

    pub fn ensure_device(&self) -> Result<&DeviceCredentials, CredentialsError> {
        match self {
            Credentials::Device(device) => Ok(device),
            Credentials::Nobody(_) => Err(CredentialsError::WrongKind("device")),
        }
    }

    pub fn ensure_nobody(&self) -> Result<&TlsConfig, CredentialsError> {
        match self {
            Credentials::Nobody(tls) => Ok(tls),
            Credentials::Device(_) => Err(CredentialsError::WrongKind("nobody")),
        }
    }

    /// Device credentials from PEM parts, taking the node id from the
    /// certificate's common name.
    pub fn from_parts(
        ca_pem: impl Into<Vec<u8>>,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        rune: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let cert_pem = cert_pem.into();
        let actual = common_name_from_pem(&cert_pem)?.unwrap_or_default();
        let node_id = actual
            .strip_prefix("/users/")
            .and_then(|id| id.parse::<NodeId>().ok())
            .ok_or_else(|| CredentialsError::IdentityMismatch {
                expected: device_common_name("<node id>"),
                actual: actual.clone(),
            })?;

        let tls = TlsConfig::new(ca_pem).with_identity(cert_pem, key_pem);
        Ok(Credentials::Device(DeviceCredentials::new(tls, node_id, rune)))
    }

    /// Bring device credentials up to date for `signer`.
    ///
    /// Credentials that already carry a rune and a certificate for the node
    /// are returned unchanged. Otherwise the node is recovered through
    /// `scheduler`, which yields a fresh certificate and master rune.
    pub fn upgrade(
        &self,
        scheduler: &Scheduler,
        signer: &Signer,
    ) -> Result<Credentials, SchedulerError> {
        let device = self.ensure_device()?;
        if device.node_id() != signer.node_id() {
            return Err(CredentialsError::IdentityMismatch {
                expected: signer.node_id().to_hex(),
                actual: device.node_id().to_hex(),
            }
            .into());
        }

        if device.has_rune() && device.verify_identity().is_ok() {
            debug!("Credentials for {} are current", device.node_id());
            return Ok(self.clone());
        }

        info!("Upgrading credentials for node {}", device.node_id());
        scheduler.recover(signer)
    }

    /// Replace the trusted CA, keeping the identity.
    pub fn with_ca(self, ca_pem: impl Into<Vec<u8>>) -> Self {
        match self {
            Credentials::Nobody(tls) => Credentials::Nobody(tls.with_ca(ca_pem)),
            Credentials::Device(device) => Credentials::Device(DeviceCredentials {
                tls: device.tls.with_ca(ca_pem),
                ..device
            }),
        }
    }
}
