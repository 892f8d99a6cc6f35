//! On-disk layout of the development certificates used by the reference
//! scheduler.
//!
//! ```text
//! <dir>/ca.pem          CA certificate
//! <dir>/ca-key.pem      CA private key (0600)
//! <dir>/server/         scheduler identity (ca.pem, cert.pem, key.pem)
//! <dir>/nobody/         shared /users/nobody identity
//! ```

use nodesign_tls::{DevCa, TlsConfig, CA_FILE};
use std::fs;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

use crate::server::ServerError;

/// File name of the CA private key.
pub const CA_KEY_FILE: &str = "ca-key.pem";
/// Directory holding the scheduler identity.
pub const SERVER_DIR: &str = "server";
/// Directory holding the nobody identity.
pub const NOBODY_DIR: &str = "nobody";

/// CA plus the identities issued from it.
pub struct DevCerts {
    pub ca: DevCa,
    pub server: TlsConfig,
    pub nobody: TlsConfig,
}

impl DevCerts {
    /// Generate a fresh CA, a server identity valid for `hosts` and a
    /// nobody identity.
    pub fn generate(hosts: &[&str]) -> Result<Self, ServerError> {
        let ca = DevCa::generate("nodesign development CA")?;
        let server = ca.issue_server(hosts)?;
        let nobody = ca.issue_nobody()?;
        Ok(Self { ca, server, nobody })
    }

    /// Load a layout written by [`write_to_dir`](Self::write_to_dir).
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ServerError> {
        let dir = dir.as_ref();
        let cert_pem = fs::read_to_string(dir.join(CA_FILE))?;
        let key_pem = Zeroizing::new(fs::read_to_string(dir.join(CA_KEY_FILE))?);
        let ca = DevCa::from_pem(&cert_pem, &key_pem)?;

        Ok(Self {
            ca,
            server: TlsConfig::from_dir(dir.join(SERVER_DIR))?,
            nobody: TlsConfig::from_dir(dir.join(NOBODY_DIR))?,
        })
    }

    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), ServerError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        fs::write(dir.join(CA_FILE), self.ca.cert_pem())?;
        let key_path = dir.join(CA_KEY_FILE);
        fs::write(&key_path, self.ca.key_pem().as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }

        self.server.write_to_dir(dir.join(SERVER_DIR))?;
        self.nobody.write_to_dir(dir.join(NOBODY_DIR))?;
        info!("Wrote development certificates to {:?}", dir);
        Ok(())
    }
}
