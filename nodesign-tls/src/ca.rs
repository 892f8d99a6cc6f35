//! Development certificate authority.
//!
//! The reference scheduler uses a [`DevCa`] to issue its own server identity,
//! the shared `/users/nobody` identity, and per-device certificates signed
//! from client CSRs. Clients use [`CertRequest`] to create the key and CSR
//! they submit during enrolment; the private key never leaves the client.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::{TlsConfig, TlsError};
use crate::x509::NOBODY_COMMON_NAME;

/// Certificate authority able to issue server and client identities.
pub struct DevCa {
    cert: Certificate,
    key: KeyPair,
}

impl DevCa {
    /// Generate a fresh self-signed CA.
    pub fn generate(common_name: &str) -> Result<Self, TlsError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = distinguished_name(common_name);

        let cert = params.self_signed(&key)?;
        info!("Generated development CA {:?}", common_name);
        Ok(Self { cert, key })
    }

    /// Load a CA from its certificate and key PEM.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        // Re-signing with the same key and subject yields an equivalent issuer.
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.key.serialize_pem())
    }

    /// Issue a server identity valid for `hosts` (DNS names or IP literals).
    pub fn issue_server(&self, hosts: &[&str]) -> Result<TlsConfig, TlsError> {
        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let mut params = CertificateParams::new(names)?;
        params.distinguished_name = distinguished_name("nodesign scheduler");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params, "server")
    }

    /// Issue a client identity with the given subject common name.
    pub fn issue_client(&self, common_name: &str) -> Result<TlsConfig, TlsError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params, common_name)
    }

    /// Issue the shared pre-enrolment identity.
    pub fn issue_nobody(&self) -> Result<TlsConfig, TlsError> {
        self.issue_client(NOBODY_COMMON_NAME)
    }

    /// Sign a client CSR, replacing its subject with `common_name`.
    ///
    /// Returns the issued certificate PEM.
    pub fn sign_request(&self, csr_pem: &str, common_name: &str) -> Result<String, TlsError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;
        csr.params.distinguished_name = distinguished_name(common_name);
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.is_ca = IsCa::NoCa;

        let cert = csr.signed_by(&self.cert, &self.key)?;
        debug!("Signed certificate request for {:?}", common_name);
        Ok(cert.pem())
    }

    fn issue(&self, params: CertificateParams, label: &str) -> Result<TlsConfig, TlsError> {
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        debug!("Issued {} certificate", label);

        let key_pem = Zeroizing::new(key.serialize_pem());
        Ok(TlsConfig::new(self.cert_pem()).with_identity(cert.pem(), key_pem.as_bytes()))
    }
}

/// A freshly generated key pair and the CSR for it.
pub struct CertRequest {
    csr_pem: String,
    key_pem: Zeroizing<String>,
}

impl CertRequest {
    /// Generate a new key and a CSR with the given subject common name.
    pub fn generate(common_name: &str) -> Result<Self, TlsError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        let csr_pem = params.serialize_request(&key)?.pem()?;
        Ok(Self {
            csr_pem,
            key_pem: Zeroizing::new(key.serialize_pem()),
        })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Combine the key with the certificate issued for it.
    pub fn into_tls_config(
        self,
        cert_pem: impl Into<Vec<u8>>,
        ca_pem: impl Into<Vec<u8>>,
    ) -> TlsConfig {
        TlsConfig::new(ca_pem).with_identity(cert_pem, self.key_pem.as_bytes())
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn
}
