//! Subject common-name helpers.
//!
//! The scheduler identifies the caller by the common name of its client
//! certificate, so both ends need the same naming rules.

use x509_parser::prelude::*;

use crate::config::TlsError;

/// Common name of the shared pre-enrolment identity.
pub const NOBODY_COMMON_NAME: &str = "/users/nobody";

/// Common name of the device certificate issued to `node_id_hex`.
pub fn device_common_name(node_id_hex: &str) -> String {
    format!("/users/{}", node_id_hex)
}

/// First subject common name of a DER-encoded certificate.
pub fn common_name_from_der(der: &[u8]) -> Result<Option<String>, TlsError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| TlsError::Parse(e.to_string()))?;
    first_common_name(&cert)
}

/// First subject common name of the first certificate in a PEM bundle.
pub fn common_name_from_pem(pem: &[u8]) -> Result<Option<String>, TlsError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| TlsError::Pem(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| TlsError::Parse(e.to_string()))?;
    first_common_name(&cert)
}

fn first_common_name(cert: &X509Certificate<'_>) -> Result<Option<String>, TlsError> {
    match cert.subject().iter_common_name().next() {
        Some(attr) => attr
            .as_str()
            .map(|s| Some(s.to_string()))
            .map_err(|e| TlsError::Parse(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::DevCa;

    #[test]
    fn test_device_common_name() {
        assert_eq!(device_common_name("02ab"), "/users/02ab");
    }

    #[test]
    fn test_common_name_from_pem_and_der_agree() {
        let ca = DevCa::generate("nodesign test CA").unwrap();
        let client = ca.issue_client("/users/02ab").unwrap();
        let pem = client.cert_pem().unwrap();

        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem).unwrap();
        assert_eq!(
            common_name_from_pem(pem).unwrap().as_deref(),
            Some("/users/02ab")
        );
        assert_eq!(
            common_name_from_der(&parsed.contents).unwrap().as_deref(),
            Some("/users/02ab")
        );
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(common_name_from_der(b"garbage").is_err());
        assert!(common_name_from_pem(b"garbage").is_err());
    }
}
