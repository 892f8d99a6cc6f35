//! Mutual-TLS identities for nodesign clients and schedulers.
//!
//! Every connection to a scheduler is authenticated in both directions:
//! the client trusts only the configured CA, and the scheduler only accepts
//! client certificates issued by that same CA. The subject common name of a
//! client certificate carries the identity it acts for:
//!
//! - `/users/nobody` for the shared identity used before enrolment
//! - `/users/<node id hex>` for a device certificate issued to one node
//!
//! This crate holds the PEM material ([`TlsConfig`]), turns it into rustls
//! configurations, and provides a small development certificate authority
//! ([`DevCa`]) used by the reference scheduler and by tests.

pub mod ca;
pub mod config;
pub mod x509;

pub use ca::{CertRequest, DevCa};
pub use config::{server_name, TlsConfig, TlsError, CA_FILE, CERT_FILE, KEY_FILE};
pub use x509::{common_name_from_der, common_name_from_pem, device_common_name, NOBODY_COMMON_NAME};
