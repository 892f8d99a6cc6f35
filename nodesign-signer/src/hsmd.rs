//! Low-level key derivation and signing backend.
//!
//! The [`Signer`](crate::Signer) never touches key material itself; it
//! delegates to an [`Hsmd`] implementation. [`SoftHsmd`] is the in-process
//! secp256k1 backend; a hardware module or an out-of-process daemon plugs
//! in through the same trait.
//!
//! ## Derivation
//!
//! The node secret is the first valid secp256k1 scalar among
//!
//! ```text
//! HKDF-SHA256(salt = be32(i), ikm = seed, info = "nodeid/" || network)   i = 0, 1, ...
//! ```
//!
//! and the [`NodeId`] is its compressed public key. The result depends only
//! on the seed and the network.

use hkdf::Hkdf;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::network::Network;
use crate::node_id::NodeId;
use crate::seed::Seed;

/// Errors raised by an hsmd backend.
#[derive(Debug, Error)]
pub enum HsmdError {
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Diagnostic description of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmdInfo {
    /// Backend name
    pub name: &'static str,
    /// Backend version
    pub version: &'static str,
    /// Location of the backend module, for diagnostics
    pub location: &'static str,
}

/// Backend performing node key derivation and digest signing.
pub trait Hsmd: Send + Sync {
    /// Describe this backend.
    fn info(&self) -> HsmdInfo;

    /// Derive the node identifier for `seed` on `network`.
    fn node_id(&self, seed: &Seed, network: Network) -> Result<NodeId, HsmdError>;

    /// Sign a 32-byte digest with the node secret, returning a 64-byte
    /// compact ECDSA signature.
    fn sign_digest(
        &self,
        seed: &Seed,
        network: Network,
        digest: &[u8; 32],
    ) -> Result<[u8; 64], HsmdError>;
}

/// In-process secp256k1 backend.
pub struct SoftHsmd {
    secp: Secp256k1<All>,
}

impl SoftHsmd {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn node_secret(&self, seed: &Seed, network: Network) -> Result<SecretKey, HsmdError> {
        let info = format!("nodeid/{}", network.as_str());
        for counter in 0u32..=u32::MAX {
            let salt = counter.to_be_bytes();
            let hk = Hkdf::<Sha256>::new(Some(&salt[..]), seed.expose());
            let mut okm = Zeroizing::new([0u8; 32]);
            hk.expand(info.as_bytes(), &mut okm[..])
                .map_err(|e| HsmdError::Derivation(e.to_string()))?;
            // Not a valid scalar: try the next salt.
            if let Ok(secret) = SecretKey::from_slice(&okm[..]) {
                return Ok(secret);
            }
        }
        Err(HsmdError::Derivation("no valid node secret".to_string()))
    }
}

impl Default for SoftHsmd {
    fn default() -> Self {
        Self::new()
    }
}

impl Hsmd for SoftHsmd {
    fn info(&self) -> HsmdInfo {
        HsmdInfo {
            name: "soft-hsmd",
            version: env!("CARGO_PKG_VERSION"),
            location: file!(),
        }
    }

    fn node_id(&self, seed: &Seed, network: Network) -> Result<NodeId, HsmdError> {
        let mut secret = self.node_secret(seed, network)?;
        let pubkey = PublicKey::from_secret_key(&self.secp, &secret);
        secret.non_secure_erase();
        Ok(NodeId::from_bytes(pubkey.serialize()))
    }

    fn sign_digest(
        &self,
        seed: &Seed,
        network: Network,
        digest: &[u8; 32],
    ) -> Result<[u8; 64], HsmdError> {
        let mut secret = self.node_secret(seed, network)?;
        let message = Message::from_digest(*digest);
        let signature: Signature = self.secp.sign_ecdsa(&message, &secret);
        secret.non_secure_erase();
        Ok(signature.serialize_compact())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_reports_location() {
        let info = SoftHsmd::new().info();
        assert_eq!(info.name, "soft-hsmd");
        assert!(info.location.ends_with("hsmd.rs"));
        assert!(!info.version.is_empty());
    }

    #[test]
    fn test_node_id_is_deterministic() {
        let hsmd = SoftHsmd::new();
        let seed = Seed::from_slice(&[0u8; 32]).unwrap();

        let a = hsmd.node_id(&seed, Network::Regtest).unwrap();
        let b = hsmd.node_id(&seed, Network::Regtest).unwrap();
        assert_eq!(a, b);

        let first = a.as_bytes()[0];
        assert!(first == 0x02 || first == 0x03);
    }

    #[test]
    fn test_network_separates_identities() {
        let hsmd = SoftHsmd::new();
        let seed = Seed::from_slice(&[7u8; 32]).unwrap();

        let regtest = hsmd.node_id(&seed, Network::Regtest).unwrap();
        let bitcoin = hsmd.node_id(&seed, Network::Bitcoin).unwrap();
        assert_ne!(regtest, bitcoin);
    }

    #[test]
    fn test_signature_verifies_against_node_id() {
        let hsmd = SoftHsmd::new();
        let seed = Seed::from_slice(&[3u8; 32]).unwrap();
        let digest = [0x42u8; 32];

        let node_id = hsmd.node_id(&seed, Network::Testnet).unwrap();
        let sig = hsmd.sign_digest(&seed, Network::Testnet, &digest).unwrap();

        let secp = Secp256k1::verification_only();
        let pubkey = PublicKey::from_slice(node_id.as_bytes()).unwrap();
        let sig = Signature::from_compact(&sig).unwrap();
        assert!(secp
            .verify_ecdsa(&Message::from_digest(digest), &sig, &pubkey)
            .is_ok());
    }
}
