//! The node signer.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use nodesign_tls::{TlsConfig, TlsError};

use crate::hsmd::{Hsmd, HsmdError, HsmdInfo, SoftHsmd};
use crate::network::Network;
use crate::node_id::NodeId;
use crate::seed::Seed;

/// Length of a compact ECDSA signature.
pub const SIGNATURE_LEN: usize = 64;

/// Domain prefix for signed messages.
const MESSAGE_PREFIX: &[u8] = b"Lightning Signed Message:";

/// Errors from the signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Invalid seed: expected {expected} bytes, got {actual}")]
    InvalidSeed { expected: usize, actual: usize },

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Hsmd error: {0}")]
    Hsmd(#[from] HsmdError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Holds a node's seed for one network and signs on its behalf.
pub struct Signer {
    seed: Seed,
    network: Network,
    node_id: NodeId,
    tls: TlsConfig,
    hsmd: Arc<dyn Hsmd>,
}

impl Signer {
    /// Create a signer using the in-process [`SoftHsmd`] backend.
    ///
    /// Fails with [`SignerError::InvalidSeed`] unless `seed` is exactly 32
    /// bytes long.
    pub fn new(seed: &[u8], network: Network, tls: TlsConfig) -> Result<Self, SignerError> {
        Self::with_hsmd(seed, network, tls, Arc::new(SoftHsmd::new()))
    }

    /// Create a signer delegating to the given backend.
    ///
    /// The TLS material must build a client configuration.
    pub fn with_hsmd(
        seed: &[u8],
        network: Network,
        tls: TlsConfig,
        hsmd: Arc<dyn Hsmd>,
    ) -> Result<Self, SignerError> {
        Self::build(Seed::from_slice(seed)?, network, tls, hsmd)
    }

    /// Create a signer from an already validated seed.
    pub fn from_seed(seed: Seed, network: Network, tls: TlsConfig) -> Result<Self, SignerError> {
        Self::build(seed, network, tls, Arc::new(SoftHsmd::new()))
    }

    fn build(
        seed: Seed,
        network: Network,
        tls: TlsConfig,
        hsmd: Arc<dyn Hsmd>,
    ) -> Result<Self, SignerError> {
        tls.client_config()?;
        let node_id = hsmd.node_id(&seed, network)?;
        debug!("Initialized signer: network={}, node_id={}", network, node_id);

        Ok(Self {
            seed,
            network,
            node_id,
            tls,
            hsmd,
        })
    }

    /// The node identifier derived from the seed and network.
    ///
    /// Computed once at construction; calling this has no side effects.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    /// Describe the backend this signer delegates to.
    pub fn hsmd_info(&self) -> HsmdInfo {
        self.hsmd.info()
    }

    /// Sign an arbitrary message with the node key.
    pub fn sign_message(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN], SignerError> {
        let digest = message_digest(message);
        debug!("Signing message: len={}", message.len());
        Ok(self.hsmd.sign_digest(&self.seed, self.network, &digest)?)
    }

    /// Sign a scheduler challenge.
    pub fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(self.sign_message(challenge)?.to_vec())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("network", &self.network)
            .field("node_id", &self.node_id)
            .field("hsmd", &self.hsmd.info().name)
            .finish_non_exhaustive()
    }
}

/// Digest signed by [`Signer::sign_message`]: double SHA-256 over the
/// prefixed message.
pub fn message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(MESSAGE_PREFIX);
    hasher.update(message);
    Sha256::digest(hasher.finalize()).into()
}

/// Verify a signature produced by [`Signer::sign_message`].
pub fn verify_message(
    node_id: &NodeId,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignerError> {
    let pubkey = PublicKey::from_slice(node_id.as_bytes())
        .map_err(|e| SignerError::InvalidNodeId(e.to_string()))?;
    let sig = Signature::from_compact(signature)
        .map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    let msg = Message::from_digest(message_digest(message));

    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|e| SignerError::InvalidSignature(e.to_string()))
}
