//! Seed custody and node identity for nodesign.
//!
//! A [`Signer`] owns a node's 32-byte seed for one [`Network`]. From it the
//! node secret is derived, and from that the [`NodeId`] the scheduler uses as
//! the node's sole addressing key. The seed never leaves the signer: it is
//! zeroized on drop, redacted in debug output, and only handed to the
//! [`Hsmd`] backend that performs derivation and signing.
//!
//! ```ignore
//! use nodesign_signer::{Network, Signer};
//!
//! let signer = Signer::new(&[0u8; 32], Network::Regtest, tls)?;
//! println!("node id: {}", signer.node_id());
//! ```

pub mod hsmd;
pub mod network;
pub mod node_id;
pub mod seed;
pub mod signer;

pub use hsmd::{Hsmd, HsmdError, HsmdInfo, SoftHsmd};
pub use network::Network;
pub use node_id::NodeId;
pub use seed::{Seed, SEED_LEN};
pub use signer::{message_digest, verify_message, Signer, SignerError, SIGNATURE_LEN};
