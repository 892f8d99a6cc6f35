//! Scheduler client and reference scheduler for nodesign.
//!
//! A node is addressed by its [`NodeId`](nodesign_signer::NodeId). Before
//! it can be scheduled it must be registered: the client fetches a
//! challenge, signs it with the node key, and submits it together with a
//! certificate signing request. The scheduler answers with a device
//! certificate for `/users/<node id>` and a rune, which together make up
//! the node's [`DeviceCredentials`]. With those, [`Scheduler::schedule`]
//! returns where the node has been provisioned.
//!
//! ## Protocol
//!
//! One length-prefixed bincode request and response per mutual-TLS
//! connection; see [`protocol`].

pub mod client;
pub mod credentials;
pub mod dev_certs;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod runes;
pub mod server;

pub use client::{
    CallOptions, Endpoint, Scheduler, SchedulerConfig, SchedulerError, DEFAULT_SCHEDULER_URI,
    SCHEDULER_URI_ENV,
};
pub use credentials::{Credentials, CredentialsError, DeviceCredentials};
pub use dev_certs::DevCerts;
pub use protocol::{ErrorCode, ScheduleResult, ServiceError};
pub use registry::{NodeRegistry, RegistryError};
pub use retry::{retry, CancelToken, RetryPolicy};
pub use runes::{DefRules, RuneCheckError, RuneContext, RuneFactory, RuneIssuer};
pub use server::{SchedulerServer, ServerConfig, ServerError};
