//! Node registry for the reference scheduler.
//!
//! Records which nodes have been registered, the id of the rune last issued
//! to each, and where each node has been scheduled. State is persisted as
//! JSON after every change so assignments survive restarts. Changes are
//! applied to a copy and only become visible once they are on disk.

use nodesign_signer::{Network, NodeId};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Length of the secret runes are derived from.
pub const RUNE_SECRET_LEN: usize = 32;

/// Errors from the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node {0} is already registered")]
    AlreadyRegistered(NodeId),

    #[error("Node {0} is not registered")]
    NotRegistered(NodeId),

    #[error("Failed to persist registry: {0}")]
    PersistError(#[from] std::io::Error),

    #[error("Failed to parse registry file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid rune secret in registry file")]
    InvalidRuneSecret,
}

/// Where a node has been provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub grpc_uri: String,
    pub session_id: String,
    /// Unix timestamp of the first schedule
    pub scheduled_at: u64,
}

/// Registry entry for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub network: Network,
    pub registered_at: u64,
    /// Unix timestamp of the most recent recovery, if any
    pub recovered_at: Option<u64>,
    /// Unique id of the master rune issued at the most recent enrolment
    pub rune_id: String,
    pub assignment: Option<Assignment>,
}

/// Persistent registry contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    /// Hex secret every master rune is derived from
    #[serde(default)]
    pub rune_secret: String,
    /// Number of runes issued so far; the next unique id
    #[serde(default)]
    pub runes_issued: u64,
    /// Map from hex node id to its record
    pub nodes: BTreeMap<String, NodeRecord>,
}

/// Registry of enrolled nodes backed by a JSON file.
pub struct NodeRegistry {
    state_file: PathBuf,
    state: RegistryState,
    rune_secret: Zeroizing<[u8; RUNE_SECRET_LEN]>,
}

impl NodeRegistry {
    /// Open the registry at `state_file`, starting empty if it does not exist.
    pub fn open(state_file: PathBuf) -> Result<Self, RegistryError> {
        let mut state = if state_file.exists() {
            info!("Loading node registry from {:?}", state_file);
            let file = File::open(&state_file)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            info!("Creating new node registry at {:?}", state_file);
            RegistryState::default()
        };

        let mut rune_secret = Zeroizing::new([0u8; RUNE_SECRET_LEN]);
        if state.rune_secret.is_empty() {
            OsRng.fill_bytes(&mut rune_secret[..]);
            state.rune_secret = hex::encode(&rune_secret[..]);
        } else {
            let decoded = Zeroizing::new(
                hex::decode(&state.rune_secret).map_err(|_| RegistryError::InvalidRuneSecret)?,
            );
            if decoded.len() != RUNE_SECRET_LEN {
                return Err(RegistryError::InvalidRuneSecret);
            }
            rune_secret.copy_from_slice(&decoded);
        }

        Ok(Self {
            state_file,
            state,
            rune_secret,
        })
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.state.nodes.get(&node_id.to_hex())
    }

    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    /// Secret the scheduler derives master runes from.
    pub fn rune_secret(&self) -> &[u8; RUNE_SECRET_LEN] {
        &self.rune_secret
    }

    /// Number of nodes currently holding an assignment.
    pub fn assignment_count(&self) -> usize {
        self.state
            .nodes
            .values()
            .filter(|record| record.assignment.is_some())
            .count()
    }

    /// Add a new node.
    ///
    /// Returns the unique id of the node's first master rune.
    pub fn register(
        &mut self,
        node_id: &NodeId,
        network: Network,
    ) -> Result<String, RegistryError> {
        let key = node_id.to_hex();
        if self.state.nodes.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(*node_id));
        }

        let mut next = self.state.clone();
        let rune_id = next_rune_id(&mut next);
        next.nodes.insert(
            key,
            NodeRecord {
                network,
                registered_at: current_timestamp(),
                recovered_at: None,
                rune_id: rune_id.clone(),
                assignment: None,
            },
        );

        self.commit(next)?;
        info!("Registered node {} on {}", node_id, network);
        Ok(rune_id)
    }

    /// Issue a new rune id for an existing node after recovery, which
    /// invalidates runes carrying the previous one.
    pub fn recover(&mut self, node_id: &NodeId) -> Result<String, RegistryError> {
        let key = node_id.to_hex();
        if !self.state.nodes.contains_key(&key) {
            return Err(RegistryError::NotRegistered(*node_id));
        }

        let mut next = self.state.clone();
        let rune_id = next_rune_id(&mut next);
        if let Some(record) = next.nodes.get_mut(&key) {
            record.rune_id = rune_id.clone();
            record.recovered_at = Some(current_timestamp());
        }

        self.commit(next)?;
        info!("Recovered node {}", node_id);
        Ok(rune_id)
    }

    /// Record an assignment for a node, keeping any existing one.
    ///
    /// Returns the assignment now in effect.
    pub fn assign(
        &mut self,
        node_id: &NodeId,
        grpc_uri: String,
        session_id: String,
    ) -> Result<Assignment, RegistryError> {
        let key = node_id.to_hex();
        let record = self
            .state
            .nodes
            .get(&key)
            .ok_or(RegistryError::NotRegistered(*node_id))?;
        if let Some(existing) = &record.assignment {
            return Ok(existing.clone());
        }

        let assignment = Assignment {
            grpc_uri,
            session_id,
            scheduled_at: current_timestamp(),
        };
        let mut next = self.state.clone();
        if let Some(record) = next.nodes.get_mut(&key) {
            record.assignment = Some(assignment.clone());
        }

        self.commit(next)?;
        debug!("Assigned node {} to {}", node_id, assignment.grpc_uri);
        Ok(assignment)
    }

    /// Current contents (for diagnostics).
    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    /// Persist `next` and make it the current state.
    fn commit(&mut self, next: RegistryState) -> Result<(), RegistryError> {
        self.persist(&next)?;
        self.state = next;
        Ok(())
    }

    /// Write `state` to disk via a temp file and rename.
    fn persist(&self, state: &RegistryState) -> Result<(), RegistryError> {
        let temp_path = self.state_file.with_extension("tmp");

        if let Some(parent) = self.state_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&temp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, &self.state_file)?;

        debug!("Persisted node registry ({} nodes)", state.nodes.len());
        Ok(())
    }
}

fn next_rune_id(state: &mut RegistryState) -> String {
    let id = state.runes_issued;
    state.runes_issued += 1;
    id.to_string()
}

fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
