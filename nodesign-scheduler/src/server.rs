//! Reference scheduler service.
//!
//! Accepts mutual-TLS connections on TCP, one request per connection, and
//! implements node registration, recovery and scheduling on top of a
//! [`NodeRegistry`]. The peer certificate's common name decides what a
//! connection may do: `/users/nobody` may enrol nodes, `/users/<node id>`
//! may act for that node only.

use nodesign_signer::{verify_message, Network, NodeId};
use nodesign_tls::{
    common_name_from_der, device_common_name, DevCa, TlsConfig, TlsError, NOBODY_COMMON_NAME,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    read_frame, write_frame, ChallengeRequest, ChallengeScope, EnrollRequest, EnrollResponse,
    ErrorCode, FrameError, Request, Response, ScheduleRequest, ScheduleResult, ServiceError,
};
use crate::registry::{Assignment, NodeRecord, NodeRegistry, RegistryError};
use crate::runes::{RuneContext, RuneIssuer};

/// Length of an enrolment challenge.
pub const CHALLENGE_LEN: usize = 32;
/// Node host used when none is configured.
pub const DEFAULT_NODE_HOST: &str = "localhost:9736";

const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(60);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);

/// Server configuration.
pub struct ServerConfig {
    /// TCP address to listen on, e.g. `0.0.0.0:2601`
    pub listen_addr: String,
    /// Scheduler identity and the CA client certificates must chain to
    pub tls: TlsConfig,
    /// CA used to sign device certificate requests
    pub ca: DevCa,
    /// Hosts nodes are scheduled onto
    pub node_hosts: Vec<String>,
    /// Path to the node registry file
    pub state_file: PathBuf,
    /// Maximum number of scheduled nodes; unlimited if `None`
    pub max_nodes: Option<usize>,
    /// How long an issued challenge stays valid
    pub challenge_ttl: Duration,
}

impl ServerConfig {
    pub fn new(
        listen_addr: impl Into<String>,
        tls: TlsConfig,
        ca: DevCa,
        state_file: PathBuf,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            tls,
            ca,
            node_hosts: vec![DEFAULT_NODE_HOST.to_string()],
            state_file,
            max_nodes: None,
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
        }
    }
}

/// Errors from the scheduler server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Rune error: {0}")]
    Rune(String),
}

struct PendingChallenge {
    node_id: NodeId,
    scope: ChallengeScope,
    issued_at: Instant,
}

/// Reference scheduler.
pub struct SchedulerServer {
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    ca: DevCa,
    node_hosts: Vec<String>,
    max_nodes: Option<usize>,
    challenge_ttl: Duration,
    registry: Mutex<NodeRegistry>,
    runes: RuneIssuer,
    challenges: Mutex<HashMap<Vec<u8>, PendingChallenge>>,
    draining: AtomicBool,
}

impl SchedulerServer {
    /// Bind the listener and open the registry.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if config.node_hosts.is_empty() {
            return Err(ServerError::Config(
                "at least one node host is required".to_string(),
            ));
        }

        let tls = config.tls.server_config()?;
        let registry = NodeRegistry::open(config.state_file)?;
        let runes = RuneIssuer::new(registry.rune_secret())
            .map_err(|e| ServerError::Rune(format!("{:?}", e)))?;
        let listener = TcpListener::bind(&config.listen_addr)?;
        info!("Scheduler listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            tls,
            ca: config.ca,
            node_hosts: config.node_hosts,
            max_nodes: config.max_nodes,
            challenge_ttl: config.challenge_ttl,
            registry: Mutex::new(registry),
            runes,
            challenges: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Stop handing out new assignments. Existing assignments are still
    /// reported.
    pub fn set_draining(&self, draining: bool) {
        info!("Draining: {}", draining);
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Run the accept loop (blocking), one thread per connection.
    pub fn run(self: Arc<Self>) -> Result<(), ServerError> {
        info!(
            "Scheduler starting: {} registered nodes, hosts {:?}",
            self.registry.lock().len(),
            self.node_hosts
        );

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Error handling connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection.
    fn handle_connection(&self, mut tcp: TcpStream) -> Result<(), ServerError> {
        let peer = tcp.peer_addr()?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;
        debug!("New connection from {}", peer);

        let mut conn =
            rustls::ServerConnection::new(Arc::clone(&self.tls)).map_err(TlsError::from)?;
        while conn.is_handshaking() {
            // complete_io has already tried to send the alert on failure.
            if let Err(e) = conn.complete_io(&mut tcp) {
                warn!("TLS handshake with {} failed: {}", peer, e);
                linger_close(tcp);
                return Err(ServerError::Handshake(e.to_string()));
            }
        }

        let peer_cn = match conn.peer_certificates().and_then(|certs| certs.first()) {
            Some(cert) => common_name_from_der(cert.as_ref())?.unwrap_or_default(),
            None => String::new(),
        };

        let mut stream = rustls::Stream::new(&mut conn, &mut tcp);
        let request: Request = read_frame(&mut stream)?;
        debug!("{} request from {} ({:?})", request.kind(), peer, peer_cn);

        let response = self.handle_request(request, &peer_cn);
        if let Response::Error(err) = &response {
            warn!("Rejected request from {} ({:?}): {}", peer, peer_cn, err);
        }
        write_frame(&mut stream, &response)?;

        conn.send_close_notify();
        let _ = conn.complete_io(&mut tcp);
        Ok(())
    }

    fn handle_request(&self, request: Request, peer_cn: &str) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::GetChallenge(req) => self.handle_challenge(req, peer_cn),
            Request::Register(req) => self.handle_enroll(req, ChallengeScope::Register, peer_cn),
            Request::Recover(req) => self.handle_enroll(req, ChallengeScope::Recover, peer_cn),
            Request::Schedule(req) => self.handle_schedule(req, peer_cn),
            Request::GetNodeInfo { node_id, rune } => {
                self.handle_node_info(&node_id, &rune, peer_cn)
            }
        }
    }

    fn handle_challenge(&self, req: ChallengeRequest, peer_cn: &str) -> Response {
        if let Err(e) = authorize_enrolment(&req.node_id, peer_cn) {
            return Response::Error(e);
        }

        let mut challenge = vec![0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        let mut challenges = self.challenges.lock();
        let ttl = self.challenge_ttl;
        challenges.retain(|_, pending| pending.issued_at.elapsed() < ttl);
        challenges.insert(
            challenge.clone(),
            PendingChallenge {
                node_id: req.node_id,
                scope: req.scope,
                issued_at: Instant::now(),
            },
        );
        debug!("Issued {:?} challenge for node {}", req.scope, req.node_id);

        Response::Challenge { challenge }
    }

    fn handle_enroll(
        &self,
        req: EnrollRequest,
        scope: ChallengeScope,
        peer_cn: &str,
    ) -> Response {
        match self.enroll(req, scope, peer_cn) {
            Ok(enrolled) => Response::Enrolled(enrolled),
            Err(e) => Response::Error(e),
        }
    }

    fn enroll(
        &self,
        req: EnrollRequest,
        scope: ChallengeScope,
        peer_cn: &str,
    ) -> Result<EnrollResponse, ServiceError> {
        authorize_enrolment(&req.node_id, peer_cn)?;

        // Challenges are single use: removed whether or not the rest succeeds.
        let pending = self.challenges.lock().remove(&req.challenge);
        let valid = pending.map_or(false, |p| {
            p.node_id == req.node_id
                && p.scope == scope
                && p.issued_at.elapsed() < self.challenge_ttl
        });
        if !valid {
            return Err(ServiceError::new(
                ErrorCode::Unauthenticated,
                "unknown or expired challenge",
            ));
        }

        verify_message(&req.node_id, &req.challenge, &req.signature)
            .map_err(|e| ServiceError::new(ErrorCode::Unauthenticated, e.to_string()))?;

        let mut registry = self.registry.lock();
        match (scope, registry.get(&req.node_id)) {
            (ChallengeScope::Register, Some(_)) => {
                return Err(ServiceError::new(
                    ErrorCode::AlreadyExists,
                    format!("node {} is already registered", req.node_id),
                ))
            }
            (ChallengeScope::Recover, None) => {
                return Err(ServiceError::new(
                    ErrorCode::NotFound,
                    format!("node {} is not registered", req.node_id),
                ))
            }
            (ChallengeScope::Recover, Some(record)) if record.network != req.network => {
                return Err(network_mismatch(&req.node_id, record.network, req.network));
            }
            _ => {}
        }

        let device_cert = self
            .ca
            .sign_request(&req.csr, &device_common_name(&req.node_id.to_hex()))
            .map_err(|e| ServiceError::new(ErrorCode::InvalidArgument, e.to_string()))?;

        let rune_id = match scope {
            ChallengeScope::Register => registry.register(&req.node_id, req.network),
            ChallengeScope::Recover => registry.recover(&req.node_id),
        }
        .map_err(registry_error)?;
        let rune = self
            .runes
            .issue(&req.node_id, &rune_id)
            .map_err(|e| {
                error!("Failed to issue rune for {}: {:?}", req.node_id, e);
                ServiceError::new(ErrorCode::Internal, "rune issuance failed")
            })?
            .to_base64();

        Ok(EnrollResponse { device_cert, rune })
    }

    fn handle_schedule(&self, req: ScheduleRequest, peer_cn: &str) -> Response {
        match self.schedule(&req, peer_cn) {
            Ok(result) => Response::Scheduled(result),
            Err(e) => Response::Error(e),
        }
    }

    fn schedule(
        &self,
        req: &ScheduleRequest,
        peer_cn: &str,
    ) -> Result<ScheduleResult, ServiceError> {
        authorize_node(&req.node_id, peer_cn)?;

        let mut registry = self.registry.lock();
        let record = registry
            .get(&req.node_id)
            .ok_or_else(|| not_registered(&req.node_id))?;
        if record.network != req.network {
            return Err(network_mismatch(&req.node_id, record.network, req.network));
        }
        self.authorize_rune(&req.node_id, record, "Schedule", &req.rune)?;

        if record.assignment.is_none() {
            if self.is_draining() {
                return Err(ServiceError::new(
                    ErrorCode::Unavailable,
                    "scheduler is draining",
                ));
            }
            if let Some(max) = self.max_nodes {
                if registry.assignment_count() >= max {
                    return Err(ServiceError::new(
                        ErrorCode::Unavailable,
                        format!("capacity of {} nodes reached", max),
                    ));
                }
            }
        }

        let assignment = registry
            .assign(&req.node_id, self.pick_host(&req.node_id), random_token(16))
            .map_err(registry_error)?;
        Ok(to_result(req.node_id, assignment))
    }

    fn handle_node_info(&self, node_id: &NodeId, rune: &str, peer_cn: &str) -> Response {
        match self.node_info(node_id, rune, peer_cn) {
            Ok(info) => Response::NodeInfo(info),
            Err(e) => Response::Error(e),
        }
    }

    fn node_info(
        &self,
        node_id: &NodeId,
        rune: &str,
        peer_cn: &str,
    ) -> Result<Option<ScheduleResult>, ServiceError> {
        authorize_node(node_id, peer_cn)?;

        let registry = self.registry.lock();
        let record = registry.get(node_id).ok_or_else(|| not_registered(node_id))?;
        self.authorize_rune(node_id, record, "GetNodeInfo", rune)?;
        Ok(record.assignment.clone().map(|a| to_result(*node_id, a)))
    }

    /// The rune must descend from our secret, name the node's current
    /// master rune and allow `method`.
    fn authorize_rune(
        &self,
        node_id: &NodeId,
        record: &NodeRecord,
        method: &str,
        rune: &str,
    ) -> Result<(), ServiceError> {
        let context = RuneContext::new(method, node_id, record.rune_id.clone());
        self.runes
            .verify(rune, context)
            .map_err(|e| ServiceError::new(ErrorCode::Unauthenticated, e.to_string()))
    }

    /// Node host for `node_id`, chosen by hashing the node id.
    fn pick_host(&self, node_id: &NodeId) -> String {
        let digest = Sha256::digest(node_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(prefix) % self.node_hosts.len() as u64) as usize;

        let host = &self.node_hosts[index];
        if host.contains("://") {
            host.clone()
        } else {
            format!("https://{}", host)
        }
    }
}

/// Enrolment is open to the nobody identity and to the node's own device.
fn authorize_enrolment(node_id: &NodeId, peer_cn: &str) -> Result<(), ServiceError> {
    if peer_cn == NOBODY_COMMON_NAME {
        return Ok(());
    }
    authorize_node(node_id, peer_cn)
}

fn authorize_node(node_id: &NodeId, peer_cn: &str) -> Result<(), ServiceError> {
    if peer_cn == device_common_name(&node_id.to_hex()) {
        Ok(())
    } else {
        Err(ServiceError::new(
            ErrorCode::Unauthenticated,
            format!("identity {:?} may not act for node {}", peer_cn, node_id),
        ))
    }
}

fn not_registered(node_id: &NodeId) -> ServiceError {
    ServiceError::new(
        ErrorCode::NotFound,
        format!("node {} is not registered", node_id),
    )
}

fn network_mismatch(node_id: &NodeId, registered: Network, requested: Network) -> ServiceError {
    ServiceError::new(
        ErrorCode::InvalidArgument,
        format!(
            "node {} is registered on {}, not {}",
            node_id, registered, requested
        ),
    )
}

fn registry_error(err: RegistryError) -> ServiceError {
    match err {
        RegistryError::AlreadyRegistered(_) => {
            ServiceError::new(ErrorCode::AlreadyExists, err.to_string())
        }
        RegistryError::NotRegistered(_) => ServiceError::new(ErrorCode::NotFound, err.to_string()),
        other => {
            error!("Registry failure: {}", other);
            ServiceError::new(ErrorCode::Internal, "registry unavailable")
        }
    }
}

fn to_result(node_id: NodeId, assignment: Assignment) -> ScheduleResult {
    ScheduleResult {
        node_id,
        grpc_uri: assignment.grpc_uri,
        session_id: assignment.session_id,
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Half-close and drain the socket so a pending alert reaches the peer
/// instead of being discarded by a reset.
fn linger_close(mut tcp: TcpStream) {
    let _ = tcp.shutdown(Shutdown::Write);
    let _ = tcp.set_read_timeout(Some(LINGER_TIMEOUT));
    let mut buf = [0u8; 1024];
    while let Ok(n) = tcp.read(&mut buf) {
        if n == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallOptions, Scheduler, SchedulerConfig, SchedulerError};
    use crate::credentials::{Credentials, DeviceCredentials};
    use crate::dev_certs::DevCerts;
    use crate::retry::RetryPolicy;
    use crate::runes::{DefRules, RuneFactory};
    use nodesign_signer::Signer;
    use runeauth::Rune;
    use tempfile::TempDir;

    struct TestEnv {
        server: Arc<SchedulerServer>,
        ca: DevCa,
        nobody: TlsConfig,
        uri: String,
        _dir: TempDir,
    }

    impl TestEnv {
        fn config(&self) -> SchedulerConfig {
            SchedulerConfig::new(self.uri.clone())
                .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
        }

        fn nobody_client(&self, signer: &Signer) -> Scheduler {
            Scheduler::with_config(
                signer.node_id(),
                signer.network(),
                self.nobody.clone(),
                self.config(),
            )
            .unwrap()
        }

        fn device_client(&self, creds: &Credentials, network: Network) -> Scheduler {
            Scheduler::with_credentials(creds, network, self.config()).unwrap()
        }

        fn signer(&self, seed: u8, network: Network) -> Signer {
            Signer::new(&[seed; 32], network, self.nobody.clone()).unwrap()
        }
    }

    fn start_server(max_nodes: Option<usize>, challenge_ttl: Duration) -> TestEnv {
        let dir = TempDir::new().unwrap();
        let DevCerts { ca, server, nobody } =
            DevCerts::generate(&["localhost", "127.0.0.1"]).unwrap();
        let ca_copy = DevCa::from_pem(&ca.cert_pem(), &ca.key_pem()).unwrap();

        let state_file = dir.path().join("registry.json");
        let mut config = ServerConfig::new("127.0.0.1:0", server, ca, state_file);
        config.node_hosts = vec!["node-a.test:9736".to_string(), "node-b.test:9736".to_string()];
        config.max_nodes = max_nodes;
        config.challenge_ttl = challenge_ttl;

        let server = Arc::new(SchedulerServer::bind(config).unwrap());
        let uri = format!("https://127.0.0.1:{}", server.local_addr().unwrap().port());

        let runner = Arc::clone(&server);
        thread::spawn(move || {
            let _ = runner.run();
        });

        TestEnv {
            server,
            ca: ca_copy,
            nobody,
            uri,
            _dir: dir,
        }
    }

    fn start_default() -> TestEnv {
        start_server(None, DEFAULT_CHALLENGE_TTL)
    }

    #[test]
    fn test_ping() {
        let env = start_default();
        let signer = env.signer(1, Network::Regtest);
        env.nobody_client(&signer).ping().unwrap();
    }

    #[test]
    fn test_register_then_schedule() {
        let env = start_default();
        let signer = env.signer(2, Network::Regtest);

        let creds = env.nobody_client(&signer).register(&signer).unwrap();
        assert_eq!(creds.node_id().unwrap(), signer.node_id());
        assert!(!creds.rune().unwrap().is_empty());
        creds.ensure_device().unwrap().verify_identity().unwrap();

        let scheduler = env.device_client(&creds, Network::Regtest);
        let result = scheduler.schedule().unwrap();
        assert!(!result.is_empty());
        assert_eq!(result.node_id, signer.node_id());
        assert!(result.grpc_uri.starts_with("https://node-"));

        let again = scheduler.schedule().unwrap();
        assert_eq!(again, result);

        let info = scheduler.get_node_info().unwrap();
        assert_eq!(info, Some(result));
    }

    #[test]
    fn test_node_info_before_schedule() {
        let env = start_default();
        let signer = env.signer(3, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();

        let scheduler = env.device_client(&creds, Network::Regtest);
        assert_eq!(scheduler.get_node_info().unwrap(), None);
    }

    #[test]
    fn test_register_twice_rejected() {
        let env = start_default();
        let signer = env.signer(4, Network::Regtest);
        let client = env.nobody_client(&signer);

        client.register(&signer).unwrap();
        let err = client.register(&signer).unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected(_)), "got {:?}", err);
    }

    #[test]
    fn test_recover_issues_new_credentials() {
        let env = start_default();
        let signer = env.signer(5, Network::Regtest);
        let client = env.nobody_client(&signer);

        let first = client.register(&signer).unwrap();
        let scheduled = env.device_client(&first, Network::Regtest).schedule().unwrap();

        let recovered = client.recover(&signer).unwrap();
        assert_ne!(recovered.rune().unwrap(), first.rune().unwrap());
        assert_eq!(recovered.node_id().unwrap(), signer.node_id());

        let again = env.device_client(&recovered, Network::Regtest).schedule().unwrap();
        assert_eq!(again, scheduled);

        // The previous master rune names a superseded unique id.
        let err = env.device_client(&first, Network::Regtest).schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_readonly_rune_cannot_schedule() {
        let env = start_default();
        let signer = env.signer(22, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();
        let scheduler = env.device_client(&creds, Network::Regtest);
        let result = scheduler.schedule().unwrap();

        let master = Rune::from_base64(creds.rune().unwrap()).unwrap();
        let readonly = RuneFactory::carve(&master, &[DefRules::ReadOnly]).unwrap();
        let scheduler = scheduler.with_rune(readonly);

        assert_eq!(scheduler.get_node_info().unwrap(), Some(result));
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_missing_or_foreign_rune_rejected() {
        let env = start_default();
        let alice = env.signer(23, Network::Regtest);
        let bob = env.signer(24, Network::Regtest);
        let alice_creds = env.nobody_client(&alice).register(&alice).unwrap();
        let bob_creds = env.nobody_client(&bob).register(&bob).unwrap();

        let scheduler = env.device_client(&alice_creds, Network::Regtest).with_rune("");
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);

        let scheduler = scheduler.with_rune(bob_creds.rune().unwrap());
        let err = scheduler.get_node_info().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_upgrade_adds_rune_to_legacy_credentials() {
        let env = start_default();
        let signer = env.signer(25, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();

        let device = creds.ensure_device().unwrap();
        let legacy = Credentials::Device(DeviceCredentials::new(
            device.tls_config().clone(),
            device.node_id(),
            "",
        ));
        let legacy_client = env.device_client(&legacy, Network::Regtest);
        assert!(matches!(legacy_client.schedule(), Err(SchedulerError::Auth(_))));

        let upgraded = legacy.upgrade(&legacy_client, &signer).unwrap();
        assert!(upgraded.ensure_device().unwrap().has_rune());
        assert!(!env
            .device_client(&upgraded, Network::Regtest)
            .schedule()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_upgrade_keeps_current_credentials() {
        let env = start_default();
        let signer = env.signer(26, Network::Regtest);
        let client = env.nobody_client(&signer);
        let creds = client.register(&signer).unwrap();

        let upgraded = creds.upgrade(&client, &signer).unwrap();
        assert_eq!(upgraded.rune().unwrap(), creds.rune().unwrap());

        let nobody = Credentials::nobody(env.nobody.clone()).unwrap();
        assert!(matches!(
            nobody.upgrade(&client, &signer),
            Err(SchedulerError::Credentials(_))
        ));

        let other = env.signer(27, Network::Regtest);
        assert!(matches!(
            creds.upgrade(&client, &other),
            Err(SchedulerError::Credentials(_))
        ));
    }

    #[test]
    fn test_missing_client_certificate_is_auth_error() {
        let env = start_default();
        let signer = env.signer(28, Network::Regtest);
        let anonymous = TlsConfig::new(env.ca.cert_pem());

        let scheduler =
            Scheduler::with_config(signer.node_id(), Network::Regtest, anonymous, env.config())
                .unwrap();
        for _ in 0..3 {
            let err = scheduler.ping().unwrap_err();
            assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_recover_unknown_node() {
        let env = start_default();
        let signer = env.signer(6, Network::Regtest);

        let err = env.nobody_client(&signer).recover(&signer).unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)), "got {:?}", err);
    }

    #[test]
    fn test_unknown_ca_is_auth_error() {
        let env = start_default();
        let signer = env.signer(7, Network::Regtest);
        let rogue = DevCa::generate("rogue CA").unwrap();
        let tls = rogue.issue_nobody().unwrap().with_ca(env.ca.cert_pem());

        let scheduler =
            Scheduler::with_config(signer.node_id(), Network::Regtest, tls, env.config()).unwrap();
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);

        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let err = scheduler
            .schedule_with_retry(&policy, &CallOptions::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)));
    }

    #[test]
    fn test_untrusted_server_is_auth_error() {
        let env = start_default();
        let signer = env.signer(8, Network::Regtest);
        let other = DevCa::generate("other CA").unwrap();
        let tls = env.nobody.clone().with_ca(other.cert_pem());

        let scheduler =
            Scheduler::with_config(signer.node_id(), Network::Regtest, tls, env.config()).unwrap();
        let err = scheduler.ping().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_nobody_cannot_schedule() {
        let env = start_default();
        let signer = env.signer(9, Network::Regtest);
        let client = env.nobody_client(&signer);
        client.register(&signer).unwrap();

        let err = client.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
        assert!(matches!(client.get_node_info(), Err(SchedulerError::Auth(_))));
    }

    #[test]
    fn test_device_cannot_act_for_other_node() {
        let env = start_default();
        let alice = env.signer(10, Network::Regtest);
        let bob = env.signer(11, Network::Regtest);
        env.nobody_client(&bob).register(&bob).unwrap();
        let alice_creds = env.nobody_client(&alice).register(&alice).unwrap();

        let scheduler = Scheduler::with_config(
            bob.node_id(),
            Network::Regtest,
            alice_creds.tls_config().clone(),
            env.config(),
        )
        .unwrap();
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_unregistered_node_not_found() {
        let env = start_default();
        let signer = env.signer(12, Network::Regtest);
        let tls = env
            .ca
            .issue_client(&device_common_name(&signer.node_id().to_hex()))
            .unwrap();

        let scheduler =
            Scheduler::with_config(signer.node_id(), Network::Regtest, tls, env.config()).unwrap();
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)), "got {:?}", err);
    }

    #[test]
    fn test_network_mismatch_rejected() {
        let env = start_default();
        let signer = env.signer(13, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();

        let err = env.device_client(&creds, Network::Testnet).schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected(_)), "got {:?}", err);
    }

    #[test]
    fn test_draining_is_unavailable() {
        let env = start_default();
        let signer = env.signer(14, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();
        let scheduler = env.device_client(&creds, Network::Regtest);

        env.server.set_draining(true);
        let err = scheduler.schedule().unwrap_err();
        assert!(matches!(err, SchedulerError::ServiceUnavailable(_)), "got {:?}", err);
        assert!(err.is_retryable());

        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let err = scheduler
            .schedule_with_retry(&policy, &CallOptions::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ServiceUnavailable(_)));

        env.server.set_draining(false);
        assert!(!scheduler.schedule().unwrap().is_empty());
    }

    #[test]
    fn test_draining_keeps_existing_assignment() {
        let env = start_default();
        let signer = env.signer(15, Network::Regtest);
        let creds = env.nobody_client(&signer).register(&signer).unwrap();
        let scheduler = env.device_client(&creds, Network::Regtest);

        let result = scheduler.schedule().unwrap();
        env.server.set_draining(true);
        assert_eq!(scheduler.schedule().unwrap(), result);
    }

    #[test]
    fn test_capacity_limit() {
        let env = start_server(Some(1), DEFAULT_CHALLENGE_TTL);
        let first = env.signer(16, Network::Regtest);
        let second = env.signer(17, Network::Regtest);
        let first_creds = env.nobody_client(&first).register(&first).unwrap();
        let second_creds = env.nobody_client(&second).register(&second).unwrap();

        env.device_client(&first_creds, Network::Regtest).schedule().unwrap();
        let err = env
            .device_client(&second_creds, Network::Regtest)
            .schedule()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ServiceUnavailable(_)), "got {:?}", err);
    }

    #[test]
    fn test_challenge_is_single_use() {
        let env = start_default();
        let signer = env.signer(18, Network::Regtest);

        let challenge = match env.server.handle_request(
            Request::GetChallenge(ChallengeRequest {
                node_id: signer.node_id(),
                scope: ChallengeScope::Register,
            }),
            NOBODY_COMMON_NAME,
        ) {
            Response::Challenge { challenge } => challenge,
            other => panic!("Expected challenge, got {}", other.kind()),
        };
        assert_eq!(challenge.len(), CHALLENGE_LEN);

        let csr = nodesign_tls::CertRequest::generate("/users/anything").unwrap();
        let request = EnrollRequest {
            node_id: signer.node_id(),
            network: Network::Regtest,
            signature: signer.sign_challenge(&challenge).unwrap(),
            challenge,
            csr: csr.csr_pem().to_string(),
        };

        let first = env
            .server
            .handle_request(Request::Register(request.clone()), NOBODY_COMMON_NAME);
        assert!(matches!(first, Response::Enrolled(_)));

        match env.server.handle_request(Request::Recover(request), NOBODY_COMMON_NAME) {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::Unauthenticated),
            other => panic!("Expected error, got {}", other.kind()),
        }
    }

    #[test]
    fn test_challenge_signed_by_other_key_rejected() {
        let env = start_default();
        let signer = env.signer(19, Network::Regtest);
        let impostor = env.signer(20, Network::Regtest);

        let challenge = match env.server.handle_request(
            Request::GetChallenge(ChallengeRequest {
                node_id: signer.node_id(),
                scope: ChallengeScope::Register,
            }),
            NOBODY_COMMON_NAME,
        ) {
            Response::Challenge { challenge } => challenge,
            other => panic!("Expected challenge, got {}", other.kind()),
        };

        let csr = nodesign_tls::CertRequest::generate("/users/anything").unwrap();
        let request = EnrollRequest {
            node_id: signer.node_id(),
            network: Network::Regtest,
            signature: impostor.sign_challenge(&challenge).unwrap(),
            challenge,
            csr: csr.csr_pem().to_string(),
        };

        match env.server.handle_request(Request::Register(request), NOBODY_COMMON_NAME) {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::Unauthenticated),
            other => panic!("Expected error, got {}", other.kind()),
        }
        assert!(env.server.registry.lock().get(&signer.node_id()).is_none());
    }

    #[test]
    fn test_expired_challenge_rejected() {
        let env = start_server(None, Duration::ZERO);
        let signer = env.signer(21, Network::Regtest);

        let err = env.nobody_client(&signer).register(&signer).unwrap_err();
        assert!(matches!(err, SchedulerError::Auth(_)), "got {:?}", err);
    }

    #[test]
    fn test_assignment_survives_restart() {
        let dir = TempDir::new().unwrap();
        let state_file = dir.path().join("registry.json");
        let DevCerts { ca, server, .. } = DevCerts::generate(&["localhost"]).unwrap();
        let ca_again = DevCa::from_pem(&ca.cert_pem(), &ca.key_pem()).unwrap();

        let mut node = [0x44u8; 33];
        node[0] = 0x02;
        let node_id = NodeId::from_bytes(node);
        let peer_cn = device_common_name(&node_id.to_hex());

        let (first, rune) = {
            let scheduler = SchedulerServer::bind(ServerConfig::new(
                "127.0.0.1:0",
                server.clone(),
                ca,
                state_file.clone(),
            ))
            .unwrap();
            let rune_id = scheduler
                .registry
                .lock()
                .register(&node_id, Network::Regtest)
                .unwrap();
            let rune = scheduler.runes.issue(&node_id, &rune_id).unwrap().to_base64();
            let request = ScheduleRequest {
                node_id,
                network: Network::Regtest,
                rune: rune.clone(),
            };
            (scheduler.schedule(&request, &peer_cn).unwrap(), rune)
        };

        // The rune secret is persisted, so runes issued before the restart
        // still verify.
        let config = ServerConfig::new("127.0.0.1:0", server, ca_again, state_file);
        let scheduler = SchedulerServer::bind(config).unwrap();
        match scheduler.handle_request(Request::GetNodeInfo { node_id, rune }, &peer_cn) {
            Response::NodeInfo(Some(result)) => assert_eq!(result, first),
            other => panic!("Expected node info, got {}", other.kind()),
        }
    }

    #[test]
    fn test_bind_requires_node_hosts() {
        let dir = TempDir::new().unwrap();
        let DevCerts { ca, server, .. } = DevCerts::generate(&["localhost"]).unwrap();
        let state_file = dir.path().join("registry.json");
        let mut config = ServerConfig::new("127.0.0.1:0", server, ca, state_file);
        config.node_hosts.clear();

        assert!(matches!(SchedulerServer::bind(config), Err(ServerError::Config(_))));
    }
}
