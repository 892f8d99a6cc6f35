//! Scheduler client.
//!
//! Every call opens a fresh TCP connection, completes a mutual-TLS
//! handshake, exchanges one request/response frame and closes. Calls are
//! blocking; connect, read and write are bounded by socket timeouts.

use nodesign_signer::{Network, NodeId, Signer, SignerError};
use nodesign_tls::{device_common_name, server_name, CertRequest, TlsConfig, TlsError};
use rustls::pki_types::ServerName;
use rustls::{AlertDescription, ClientConfig, ClientConnection};
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::{Credentials, CredentialsError, DeviceCredentials};
use crate::protocol::{
    read_frame, write_frame, ChallengeRequest, ChallengeScope, EnrollRequest, ErrorCode, FrameError,
    Request, Response, ScheduleRequest, ScheduleResult, ServiceError,
};
use crate::retry::{retry, CancelToken, RetryPolicy};

/// Environment variable selecting the scheduler endpoint.
pub const SCHEDULER_URI_ENV: &str = "SCHEDULER_URI";
/// Endpoint used when [`SCHEDULER_URI_ENV`] is not set.
pub const DEFAULT_SCHEDULER_URI: &str = "https://localhost:443";
const DEFAULT_PORT: u16 = 443;

/// Errors from scheduler calls.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Transient transport failure; safe to retry.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Certificate rejected or identity not allowed; never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Scheduler cannot serve the request right now; retry with backoff.
    #[error("Scheduler unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),
}

impl SchedulerError {
    /// Whether a caller may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Connection(_) | SchedulerError::ServiceUnavailable(_)
        )
    }
}

impl From<ServiceError> for SchedulerError {
    fn from(err: ServiceError) -> Self {
        match err.code {
            ErrorCode::Unauthenticated => SchedulerError::Auth(err.message),
            ErrorCode::Unavailable => SchedulerError::ServiceUnavailable(err.message),
            ErrorCode::NotFound => SchedulerError::NotFound(err.message),
            ErrorCode::AlreadyExists | ErrorCode::InvalidArgument | ErrorCode::Internal => {
                SchedulerError::Rejected(err.to_string())
            }
        }
    }
}

/// Host and port of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `https://host[:port][/]` or `host[:port]`; the port defaults to 443.
    pub fn parse(uri: &str) -> Result<Self, SchedulerError> {
        let uri = uri.trim();
        let rest = match uri.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => rest,
            Some((scheme, _)) => {
                return Err(SchedulerError::Config(format!(
                    "Unsupported scheme {:?} in {:?}",
                    scheme, uri
                )))
            }
            None => uri,
        };
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                SchedulerError::Config(format!("Unterminated IPv6 host in {:?}", uri))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => {
                    return Err(SchedulerError::Config(format!(
                        "Invalid authority in {:?}",
                        uri
                    )))
                }
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(SchedulerError::Config(format!("Missing host in {:?}", uri)));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| {
                SchedulerError::Config(format!("Invalid port {:?} in {:?}", port, uri))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Client-side scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler URI, e.g. `https://scheduler.example.com:443`
    pub uri: String,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for each read or write once connected
    pub request_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Settings with the URI taken from `SCHEDULER_URI`, falling back to
    /// [`DEFAULT_SCHEDULER_URI`].
    pub fn from_env() -> Self {
        match std::env::var(SCHEDULER_URI_ENV) {
            Ok(uri) if !uri.trim().is_empty() => Self::new(uri),
            _ => Self::default(),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_SCHEDULER_URI.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
    /// Observed before connecting and after the handshake
    pub cancel: CancelToken,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            timeout: None,
            cancel,
        }
    }
}

/// Client for the scheduling service, bound to one node.
pub struct Scheduler {
    node_id: NodeId,
    network: Network,
    config: SchedulerConfig,
    endpoint: Endpoint,
    tls: TlsConfig,
    client_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    rune: String,
}

impl Scheduler {
    /// Create a client with settings from the environment.
    pub fn new(node_id: NodeId, network: Network, tls: TlsConfig) -> Result<Self, SchedulerError> {
        Self::with_config(node_id, network, tls, SchedulerConfig::from_env())
    }

    /// Create a client with explicit settings.
    pub fn with_config(
        node_id: NodeId,
        network: Network,
        tls: TlsConfig,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let endpoint = Endpoint::parse(&config.uri)?;
        let server_name = server_name(&endpoint.host)?;
        let client_config = tls.client_config()?;
        debug!(
            "Scheduler client for node {} on {} via {}",
            node_id, network, endpoint
        );

        Ok(Self {
            node_id,
            network,
            config,
            endpoint,
            tls,
            client_config,
            server_name,
            rune: String::new(),
        })
    }

    /// Create a client acting with device credentials and their rune.
    pub fn with_credentials(
        credentials: &Credentials,
        network: Network,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let device = credentials.ensure_device()?;
        let scheduler = Self::with_config(
            device.node_id(),
            network,
            device.tls_config().clone(),
            config,
        )?;
        Ok(scheduler.with_rune(device.rune()))
    }

    /// Authorize calls with `rune`, e.g. one carved from the master rune.
    pub fn with_rune(mut self, rune: impl Into<String>) -> Self {
        self.rune = rune.into();
        self
    }

    pub fn rune(&self) -> &str {
        &self.rune
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Check that the scheduler is reachable and accepts our certificate.
    pub fn ping(&self) -> Result<(), SchedulerError> {
        match self.call(&Request::Ping, &CallOptions::default())? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Request a schedule for this node.
    pub fn schedule(&self) -> Result<ScheduleResult, SchedulerError> {
        self.schedule_with(&CallOptions::default())
    }

    /// Request a schedule with a caller-supplied timeout and cancellation token.
    pub fn schedule_with(&self, options: &CallOptions) -> Result<ScheduleResult, SchedulerError> {
        let request = Request::Schedule(ScheduleRequest {
            node_id: self.node_id,
            network: self.network,
            rune: self.rune.clone(),
        });

        match self.call(&request, options)? {
            Response::Scheduled(result) if result.is_empty() => {
                Err(SchedulerError::Protocol("Empty schedule result".to_string()))
            }
            Response::Scheduled(result) => {
                info!("Node {} scheduled at {}", self.node_id, result.grpc_uri);
                Ok(result)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Request a schedule, retrying transient failures according to `policy`.
    pub fn schedule_with_retry(
        &self,
        policy: &RetryPolicy,
        options: &CallOptions,
    ) -> Result<ScheduleResult, SchedulerError> {
        retry(policy, &options.cancel, |_| self.schedule_with(options))
    }

    /// Current assignment of this node, without scheduling it.
    pub fn get_node_info(&self) -> Result<Option<ScheduleResult>, SchedulerError> {
        let request = Request::GetNodeInfo {
            node_id: self.node_id,
            rune: self.rune.clone(),
        };
        match self.call(&request, &CallOptions::default())? {
            Response::NodeInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Register a new node and obtain device credentials for it.
    pub fn register(&self, signer: &Signer) -> Result<Credentials, SchedulerError> {
        self.enroll(signer, ChallengeScope::Register)
    }

    /// Obtain fresh device credentials for an already registered node.
    pub fn recover(&self, signer: &Signer) -> Result<Credentials, SchedulerError> {
        self.enroll(signer, ChallengeScope::Recover)
    }

    fn enroll(
        &self,
        signer: &Signer,
        scope: ChallengeScope,
    ) -> Result<Credentials, SchedulerError> {
        if signer.node_id() != self.node_id || signer.network() != self.network {
            return Err(SchedulerError::Rejected(format!(
                "Signer for {} on {} cannot enroll node {} on {}",
                signer.node_id(),
                signer.network(),
                self.node_id,
                self.network
            )));
        }

        let options = CallOptions::default();
        let challenge_request = Request::GetChallenge(ChallengeRequest {
            node_id: self.node_id,
            scope,
        });
        let challenge = match self.call(&challenge_request, &options)? {
            Response::Challenge { challenge } => challenge,
            other => return Err(unexpected(other)),
        };

        let signature = signer.sign_challenge(&challenge)?;
        let cert_request = CertRequest::generate(&device_common_name(&self.node_id.to_hex()))?;
        let enroll = EnrollRequest {
            node_id: self.node_id,
            network: self.network,
            challenge,
            signature,
            csr: cert_request.csr_pem().to_string(),
        };
        let request = match scope {
            ChallengeScope::Register => Request::Register(enroll),
            ChallengeScope::Recover => Request::Recover(enroll),
        };

        match self.call(&request, &options)? {
            Response::Enrolled(enrolled) => {
                info!("Enrolled device for node {} ({:?})", self.node_id, scope);
                let tls = cert_request
                    .into_tls_config(enrolled.device_cert, self.tls.ca_pem().to_vec());
                Ok(Credentials::Device(DeviceCredentials::new(
                    tls,
                    self.node_id,
                    enrolled.rune,
                )))
            }
            other => Err(unexpected(other)),
        }
    }

    /// Perform one request/response exchange.
    fn call(&self, request: &Request, options: &CallOptions) -> Result<Response, SchedulerError> {
        options.cancel.check()?;
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);

        let mut tcp = self.connect()?;
        tcp.set_read_timeout(Some(timeout)).map_err(classify_io)?;
        tcp.set_write_timeout(Some(timeout)).map_err(classify_io)?;
        tcp.set_nodelay(true).map_err(classify_io)?;

        let mut conn =
            ClientConnection::new(Arc::clone(&self.client_config), self.server_name.clone())
                .map_err(|e| classify_tls(&e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(classify_io)?;
        }
        options.cancel.check()?;

        let response = {
            let mut stream = rustls::Stream::new(&mut conn, &mut tcp);
            write_frame(&mut stream, request).map_err(classify_frame)?;
            read_frame::<_, Response>(&mut stream).map_err(classify_frame)?
        };

        conn.send_close_notify();
        let _ = conn.complete_io(&mut tcp);

        if let Response::Error(err) = response {
            warn!("Scheduler returned error: {}", err);
            return Err(err.into());
        }
        debug!("Received {} response", response.kind());
        Ok(response)
    }

    fn connect(&self) -> Result<TcpStream, SchedulerError> {
        let addrs = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|e| {
                SchedulerError::Connection(format!("Cannot resolve {}: {}", self.endpoint, e))
            })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(SchedulerError::Connection(match last_err {
            Some(e) => format!("Cannot connect to {}: {}", self.endpoint, e),
            None => format!("No addresses for {}", self.endpoint),
        }))
    }
}

fn unexpected(response: Response) -> SchedulerError {
    SchedulerError::Protocol(format!("Unexpected response: {}", response.kind()))
}

fn classify_frame(err: FrameError) -> SchedulerError {
    match err {
        FrameError::Io(e) => classify_io(e),
        other => SchedulerError::Protocol(other.to_string()),
    }
}

/// Map a socket error to `Auth` if it carries a certificate rejection,
/// otherwise to `Connection`.
fn classify_io(err: io::Error) -> SchedulerError {
    if let Some(tls) = err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return classify_tls(tls);
    }
    SchedulerError::Connection(err.to_string())
}

fn classify_tls(err: &rustls::Error) -> SchedulerError {
    match err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            SchedulerError::Auth(err.to_string())
        }
        rustls::Error::AlertReceived(alert) if is_auth_alert(*alert) => {
            SchedulerError::Auth(err.to_string())
        }
        _ => SchedulerError::Connection(err.to_string()),
    }
}

fn is_auth_alert(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied
            | AlertDescription::CertificateRequired
            | AlertDescription::DecryptError
    )
}
