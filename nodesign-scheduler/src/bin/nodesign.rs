//! Command-line client for the nodesign scheduler.

use clap::{Args as ClapArgs, Parser, Subcommand};
use nodesign_scheduler::{
    CallOptions, Credentials, CredentialsError, DefRules, DevCerts, DeviceCredentials, RetryPolicy,
    RuneFactory, Scheduler, SchedulerConfig, SchedulerError, ServerError, DEFAULT_SCHEDULER_URI,
};
use runeauth::Rune;
use nodesign_signer::{Hsmd, Network, Seed, Signer, SignerError, SoftHsmd};
use nodesign_tls::{TlsConfig, TlsError};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Client for the nodesign scheduler.
#[derive(Parser, Debug)]
#[command(name = "nodesign")]
#[command(about = "Register, recover and schedule nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the node id derived from a seed
    NodeId(SeedArgs),
    /// Register a new node and write its device credentials
    Register(EnrollArgs),
    /// Recover device credentials for a registered node
    Recover(EnrollArgs),
    /// Request a schedule for a node
    Schedule(DeviceArgs),
    /// Show the current assignment of a node
    NodeInfo(DeviceArgs),
    /// Refresh device credentials that predate rune issuance
    Upgrade(UpgradeArgs),
    /// Carve a restricted rune from the device credentials' rune
    CarveRune {
        /// Device credentials file
        #[arg(long)]
        credentials: PathBuf,

        /// Allow only Get*/List* methods
        #[arg(long)]
        readonly: bool,

        /// Allow the pay method
        #[arg(long)]
        pay: bool,
    },
    /// Print backend and configuration diagnostics
    Diagnostics,
    /// Generate a development CA, scheduler and nobody certificates
    DevCerts {
        /// Output directory
        #[arg(long)]
        out: PathBuf,

        /// Host names or IPs the scheduler certificate is valid for
        #[arg(long = "host", default_values = ["localhost", "127.0.0.1"])]
        hosts: Vec<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct SeedArgs {
    /// Node seed as 64 hex characters
    #[arg(long, env = "NODESIGN_SEED", hide_env_values = true)]
    seed: String,

    /// Network the node runs on
    #[arg(long, env = "NODESIGN_NETWORK", default_value = "bitcoin")]
    network: Network,
}

#[derive(ClapArgs, Debug)]
struct ConnectArgs {
    /// Scheduler URI
    #[arg(long, env = "SCHEDULER_URI", default_value = DEFAULT_SCHEDULER_URI)]
    uri: String,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(ClapArgs, Debug)]
struct EnrollArgs {
    #[command(flatten)]
    seed: SeedArgs,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Directory with the nobody identity (ca.pem, cert.pem, key.pem)
    #[arg(long)]
    nobody_dir: PathBuf,

    /// Where to write the device credentials
    #[arg(long)]
    credentials: PathBuf,
}

#[derive(ClapArgs, Debug)]
struct UpgradeArgs {
    #[command(flatten)]
    seed: SeedArgs,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Device credentials file, rewritten in place
    #[arg(long)]
    credentials: PathBuf,
}

#[derive(ClapArgs, Debug)]
struct DeviceArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Device credentials file written by `register` or `recover`
    #[arg(long)]
    credentials: PathBuf,

    /// Network the node runs on
    #[arg(long, env = "NODESIGN_NETWORK", default_value = "bitcoin")]
    network: Network,

    /// Attempts for transient failures
    #[arg(long, default_value_t = 1)]
    attempts: u32,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Rune error: {0}")]
    Rune(String),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::NodeId(args) => {
            let seed = Seed::from_hex(&args.seed)?;
            let node_id = SoftHsmd::new()
                .node_id(&seed, args.network)
                .map_err(SignerError::from)?;
            println!("{}", node_id);
        }
        Command::Register(args) => enroll(args, false)?,
        Command::Recover(args) => enroll(args, true)?,
        Command::Schedule(args) => {
            let scheduler = device_scheduler(&args)?;
            let policy = RetryPolicy {
                max_attempts: args.attempts,
                ..RetryPolicy::default()
            };
            let options = CallOptions::with_timeout(Duration::from_secs(args.connect.timeout));
            let result = scheduler.schedule_with_retry(&policy, &options)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::NodeInfo(args) => {
            let scheduler = device_scheduler(&args)?;
            let info = scheduler.get_node_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Upgrade(args) => upgrade(args)?,
        Command::CarveRune {
            credentials,
            readonly,
            pay,
        } => {
            let creds = DeviceCredentials::from_path(&credentials)?;
            let origin = Rune::from_base64(creds.rune())
                .map_err(|e| CliError::Rune(format!("{:?}", e)))?;
            let rules = match (readonly, pay) {
                (true, true) => vec![DefRules::Add(&[DefRules::ReadOnly, DefRules::Pay])],
                (true, false) => vec![DefRules::ReadOnly],
                (false, true) => vec![DefRules::Pay],
                (false, false) => vec![],
            };
            let carved = RuneFactory::carve(&origin, &rules)
                .map_err(|e| CliError::Rune(format!("{:?}", e)))?;
            println!("{}", carved);
        }
        Command::Diagnostics => {
            let hsmd = SoftHsmd::new().info();
            let uri = SchedulerConfig::from_env().uri;
            let report = json!({
                "version": env!("CARGO_PKG_VERSION"),
                "hsmd": {
                    "name": hsmd.name,
                    "version": hsmd.version,
                    "location": hsmd.location,
                },
                "scheduler_uri": uri,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DevCerts { out, hosts } => {
            let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
            DevCerts::generate(&hosts)?.write_to_dir(&out)?;
            info!("Development certificates written to {:?}", out);
        }
    }
    Ok(())
}

fn enroll(args: EnrollArgs, recover: bool) -> Result<(), CliError> {
    let nobody = Credentials::nobody(TlsConfig::from_dir(&args.nobody_dir)?)?;
    let seed = Seed::from_hex(&args.seed.seed)?;
    let signer = Signer::from_seed(seed, args.seed.network, nobody.tls_config().clone())?;

    let config = connect_config(&args.connect);
    let scheduler = Scheduler::with_config(
        signer.node_id(),
        signer.network(),
        nobody.tls_config().clone(),
        config,
    )?;
    let creds = if recover {
        scheduler.recover(&signer)?
    } else {
        scheduler.register(&signer)?
    };

    creds.ensure_device()?.write_to_path(&args.credentials)?;
    info!(
        "Device credentials for {} written to {:?}",
        signer.node_id(),
        args.credentials
    );
    Ok(())
}

fn upgrade(args: UpgradeArgs) -> Result<(), CliError> {
    let seed = Seed::from_hex(&args.seed.seed)?;
    let creds = Credentials::Device(DeviceCredentials::from_path(&args.credentials)?);
    let signer = Signer::from_seed(seed, args.seed.network, creds.tls_config().clone())?;

    let scheduler =
        Scheduler::with_credentials(&creds, args.seed.network, connect_config(&args.connect))?;
    let upgraded = creds.upgrade(&scheduler, &signer)?;
    upgraded.ensure_device()?.write_to_path(&args.credentials)?;
    info!("Credentials for {} are up to date", signer.node_id());
    Ok(())
}

fn device_scheduler(args: &DeviceArgs) -> Result<Scheduler, CliError> {
    let creds = Credentials::Device(DeviceCredentials::from_path(&args.credentials)?);
    Ok(Scheduler::with_credentials(&creds, args.network, connect_config(&args.connect))?)
}

fn connect_config(args: &ConnectArgs) -> SchedulerConfig {
    let config = SchedulerConfig::new(args.uri.clone());
    let connect_timeout = config.connect_timeout;
    config.with_timeouts(connect_timeout, Duration::from_secs(args.timeout))
}
