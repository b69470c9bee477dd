//! `heartbeat` – command-line host for a heartbeat kernel.
//!
//! The binary plays two roles:
//!
//! 1. **Host.**  `deploy` constructs a kernel against the wall clock and
//!    persists it to `<state-dir>/deployment.json`.  Every other kernel
//!    operation (`execute`, `extended`, `healthy`, `metadata`,
//!    `deployment-info`, `authority-key`, `protected`, `events`) restores
//!    that deployment and serves one call.
//! 2. **Authority tooling.**  `keygen` creates an authority key pair and
//!    `sign` produces the payload a caller hands to `protected`.
//!
//! Pass `--json` for machine-readable output on stdout.  Logs go to stderr.

mod config;
mod store;
mod telemetry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use ed25519_dalek::SigningKey;
use heartbeat_kernel::env::ChainEnv;
use heartbeat_kernel::replay::encode_claims;
use heartbeat_kernel::{
    AuthoritySigner, HeartbeatKernel, KernelSnapshot, NonceLedger, SystemEnv, TrustedAuthorityKey,
};
use heartbeat_types::{AssertionClaims, AuthorizationPayload, KernelError, Nonce};
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use config::{Config, ConfigError};
use store::{DeploymentLock, DeploymentStore, StoreError};

// ────────────────────────────────────────────────────────────────────────────
// Command line
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "heartbeat", version, about = "Heartbeat kernel host and authority tooling")]
struct Cli {
    /// Directory holding `deployment.json` (overrides config and
    /// `HEARTBEAT_STATE_DIR`).
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default `~/.heartbeat/config.toml`.
    Init {
        /// Hex Ed25519 public key of the trusted authority.
        #[arg(long, value_name = "HEX")]
        authority_key: Option<String>,
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Construct a kernel and persist its deployment record.
    Deploy {
        /// Hex Ed25519 public key of the trusted authority.
        #[arg(long, value_name = "HEX")]
        authority_key: Option<String>,
        /// Enforce single-use nonces on protected heartbeats.
        #[arg(long)]
        replay_protection: bool,
    },
    /// Status and current timestamp.
    Execute,
    /// Status, timestamp, height and uptime.
    Extended,
    /// Liveness probe.
    Healthy,
    /// Kernel name, version and description.
    Metadata,
    /// Deployment time and uptime.
    DeploymentInfo,
    /// The trusted authority's public key.
    AuthorityKey,
    /// Run the authority-gated heartbeat.
    Protected {
        /// Payload JSON produced by `heartbeat sign` (`-` for stdin).
        #[arg(long, value_name = "FILE")]
        payload: PathBuf,
        /// Context string the payload was signed for.
        #[arg(long)]
        context: String,
    },
    /// Heartbeat events emitted by protected calls.
    Events,
    /// Generate an authority key pair.
    Keygen {
        /// Write the secret key (hex) to this file instead of printing it.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Sign an authorization payload for a context.
    Sign {
        /// File holding the hex secret key written by `keygen --out`.
        #[arg(long, value_name = "FILE")]
        key_file: PathBuf,
        /// Context the payload is bound to.
        #[arg(long)]
        context: String,
        /// Assertion as UTF-8 text.
        #[arg(long, conflicts_with_all = ["assertion_hex", "nonce", "nonce_value", "ttl", "attr"])]
        assertion: Option<String>,
        /// Assertion as hex bytes.
        #[arg(long, value_name = "HEX", conflicts_with_all = ["nonce", "nonce_value", "ttl", "attr"])]
        assertion_hex: Option<String>,
        /// Auxiliary data as UTF-8 text.
        #[arg(long, conflicts_with = "auxiliary_hex")]
        auxiliary: Option<String>,
        /// Auxiliary data as hex bytes.
        #[arg(long, value_name = "HEX")]
        auxiliary_hex: Option<String>,
        /// Embed a fresh random nonce in the assertion claims.
        #[arg(long, conflicts_with = "nonce_value")]
        nonce: bool,
        /// Embed this hex nonce in the assertion claims.
        #[arg(long, value_name = "HEX")]
        nonce_value: Option<String>,
        /// Seconds from now after which the assertion expires.
        #[arg(long, value_name = "SECS")]
        ttl: Option<u64>,
        /// Attested attribute carried into the heartbeat event.
        #[arg(long, value_name = "KEY=VALUE")]
        attr: Vec<String>,
        /// Write the payload JSON here instead of stdout.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Print the JSON schema of an authorization payload.
    Schema,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

impl CliError {
    /// Denied or stale authorizations exit with 2 so scripts can tell them
    /// apart from host failures.
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Kernel(KernelError::Authorization(_))
            | CliError::Kernel(KernelError::ExpiredOrReplayed(_)) => 2,
            _ => 1,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Entry point
// ────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let _otel_guard = telemetry::init_tracing("heartbeat");
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut cfg = config::load()?;
    if let Some(dir) = cli.state_dir {
        cfg.state_dir = Some(dir);
    }
    let out = Output { json: cli.json };

    match cli.command {
        Command::Init {
            authority_key,
            force,
        } => cmd_init(&out, authority_key, force),
        Command::Deploy {
            authority_key,
            replay_protection,
        } => cmd_deploy(&out, &cfg, authority_key, replay_protection),
        Command::Execute => {
            let kernel = Host::open(&cfg)?.kernel;
            let beat = kernel.execute();
            out.emit(&beat, || {
                println!("{} {}", beat.status.green().bold(), beat.timestamp);
            })
        }
        Command::Extended => {
            let kernel = Host::open(&cfg)?.kernel;
            let status = kernel.execute_extended()?;
            out.emit(&status, || {
                println!("  status    : {}", status.status.green().bold());
                println!("  timestamp : {}", status.timestamp);
                println!("  height    : {}", status.height);
                println!("  uptime    : {}s", status.uptime);
            })
        }
        Command::Healthy => {
            let healthy = Host::open(&cfg)?.kernel.is_healthy();
            out.emit(&healthy, || {
                if healthy {
                    println!("{}", "healthy".green().bold());
                } else {
                    println!("{}", "unhealthy".red().bold());
                }
            })
        }
        Command::Metadata => {
            let kernel = Host::open(&cfg)?.kernel;
            let meta = kernel.metadata();
            out.emit(meta, || {
                println!("  name        : {}", meta.name.bold());
                println!("  version     : {}", meta.version);
                println!("  description : {}", meta.description.dimmed());
            })
        }
        Command::DeploymentInfo => {
            let kernel = Host::open(&cfg)?.kernel;
            let info = kernel.deployment_info()?;
            out.emit(&info, || {
                println!("  deployed_at : {}", info.deployed_at);
                println!("  uptime      : {}s", info.uptime);
            })
        }
        Command::AuthorityKey => {
            let kernel = Host::open(&cfg)?.kernel;
            let key = kernel.token_authority_public_key().to_hex();
            out.emit(&key, || println!("{key}"))
        }
        Command::Protected { payload, context } => cmd_protected(&out, &cfg, &payload, &context),
        Command::Events => {
            let kernel = Host::open(&cfg)?.kernel;
            let events = kernel.events();
            out.emit(&events, || {
                if events.is_empty() {
                    println!("{}", "  (no heartbeat events)".dimmed());
                }
                for e in events {
                    println!(
                        "  {} {} t={} h={} up={}s",
                        e.id.to_string().dimmed(),
                        e.context.bold(),
                        e.timestamp,
                        e.height,
                        e.uptime
                    );
                    for (k, v) in &e.attributes {
                        println!("      {k} = {v}");
                    }
                }
            })
        }
        Command::Keygen { out: secret_out } => cmd_keygen(&out, secret_out.as_deref()),
        Command::Sign {
            key_file,
            context,
            assertion,
            assertion_hex,
            auxiliary,
            auxiliary_hex,
            nonce,
            nonce_value,
            ttl,
            attr,
            out: payload_out,
        } => {
            let signer = AuthoritySigner::from_hex(read_text(&key_file)?.trim())?;
            let assertion = match (assertion, assertion_hex) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(raw)) => decode_hex_arg("assertion", &raw)?,
                (None, None) => {
                    let now = SystemEnv::new(cfg.block_interval_secs).timestamp();
                    let nonce = match (nonce, nonce_value) {
                        (_, Some(raw)) => Some(Nonce::from_hex(&raw)?),
                        (true, None) => Some(Nonce(rand::random::<[u8; 32]>())),
                        (false, None) => None,
                    };
                    encode_claims(&build_claims(nonce, ttl, &attr, now)?)
                }
            };
            let auxiliary = match (auxiliary, auxiliary_hex) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(raw)) => decode_hex_arg("auxiliary", &raw)?,
                (None, None) => Vec::new(),
            };
            let payload = signer.sign(&assertion, &auxiliary, &context);
            let raw = serde_json::to_string_pretty(&payload)?;
            match payload_out {
                Some(path) => {
                    std::fs::write(&path, raw).map_err(|source| CliError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    if !out.json {
                        println!("{} payload written to {}", "✓".green(), path.display());
                    }
                }
                None => println!("{raw}"),
            }
            Ok(())
        }
        Command::Schema => {
            let schema = schemars::schema_for!(AuthorizationPayload);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

fn cmd_init(out: &Output, authority_key: Option<String>, force: bool) -> Result<(), CliError> {
    let path = config::config_path();
    if path.exists() && !force {
        return Err(CliError::Usage(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    let mut cfg = Config::default();
    if let Some(key) = authority_key {
        // Reject junk before it lands in the config file.
        TrustedAuthorityKey::from_hex(&key)?;
        cfg.authority_public_key = key;
    }
    config::save(&cfg)?;
    out.emit(&cfg, || {
        println!("{} config written to {}", "✓".green(), path.display());
    })
}

fn cmd_deploy(
    out: &Output,
    cfg: &Config,
    authority_key: Option<String>,
    replay_protection: bool,
) -> Result<(), CliError> {
    let key_hex = authority_key.unwrap_or_else(|| cfg.authority_public_key.clone());
    if key_hex.trim().is_empty() {
        return Err(CliError::Usage(
            "no authority key: pass --authority-key or set HEARTBEAT_AUTHORITY_KEY".to_string(),
        ));
    }
    let key = TrustedAuthorityKey::from_hex(key_hex.trim())?;
    let env = Arc::new(SystemEnv::new(cfg.block_interval_secs));

    let mut kernel =
        HeartbeatKernel::deploy(cfg.identity(), key, env)?.with_event_capacity(cfg.max_events);
    if replay_protection || cfg.replay_protection {
        kernel = kernel.with_replay_guard(Box::new(NonceLedger::new()));
    }

    let store = DeploymentStore::in_dir(&cfg.resolved_state_dir());
    store.create(&kernel.snapshot())?;

    let report = DeployReport {
        state_file: store.path().to_path_buf(),
        deployed_at: kernel.deployment_record().deployed_at,
        deployed_height: kernel.deployment_record().deployed_height,
        execute: kernel.execute(),
        healthy: kernel.is_healthy(),
        metadata: kernel.metadata().clone(),
        authority_key: kernel.token_authority_public_key().to_hex(),
        replay_protection: kernel.snapshot().replay_protection,
    };
    out.emit(&report, || {
        println!("{} {}", "✓ deployed".green().bold(), report.metadata.name.bold());
        println!("  state file      : {}", report.state_file.display());
        println!("  deployed_at     : {}", report.deployed_at);
        println!("  deployed_height : {}", report.deployed_height);
        println!("  authority key   : {}", report.authority_key);
        println!("  replay guard    : {}", report.replay_protection);
        println!();
        println!("  self-test");
        println!(
            "    execute  → {} {}",
            report.execute.status.green(),
            report.execute.timestamp
        );
        println!("    healthy  → {}", report.healthy);
        println!(
            "    metadata → {} {}",
            report.metadata.name, report.metadata.version
        );
    })
}

fn cmd_protected(out: &Output, cfg: &Config, payload: &Path, context: &str) -> Result<(), CliError> {
    let raw = if payload == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).map_err(|source| CliError::Io {
            path: payload.to_path_buf(),
            source,
        })?
    } else {
        read_text(payload)?
    };
    let payload: AuthorizationPayload = serde_json::from_str(&raw).map_err(|e| {
        KernelError::MalformedPayload(format!("payload is not valid JSON: {e}"))
    })?;

    let mut host = Host::open(cfg)?;
    let receipt = host.kernel.protected_heartbeat(&payload, context)?;
    host.commit()?;
    drop(host);

    out.emit(&receipt, || {
        println!("{} {}", receipt.status.green().bold(), receipt.event.context.bold());
        println!("  event     : {}", receipt.event.id);
        println!("  timestamp : {}", receipt.event.timestamp);
        println!("  height    : {}", receipt.event.height);
        println!("  uptime    : {}s", receipt.event.uptime);
        println!("  digest    : {}", receipt.event.message_digest.dimmed());
        for (k, v) in &receipt.event.attributes {
            println!("  {k} = {v}");
        }
    })
}

fn cmd_keygen(out: &Output, secret_out: Option<&Path>) -> Result<(), CliError> {
    let signer = AuthoritySigner::new(SigningKey::generate(&mut OsRng));
    let public_key = signer.trusted_key().to_hex();

    let report = match secret_out {
        Some(path) => {
            let contents = format!("{}\n", signer.secret_hex());
            store::write_owner_only(path, contents.as_bytes(), true).map_err(|source| {
                CliError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            KeygenReport {
                public_key,
                secret_key: None,
                secret_key_file: Some(path.to_path_buf()),
            }
        }
        None => {
            warn!("printing an authority secret key to stdout");
            KeygenReport {
                public_key,
                secret_key: Some(signer.secret_hex()),
                secret_key_file: None,
            }
        }
    };
    out.emit(&report, || {
        println!("  public key : {}", report.public_key.bold());
        if let Some(secret) = &report.secret_key {
            println!("  secret key : {}", secret.red());
        }
        if let Some(path) = &report.secret_key_file {
            println!("  secret key : written to {}", path.display());
        }
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

/// A deployment restored from disk, ready to serve one call.
///
/// Holds the deployment lock until dropped, so a protected call and the
/// save that follows it cannot interleave with another process.
struct Host {
    store: DeploymentStore,
    kernel: HeartbeatKernel,
    loaded: KernelSnapshot,
    _lock: DeploymentLock,
}

impl Host {
    fn open(cfg: &Config) -> Result<Self, CliError> {
        let store = DeploymentStore::in_dir(&cfg.resolved_state_dir());
        let lock = store.lock()?;
        let snapshot = store.load()?;
        let loaded = snapshot.clone();
        debug!(path = %store.path().display(), events = snapshot.events.len(), "deployment loaded");
        let env: Arc<dyn ChainEnv> = Arc::new(SystemEnv::anchored(
            snapshot.record.deployed_at,
            snapshot.record.deployed_height,
            cfg.block_interval_secs,
        ));
        let kernel =
            HeartbeatKernel::restore(snapshot, env)?.with_event_capacity(cfg.max_events);
        Ok(Self {
            store,
            kernel,
            loaded,
            _lock: lock,
        })
    }

    /// Persist the kernel's current state over the snapshot it was opened
    /// from.
    fn commit(&mut self) -> Result<(), CliError> {
        let next = self.kernel.snapshot();
        self.store.update(&self.loaded, &next)?;
        self.loaded = next;
        Ok(())
    }
}

struct Output {
    json: bool,
}

impl Output {
    /// Print `value` as JSON with `--json`, otherwise run `human`.
    fn emit<T: Serialize + ?Sized>(&self, value: &T, human: impl FnOnce()) -> Result<(), CliError> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DeployReport {
    state_file: PathBuf,
    deployed_at: u64,
    deployed_height: u64,
    execute: heartbeat_types::Heartbeat,
    healthy: bool,
    metadata: heartbeat_types::KernelIdentity,
    authority_key: String,
    replay_protection: bool,
}

#[derive(Serialize)]
struct KeygenReport {
    public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key_file: Option<PathBuf>,
}

fn read_text(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_hex_arg(name: &str, raw: &str) -> Result<Vec<u8>, CliError> {
    let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(trimmed).map_err(|e| CliError::Usage(format!("--{name}-hex is not valid hex: {e}")))
}

/// Parse `KEY=VALUE`.  The key must be non-empty; the value may contain `=`.
fn parse_attr(raw: &str) -> Result<(String, String), CliError> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(CliError::Usage(format!(
            "attribute `{raw}` must look like KEY=VALUE"
        ))),
    }
}

/// Assemble assertion claims; `ttl` is measured from `now`.
fn build_claims(
    nonce: Option<Nonce>,
    ttl: Option<u64>,
    attrs: &[String],
    now: u64,
) -> Result<AssertionClaims, CliError> {
    let not_after = match ttl {
        Some(secs) => Some(
            now.checked_add(secs)
                .ok_or_else(|| CliError::Usage(format!("--ttl {secs} overflows the clock")))?,
        ),
        None => None,
    };
    let attributes = attrs
        .iter()
        .map(|a| parse_attr(a))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(AssertionClaims {
        nonce,
        not_after,
        attributes,
    })
}
