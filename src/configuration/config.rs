use super::types::SuccessThreshold;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `storage_root`.
pub const STORAGE_ROOT_ENV: &str = "DOMECAP_STORAGE_ROOT";

/// Application configuration structure that defines all runtime parameters.
///
/// The configuration is read from a TOML file; every field has a default so an
/// empty file (or no file at all) yields a usable coordinator. Command-line
/// flags from [`CliArgs`] are applied on top with [`Config::apply_cli`].
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use domecap::configuration::Config;
///
/// let config = Config::from_file(Path::new("domecap.toml")).unwrap();
/// println!("Serving uploads on port {}", config.http_port);
/// ```
///
/// # Fields Overview
///
/// - `bind_address`, `http_port`: where the HTTP surface (uploads, session API) listens
/// - `storage_root`: root of the per-session directories
/// - `image_extension`: file extension of the opaque image blobs produced by the nodes
/// - `session_deadline_secs`: time after which a session is finalized regardless of outstanding nodes
/// - `max_attempts`: capture attempts allowed per node per session (1 disables retries)
/// - `success_threshold`: verdict policy for partial coverage
/// - `node_freshness_secs`: liveness window defining the default roster
/// - `max_upload_bytes`: upper bound for a single image payload
/// - `trigger_delay_ms`: lead time between trigger publication and the scheduled capture instant
/// - `bus_capacity`, `bus_prefix`: status bus buffer size and subject prefix
/// - `retained_sessions`: finalized sessions kept in memory before being served from disk
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Network address the HTTP server binds to.
    pub bind_address: String,

    /// TCP port of the HTTP server.
    pub http_port: u16,

    /// Directory holding one sub-directory per session plus the orphan bucket.
    pub storage_root: PathBuf,

    /// Extension used for stored image files, without the leading dot.
    pub image_extension: String,

    /// Session deadline in seconds, measured from the trigger.
    pub session_deadline_secs: u64,

    /// Maximum capture attempts per node within one session.
    pub max_attempts: u32,

    /// Verdict policy for sessions where only part of the roster succeeded.
    pub success_threshold: SuccessThreshold,

    /// A node whose last liveness announcement is older than this is left out of the default roster.
    pub node_freshness_secs: u64,

    /// Largest accepted image payload in bytes.
    pub max_upload_bytes: usize,

    /// Delay between trigger publication and the capture instant announced to the nodes.
    ///
    /// Values below 100 ms are raised to 100 ms when the trigger is built.
    pub trigger_delay_ms: u64,

    /// Number of messages buffered per status bus subscriber.
    pub bus_capacity: usize,

    /// Root of the status bus subjects, e.g. `dome/rig01`.
    pub bus_prefix: String,

    /// Finalized sessions kept in memory.
    pub retained_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
            storage_root: PathBuf::from("data/uploads"),
            image_extension: "jpg".to_string(),
            session_deadline_secs: 30,
            max_attempts: 2,
            success_threshold: SuccessThreshold::default(),
            node_freshness_secs: 60,
            max_upload_bytes: 8 * 1024 * 1024,
            trigger_delay_ms: 300,
            bus_capacity: 256,
            bus_prefix: "dome/rig01".to_string(),
            retained_sessions: 64,
        }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file, then applies environment overrides.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Config::from_toml_str(&raw)?;
        config.apply_env();
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parses a TOML document without touching the environment.
    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    /// Applies `DOMECAP_STORAGE_ROOT` if it is set and not empty.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(STORAGE_ROOT_ENV) {
            if !dir.trim().is_empty() {
                info!("Using storage root from {}: {}", STORAGE_ROOT_ENV, dir);
                self.storage_root = PathBuf::from(dir);
            }
        }
    }

    /// Applies command-line overrides. Flags that were not given leave the value untouched.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.http_port = port;
        }
        if let Some(ref root) = args.storage_root {
            self.storage_root = root.clone();
        }
        if let Some(threshold) = args.success_threshold {
            self.success_threshold = threshold;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_deadline_secs == 0 {
            return Err(ConfigError::NotInRange(
                "session_deadline_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == SuccessThreshold::AtLeast(0) {
            return Err(ConfigError::NotInRange(
                "success_threshold must require at least one node".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::NotInRange(
                "max_upload_bytes must be greater than 0".to_string(),
            ));
        }
        if self.bus_capacity == 0 {
            return Err(ConfigError::NotInRange(
                "bus_capacity must be greater than 0".to_string(),
            ));
        }
        if self.image_extension.is_empty()
            || !self.image_extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::InvalidValue(format!(
                "image_extension must be alphanumeric, got {:?}",
                self.image_extension
            )));
        }
        Ok(())
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.session_deadline_secs)
    }

    pub fn node_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_freshness_secs as i64)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }
}

/// Command-line arguments of the coordinator binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "domecap")]
#[command(version)]
#[command(about = "Synchronized multi-view capture coordinator")]
pub struct CliArgs {
    /// Optional TOML configuration file
    pub config_file: Option<PathBuf>,

    /// Overrides `http_port`
    #[arg(long)]
    pub port: Option<u16>,

    /// Overrides `storage_root`
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Overrides `success_threshold`: `all` or a positive integer
    #[arg(long)]
    pub success_threshold: Option<SuccessThreshold>,

    /// Runs this many in-process simulated camera nodes against the coordinator
    #[arg(long, default_value_t = 0)]
    pub simulate_nodes: usize,
}
