//! Configuration management for the Meshwire server
//!
//! Values are layered: the YAML file first, then `MESHWIRE__*` environment
//! variables, then command line flags.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use meshwire_xds::{DebounceOptions, DiscoveryServerConfig};

use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

pub const SERVER_ID: &str = "meshwire.server.id";
pub const XDS_ADDRESS: &str = "meshwire.xds.address";
pub const XDS_PORT: &str = "meshwire.xds.port";
pub const DEBUG_PORT: &str = "meshwire.debug.port";
pub const DEBUG_UNSAFE_ENDPOINTS: &str = "meshwire.debug.unsafe_endpoints.enabled";
pub const DEBUG_TRUSTED_PROXIES: &str = "meshwire.debug.trusted_proxies";
pub const FLOW_CONTROL: &str = "meshwire.push.flow_control.enabled";
pub const PUSH_CONCURRENCY: &str = "meshwire.push.concurrency";
pub const DEBOUNCE_ENABLED: &str = "meshwire.push.debounce.enabled";
pub const DEBOUNCE_AFTER_MS: &str = "meshwire.push.debounce.after_ms";
pub const DEBOUNCE_MAX_MS: &str = "meshwire.push.debounce.max_ms";
pub const DEBOUNCE_EDS: &str = "meshwire.push.debounce.eds";
pub const ROOT_NAMESPACE: &str = "meshwire.mesh.root_namespace";
pub const MESH_FILE: &str = "meshwire.mesh.file";
pub const CACHE_CAPACITY: &str = "meshwire.cache.capacity";
pub const LEDGER_CAPACITY: &str = "meshwire.ledger.capacity";
pub const LOGS_PATH: &str = "meshwire.logs.path";
pub const LOGS_LEVEL: &str = "meshwire.logs.level";
pub const LOGS_CONSOLE: &str = "meshwire.logs.console.enabled";
pub const LOGS_FILE: &str = "meshwire.logs.file.enabled";
pub const LOGS_JSON: &str = "meshwire.logs.json.enabled";

const DEFAULT_XDS_PORT: u16 = 15010;
const DEFAULT_DEBUG_PORT: u16 = 15014;

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "meshwire-server", version, about = "Meshwire xDS control plane")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "MESHWIRE_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long = "xds-port")]
    pub xds_port: Option<u16>,
    #[arg(long = "debug-port")]
    pub debug_port: Option<u16>,
    /// Hold pushes until the proxy answers the previous one
    #[arg(long = "flow-control")]
    pub flow_control: Option<bool>,
    /// Mesh configuration seeded into the store at startup
    #[arg(long = "mesh-file")]
    pub mesh_file: Option<PathBuf>,
}

/// Application configuration loaded from config files and environment
#[derive(Debug, Clone)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => File::from(path.as_path()).format(FileFormat::Yaml),
            None => File::with_name(DEFAULT_CONFIG_FILE)
                .format(FileFormat::Yaml)
                .required(false),
        };

        let mut builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix("MESHWIRE")
                .prefix_separator("__")
                .separator("__")
                .keep_prefix(true)
                .try_parsing(true),
        );

        if let Some(v) = args.xds_port {
            builder = builder.set_override(XDS_PORT, i64::from(v))?;
        }
        if let Some(v) = args.debug_port {
            builder = builder.set_override(DEBUG_PORT, i64::from(v))?;
        }
        if let Some(v) = args.flow_control {
            builder = builder.set_override(FLOW_CONTROL, v)?;
        }
        if let Some(v) = args.mesh_file {
            builder = builder.set_override(MESH_FILE, v.to_string_lossy().to_string())?;
        }

        let config = builder.build().with_context(|| match &args.config {
            Some(path) => format!("failed to load configuration from {}", path.display()),
            None => format!("failed to load configuration from {}", DEFAULT_CONFIG_FILE),
        })?;

        Ok(Configuration { config })
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn server_id(&self) -> String {
        self.config
            .get_string(SERVER_ID)
            .unwrap_or("meshwire".to_string())
    }

    pub fn xds_address(&self) -> String {
        self.config
            .get_string(XDS_ADDRESS)
            .unwrap_or("0.0.0.0".to_string())
    }

    pub fn xds_port(&self) -> u16 {
        self.config
            .get_int(XDS_PORT)
            .unwrap_or(DEFAULT_XDS_PORT.into()) as u16
    }

    pub fn debug_port(&self) -> u16 {
        self.config
            .get_int(DEBUG_PORT)
            .unwrap_or(DEFAULT_DEBUG_PORT.into()) as u16
    }

    pub fn debug_unsafe_endpoints(&self) -> bool {
        self.config.get_bool(DEBUG_UNSAFE_ENDPOINTS).unwrap_or(false)
    }

    /// Addresses allowed to forward the debug identity header
    pub fn debug_trusted_proxies(&self) -> anyhow::Result<Vec<IpAddr>> {
        let addresses: Vec<String> = match self.config.get(DEBUG_TRUSTED_PROXIES) {
            Ok(addresses) => addresses,
            Err(ConfigError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e).context("invalid meshwire.debug.trusted_proxies"),
        };
        addresses
            .iter()
            .map(|a| {
                a.trim()
                    .parse::<IpAddr>()
                    .map(|ip| ip.to_canonical())
                    .with_context(|| format!("invalid trusted proxy address {}", a))
            })
            .collect()
    }

    // ========================================================================
    // Push Configuration
    // ========================================================================

    pub fn flow_control(&self) -> bool {
        self.config.get_bool(FLOW_CONTROL).unwrap_or(false)
    }

    pub fn push_concurrency(&self) -> usize {
        self.config.get_int(PUSH_CONCURRENCY).unwrap_or(100).max(1) as usize
    }

    pub fn debounce(&self) -> DebounceOptions {
        DebounceOptions {
            enabled: self.config.get_bool(DEBOUNCE_ENABLED).unwrap_or(true),
            after: Duration::from_millis(
                self.config.get_int(DEBOUNCE_AFTER_MS).unwrap_or(100).max(0) as u64,
            ),
            max: Duration::from_millis(
                self.config.get_int(DEBOUNCE_MAX_MS).unwrap_or(10_000).max(0) as u64,
            ),
            eds: self.config.get_bool(DEBOUNCE_EDS).unwrap_or(true),
        }
    }

    // ========================================================================
    // Mesh Configuration
    // ========================================================================

    pub fn root_namespace(&self) -> String {
        self.config
            .get_string(ROOT_NAMESPACE)
            .unwrap_or("mesh-system".to_string())
    }

    pub fn mesh_file(&self) -> PathBuf {
        self.config
            .get_string(MESH_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("conf/mesh.yml"))
    }

    pub fn cache_capacity(&self) -> u64 {
        self.config.get_int(CACHE_CAPACITY).unwrap_or(20_000).max(0) as u64
    }

    pub fn ledger_capacity(&self) -> u64 {
        self.config.get_int(LEDGER_CAPACITY).unwrap_or(128).max(0) as u64
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string(LOGS_PATH).ok(),
            self.config.get_bool(LOGS_CONSOLE).unwrap_or(true),
            self.config.get_bool(LOGS_FILE).unwrap_or(true),
            self.config.get_bool(LOGS_JSON).unwrap_or(false),
            self.config
                .get_string(LOGS_LEVEL)
                .unwrap_or("info".to_string()),
        )
    }

    /// Settings handed to the discovery server
    pub fn to_discovery_config(&self) -> DiscoveryServerConfig {
        DiscoveryServerConfig {
            server_id: self.server_id(),
            flow_control: self.flow_control(),
            push_concurrency: self.push_concurrency(),
            debounce: self.debounce(),
            root_namespace: self.root_namespace(),
            cache_capacity: self.cache_capacity(),
            ledger_capacity: self.ledger_capacity(),
            ..Default::default()
        }
    }
}
