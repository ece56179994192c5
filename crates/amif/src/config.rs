//! Configuration management for AMIF nodes.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use amif_common::AmifError;
use amif_common::constants::{
    DEFAULT_ADMIN_ADDR, DEFAULT_DEAD_RETENTION_MS, DEFAULT_DEAD_TIMEOUT_MS, DEFAULT_FANOUT,
    DEFAULT_GOSSIP_BIND_ADDR, DEFAULT_GOSSIP_INTERVAL_MS, DEFAULT_MAX_DIGEST_ENTRIES,
    DEFAULT_REDIS_URL, DEFAULT_SEND_TIMEOUT_MS, DEFAULT_SUSPECT_TIMEOUT_MS, options,
};

/// Free-form module options, as given at registration
pub type ModuleOptions = HashMap<String, Value>;

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Admin HTTP listen address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// Use the in-process storage backend instead of Redis
    #[serde(default)]
    pub in_memory: bool,

    /// The module hosted by this process
    #[serde(default)]
    pub module: ModuleRegistration,

    /// Gossip / failure detector settings
    #[serde(default)]
    pub gossip: DiscoveryConfig,

    /// Topics the built-in monitor subscribes to
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

/// Module registration interface: a name plus free-form options
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleRegistration {
    /// Unique module name, also the membership id
    #[serde(default = "generate_module_name")]
    pub name: String,

    /// Options; gossip tunables recognised by name
    #[serde(default)]
    pub options: ModuleOptions,
}

impl ModuleRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ModuleOptions::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

impl Default for ModuleRegistration {
    fn default() -> Self {
        Self::new(generate_module_name())
    }
}

/// Discovery service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Local gossip bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address peers should use to reach us (defaults to the bound address)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Bootstrap addresses contacted while no peer is known
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Suspicion timeout for clusters of up to ten members; see
    /// [`DiscoveryConfig::suspect_timeout_for`]
    #[serde(default = "default_suspect_timeout")]
    pub suspect_timeout_ms: u64,

    #[serde(default = "default_dead_timeout")]
    pub dead_timeout_ms: u64,

    /// How long DEAD records are kept before removal
    #[serde(default = "default_dead_retention")]
    pub dead_retention_ms: u64,

    /// Peers contacted per round
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Per-send bound; must stay below the gossip interval
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_max_digest_entries")]
    pub max_digest_entries: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval_ms: default_gossip_interval(),
            suspect_timeout_ms: default_suspect_timeout(),
            dead_timeout_ms: default_dead_timeout(),
            dead_retention_ms: default_dead_retention(),
            fanout: default_fanout(),
            send_timeout_ms: default_send_timeout(),
            max_digest_entries: default_max_digest_entries(),
        }
    }
}

impl DiscoveryConfig {
    /// Override tunables from module registration options.
    ///
    /// Unknown keys are left for the module itself.
    pub fn apply_options(&mut self, opts: &ModuleOptions) -> Result<(), AmifError> {
        if let Some(v) = opts.get(options::GOSSIP_INTERVAL_MS) {
            self.gossip_interval_ms = option_u64(options::GOSSIP_INTERVAL_MS, v)?;
        }
        if let Some(v) = opts.get(options::SUSPECT_TIMEOUT_MS) {
            self.suspect_timeout_ms = option_u64(options::SUSPECT_TIMEOUT_MS, v)?;
        }
        if let Some(v) = opts.get(options::DEAD_TIMEOUT_MS) {
            self.dead_timeout_ms = option_u64(options::DEAD_TIMEOUT_MS, v)?;
        }
        if let Some(v) = opts.get(options::DEAD_RETENTION_MS) {
            self.dead_retention_ms = option_u64(options::DEAD_RETENTION_MS, v)?;
        }
        if let Some(v) = opts.get(options::FANOUT) {
            self.fanout = option_u64(options::FANOUT, v)? as usize;
        }
        if let Some(v) = opts.get(options::SEND_TIMEOUT_MS) {
            self.send_timeout_ms = option_u64(options::SEND_TIMEOUT_MS, v)?;
        }
        if let Some(v) = opts.get(options::MAX_DIGEST_ENTRIES) {
            self.max_digest_entries = option_u64(options::MAX_DIGEST_ENTRIES, v)? as usize;
        }
        Ok(())
    }

    /// Suspicion timeout for a table of `members` entries.
    ///
    /// Gossip needs O(log N) rounds to carry a heartbeat across the cluster,
    /// so the configured timeout is stretched by `log10(members)` once the
    /// cluster grows past ten.
    pub fn suspect_timeout_for(&self, members: usize) -> u64 {
        let scale = (members.max(1) as f64).log10().max(1.0);
        (self.suspect_timeout_ms as f64 * scale).ceil() as u64
    }

    /// Reject settings the failure detector cannot work with
    pub fn validate(&self) -> Result<(), AmifError> {
        let positive = [
            (options::GOSSIP_INTERVAL_MS, self.gossip_interval_ms),
            (options::SUSPECT_TIMEOUT_MS, self.suspect_timeout_ms),
            (options::DEAD_TIMEOUT_MS, self.dead_timeout_ms),
            (options::SEND_TIMEOUT_MS, self.send_timeout_ms),
            (options::FANOUT, self.fanout as u64),
            (options::MAX_DIGEST_ENTRIES, self.max_digest_entries as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AmifError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.send_timeout_ms >= self.gossip_interval_ms {
            return Err(AmifError::Config(format!(
                "send_timeout_ms ({}) must be shorter than gossip_interval_ms ({})",
                self.send_timeout_ms, self.gossip_interval_ms
            )));
        }

        Ok(())
    }
}

fn option_u64(name: &str, value: &Value) -> Result<u64, AmifError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        AmifError::Config(format!("{} must be a non-negative integer, got {}", name, value))
    })
}

/// Command-line overrides applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub redis_url: Option<String>,
    pub module_name: Option<String>,
    pub gossip_bind: Option<String>,
    pub advertise_addr: Option<String>,
    pub seeds: Vec<String>,
    pub admin_addr: Option<String>,
    pub in_memory: bool,
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_admin_addr() -> String { DEFAULT_ADMIN_ADDR.to_string() }
fn default_bind_addr() -> String { DEFAULT_GOSSIP_BIND_ADDR.to_string() }
fn default_gossip_interval() -> u64 { DEFAULT_GOSSIP_INTERVAL_MS }
fn default_suspect_timeout() -> u64 { DEFAULT_SUSPECT_TIMEOUT_MS }
fn default_dead_timeout() -> u64 { DEFAULT_DEAD_TIMEOUT_MS }
fn default_dead_retention() -> u64 { DEFAULT_DEAD_RETENTION_MS }
fn default_fanout() -> usize { DEFAULT_FANOUT }
fn default_send_timeout() -> u64 { DEFAULT_SEND_TIMEOUT_MS }
fn default_max_digest_entries() -> usize { DEFAULT_MAX_DIGEST_ENTRIES }
fn default_topics() -> Vec<String> {
    vec![
        amif_common::constants::topics::MEMBERSHIP.to_string(),
        amif_common::constants::topics::STATUS.to_string(),
    ]
}

fn generate_module_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("module-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(overrides);

        // Registration options win over the file's [gossip] table
        config
            .gossip
            .apply_options(&config.module.options)
            .context("Invalid module options")?;
        config.gossip.validate().context("Invalid gossip configuration")?;

        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref redis_url) = overrides.redis_url {
            self.redis_url = redis_url.clone();
        }
        if let Some(ref name) = overrides.module_name {
            self.module.name = name.clone();
        }
        if let Some(ref bind) = overrides.gossip_bind {
            self.gossip.bind_addr = bind.clone();
        }
        if let Some(ref advertise) = overrides.advertise_addr {
            self.gossip.advertise_addr = Some(advertise.clone());
        }
        if !overrides.seeds.is_empty() {
            self.gossip.seeds = overrides.seeds.clone();
        }
        if let Some(ref admin) = overrides.admin_addr {
            self.admin_addr = admin.clone();
        }
        if overrides.in_memory {
            self.in_memory = true;
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            admin_addr: default_admin_addr(),
            in_memory: false,
            module: ModuleRegistration::default(),
            gossip: DiscoveryConfig::default(),
            topics: default_topics(),
        }
    }
}
