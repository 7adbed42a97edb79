use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "SESSIONPULSE_";

/// Top-level configuration for the sessionpulse engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Session store connection configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Heartbeat coalescing buffer configuration.
    #[serde(default)]
    pub coalescer: CoalescerConfig,

    /// Liveness reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Postgres connection configuration for the session store.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres host:port (e.g., "localhost:5432").
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "sessionpulse".
    #[serde(default = "default_database")]
    pub database: String,

    /// Postgres username.
    #[serde(default)]
    pub username: String,

    /// Postgres password.
    #[serde(default)]
    pub password: String,

    /// Upper bound on pooled connections. Default: 5.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Time to wait for a pooled connection. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Apply embedded migrations on startup. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Heartbeat coalescing buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoalescerConfig {
    /// Maximum buffered heartbeats before new ones are dropped. Default: 1000.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Buffer length that triggers an immediate flush. Default: 100.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Maximum time a heartbeat waits before being flushed. Default: 5s.
    #[serde(default = "default_flush_delay", with = "humantime_serde")]
    pub flush_delay: Duration,

    /// Records per merge statement. Default: 250.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Time shutdown waits for an in-flight flush. Default: 3s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Liveness reaper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Run the reaper in this process. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between stale-session scans. Default: 60s.
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Heartbeat silence after which an open session is closed. Default: 180s.
    #[serde(default = "default_reaper_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database() -> String {
    "sessionpulse".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    1000
}

fn default_flush_threshold() -> usize {
    100
}

fn default_flush_delay() -> Duration {
    Duration::from_millis(5000)
}

fn default_chunk_size() -> usize {
    250
}

fn default_shutdown_grace() -> Duration {
    Duration::from_millis(3000)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reaper_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            coalescer: CoalescerConfig::default(),
            reaper: ReaperConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_threshold: default_flush_threshold(),
            flush_delay: default_flush_delay(),
            chunk_size: default_chunk_size(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval: default_reaper_interval(),
            timeout: default_reaper_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply `SESSIONPULSE_*`
    /// environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Build configuration from defaults and `SESSIONPULSE_*` environment
    /// variables alone, then validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        cfg.apply_env_overrides(lookup)?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse configuration from YAML text without validating it.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Overlay values from the environment.
    ///
    /// `lookup` receives the full variable name (e.g. `SESSIONPULSE_FLUSH_DELAY`)
    /// and returns its value when set.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }

        if let Some(v) = get("DATABASE_ENDPOINT") {
            self.database.endpoint = v;
        }
        if let Some(v) = get("DATABASE_NAME") {
            self.database.database = v;
        }
        if let Some(v) = get("DATABASE_USERNAME") {
            self.database.username = v;
        }
        if let Some(v) = get("DATABASE_PASSWORD") {
            self.database.password = v;
        }

        if let Some(v) = get("BUFFER_CAPACITY") {
            self.coalescer.capacity = parse_count("BUFFER_CAPACITY", &v)?;
        }
        if let Some(v) = get("FLUSH_THRESHOLD") {
            self.coalescer.flush_threshold = parse_count("FLUSH_THRESHOLD", &v)?;
        }
        if let Some(v) = get("FLUSH_DELAY") {
            self.coalescer.flush_delay = parse_duration("FLUSH_DELAY", &v)?;
        }
        if let Some(v) = get("CHUNK_SIZE") {
            self.coalescer.chunk_size = parse_count("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.coalescer.shutdown_grace = parse_duration("SHUTDOWN_GRACE", &v)?;
        }

        if let Some(v) = get("REAPER_INTERVAL") {
            self.reaper.interval = parse_duration("REAPER_INTERVAL", &v)?;
        }
        if let Some(v) = get("REAPER_TIMEOUT") {
            self.reaper.timeout = parse_duration("REAPER_TIMEOUT", &v)?;
        }

        if let Some(v) = get("HEALTH_ADDR") {
            self.health.addr = v;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.endpoint.is_empty() {
            bail!("database.endpoint is required");
        }

        if self.database.max_connections == 0 {
            bail!("database.max_connections must be positive");
        }

        self.coalescer.validate()?;

        if self.reaper.interval.is_zero() {
            bail!("reaper.interval must be positive");
        }

        if self.reaper.timeout.is_zero() {
            bail!("reaper.timeout must be positive");
        }

        Ok(())
    }
}

impl CoalescerConfig {
    /// Validate buffer sizing and timing.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("coalescer.capacity must be positive");
        }

        if self.flush_threshold == 0 {
            bail!("coalescer.flush_threshold must be positive");
        }

        if self.flush_threshold > self.capacity {
            bail!(
                "coalescer.flush_threshold ({}) must not exceed coalescer.capacity ({})",
                self.flush_threshold,
                self.capacity
            );
        }

        if self.flush_delay.is_zero() {
            bail!("coalescer.flush_delay must be positive");
        }

        if self.chunk_size == 0 {
            bail!("coalescer.chunk_size must be positive");
        }

        Ok(())
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .with_context(|| format!("{ENV_PREFIX}{name}: invalid count {value:?}"))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("{ENV_PREFIX}{name}: invalid duration {value:?}"))
}
