//! Ledger service configuration.
//!
//! Library types take these structs through their constructors; only the
//! binary reads the environment, via [`LedgerConfig::from_env`].

use std::time::Duration;

use ledgercore_ledger::HistoryPolicy;

/// In-process account guard configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Serialize same-account operations inside the process.
    pub enabled: bool,
    /// Number of lock stripes.
    pub shards: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: 64,
        }
    }
}

/// Transaction orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fast-reject debits and transfers that the current balance cannot cover
    /// before opening a unit of work.
    pub advisory_precheck: bool,
    /// What a failed history append does to the unit.
    pub history_policy: HistoryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            advisory_precheck: true,
            history_policy: HistoryPolicy::Atomic,
        }
    }
}

/// Balance reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Page size used when a caller passes no limit.
    pub default_page_limit: u32,
    /// Largest page a caller may request.
    pub max_page_limit: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            default_page_limit: 50,
            max_page_limit: 500,
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Database URL.
    pub database_url: String,
    /// Connection pool size.
    pub max_connections: u32,
    pub guard: GuardConfig,
    pub orchestrator: OrchestratorConfig,
    pub reader: ReaderConfig,
    /// Interval between reconciliation sweeps.
    pub reconcile_interval: Duration,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/ledgercore".to_string(),
            max_connections: 20,
            guard: GuardConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            reader: ReaderConfig::default(),
            reconcile_interval: Duration::from_secs(300),
            log_level: "info".to_string(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(value) = lookup("LEDGER_MAX_CONNECTIONS") {
            config.max_connections = value
                .parse()
                .map_err(|_| format!("LEDGER_MAX_CONNECTIONS: invalid number {value:?}"))?;
        }

        if let Some(value) = lookup("LEDGER_GUARD_SHARDS") {
            config.guard.shards = value
                .parse()
                .map_err(|_| format!("LEDGER_GUARD_SHARDS: invalid number {value:?}"))?;
        }

        if let Some(value) = lookup("LEDGER_GUARD_ENABLED") {
            config.guard.enabled = parse_bool(&value)
                .ok_or_else(|| format!("LEDGER_GUARD_ENABLED: invalid flag {value:?}"))?;
        }

        if let Some(value) = lookup("LEDGER_HISTORY_POLICY") {
            config.orchestrator.history_policy = value
                .parse()
                .map_err(|e| format!("LEDGER_HISTORY_POLICY: {e}"))?;
        }

        if let Some(value) = lookup("LEDGER_ADVISORY_PRECHECK") {
            config.orchestrator.advisory_precheck = parse_bool(&value)
                .ok_or_else(|| format!("LEDGER_ADVISORY_PRECHECK: invalid flag {value:?}"))?;
        }

        if let Some(value) = lookup("LEDGER_RECONCILE_INTERVAL_SECS") {
            let secs: u64 = value
                .parse()
                .map_err(|_| format!("LEDGER_RECONCILE_INTERVAL_SECS: invalid number {value:?}"))?;
            config.reconcile_interval = Duration::from_secs(secs);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("Connection pool size cannot be 0".to_string());
        }

        if self.guard.shards == 0 {
            return Err("Guard shard count cannot be 0".to_string());
        }

        if self.reader.max_page_limit == 0 {
            return Err("Maximum page limit cannot be 0".to_string());
        }

        if self.reader.default_page_limit > self.reader.max_page_limit {
            return Err("Default page limit cannot exceed maximum page limit".to_string());
        }

        if self.reconcile_interval.is_zero() {
            return Err("Reconcile interval cannot be 0".to_string());
        }

        Ok(())
    }
}
