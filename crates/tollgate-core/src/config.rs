//! Gateway configuration.
//!
//! Every setting has a default; `GatewayConfig::from_env` overlays
//! `TOLLGATE_*` variables on top and `validate` rejects combinations that
//! cannot work.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{GatewayError, Role};
use crate::queue::RetryPolicy;

const PREFIX: &str = "TOLLGATE_";
const BUDGET_PREFIX: &str = "TOLLGATE_BUDGET_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Worker pool, lease and drain settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    /// Claim lease. A worker that stops renewing loses the task after this.
    pub lease: Duration,
    pub renew_interval: Duration,
    /// Sleep between empty polls while IDLE.
    pub idle_poll: Duration,
    /// Only claim tasks submitted under this role.
    pub role_filter: Option<Role>,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Orchestrator control-loop tick.
    pub tick: Duration,
    /// How long a kill-switch drain waits for in-flight work.
    pub drain_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            lease: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            idle_poll: Duration::from_millis(100),
            role_filter: None,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            tick: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

/// Per-principal budget allocations for one accounting period (a UTC day).
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Allocation for principals without an explicit entry.
    pub default_allocation: Decimal,
    pub allocations: BTreeMap<String, Decimal>,
    /// Fraction of the allocation committed before a warning is logged.
    pub warn_ratio: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_allocation: dec!(1.00),
            allocations: BTreeMap::new(),
            warn_ratio: dec!(0.8),
        }
    }
}

impl LedgerConfig {
    pub fn allocation_for(&self, principal: &str) -> Decimal {
        self.allocations
            .get(principal)
            .copied()
            .unwrap_or(self.default_allocation)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Identical failure signatures within `window` that trip the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    /// A HALF_OPEN trial permit not resolved within this is abandoned.
    /// Must be longer than the backend timeout.
    pub trial_timeout: Duration,
    pub history_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(120),
            history_capacity: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Every filesystem target must resolve inside this directory.
    pub sandbox_root: PathBuf,
    /// Hosts a task may address. Anything else is denied.
    pub allowed_endpoints: Vec<String>,
    pub max_prompt_chars: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("./workspace"),
            allowed_endpoints: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            max_prompt_chars: 8_000,
        }
    }
}

/// One routing tier: tasks up to `max_chars` long go to `model`.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSpec {
    pub name: String,
    pub model: String,
    pub estimate: Decimal,
    /// `None` means unbounded.
    pub max_chars: Option<usize>,
}

impl TierSpec {
    pub fn new(name: &str, model: &str, estimate: Decimal, max_chars: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            estimate,
            max_chars,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub backend: String,
    pub timeout: Duration,
    /// Ordered cheapest first.
    pub tiers: Vec<TierSpec>,
    /// Priority at or above which a task is bumped one tier up.
    pub escalate_priority: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backend: "offline".to_string(),
            timeout: Duration::from_secs(30),
            tiers: vec![
                TierSpec::new("light", "tollgate-light", dec!(0.005), Some(400)),
                TierSpec::new("standard", "tollgate-standard", dec!(0.02), Some(2_000)),
                TierSpec::new("heavy", "tollgate-heavy", dec!(0.08), None),
            ],
            escalate_priority: 8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    /// JSON Lines file. In-memory only when unset.
    pub jsonl_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub worker: WorkerConfig,
    pub ledger: LedgerConfig,
    pub breaker: BreakerConfig,
    pub safety: SafetyConfig,
    pub router: RouterConfig,
    pub audit: AuditConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the config from an explicit variable set.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = EnvSource::new(vars);
        let defaults = GatewayConfig::default();

        let worker = WorkerConfig {
            pool_size: env.parse_optional_env("WORKERS", defaults.worker.pool_size)?,
            lease: env.parse_duration_ms_env("LEASE_MS", defaults.worker.lease)?,
            renew_interval: env.parse_duration_ms_env("RENEW_MS", defaults.worker.renew_interval)?,
            idle_poll: env.parse_duration_ms_env("IDLE_POLL_MS", defaults.worker.idle_poll)?,
            role_filter: env
                .optional_env("ROLE_FILTER")
                .map(|s| {
                    s.parse::<Role>()
                        .map_err(|e| invalid("TOLLGATE_ROLE_FILTER", e))
                })
                .transpose()?,
            max_attempts: env.parse_optional_env("MAX_ATTEMPTS", defaults.worker.max_attempts)?,
            retry: RetryPolicy {
                base_delay: env
                    .parse_duration_ms_env("RETRY_BASE_MS", defaults.worker.retry.base_delay)?,
                multiplier: env
                    .parse_optional_env("RETRY_MULTIPLIER", defaults.worker.retry.multiplier)?,
            },
            tick: env.parse_duration_ms_env("TICK_MS", defaults.worker.tick)?,
            drain_timeout: env
                .parse_duration_ms_env("DRAIN_TIMEOUT_MS", defaults.worker.drain_timeout)?,
            reaper_interval: env
                .parse_duration_ms_env("REAPER_INTERVAL_MS", defaults.worker.reaper_interval)?,
        };

        let mut allocations = BTreeMap::new();
        for (key, value) in env.with_prefix(BUDGET_PREFIX) {
            if key == "DEFAULT" {
                continue;
            }
            allocations.insert(key.to_lowercase(), parse_decimal(&format!("{BUDGET_PREFIX}{key}"), value)?);
        }
        let ledger = LedgerConfig {
            default_allocation: env
                .parse_decimal_env("BUDGET_DEFAULT", defaults.ledger.default_allocation)?,
            allocations,
            warn_ratio: env.parse_decimal_env("LEDGER_WARN_RATIO", defaults.ledger.warn_ratio)?,
        };

        let breaker = BreakerConfig {
            failure_threshold: env
                .parse_optional_env("BREAKER_THRESHOLD", defaults.breaker.failure_threshold)?,
            window: env.parse_duration_ms_env("BREAKER_WINDOW_MS", defaults.breaker.window)?,
            cooldown: env.parse_duration_ms_env("BREAKER_COOLDOWN_MS", defaults.breaker.cooldown)?,
            trial_timeout: env
                .parse_duration_ms_env("BREAKER_TRIAL_TIMEOUT_MS", defaults.breaker.trial_timeout)?,
            history_capacity: env
                .parse_optional_env("BREAKER_HISTORY", defaults.breaker.history_capacity)?,
        };

        let safety = SafetyConfig {
            sandbox_root: env
                .optional_env("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.safety.sandbox_root),
            allowed_endpoints: env
                .parse_list_env("ALLOWED_ENDPOINTS")
                .unwrap_or(defaults.safety.allowed_endpoints),
            max_prompt_chars: env
                .parse_optional_env("MAX_PROMPT_CHARS", defaults.safety.max_prompt_chars)?,
        };

        let router = RouterConfig {
            backend: env
                .optional_env("BACKEND")
                .unwrap_or(defaults.router.backend),
            timeout: env.parse_duration_ms_env("BACKEND_TIMEOUT_MS", defaults.router.timeout)?,
            tiers: defaults.router.tiers,
            escalate_priority: env
                .parse_optional_env("ESCALATE_PRIORITY", defaults.router.escalate_priority)?,
        };

        let audit = AuditConfig {
            jsonl_path: env.optional_env("AUDIT_PATH").map(PathBuf::from),
        };

        Ok(Self {
            worker,
            ledger,
            breaker,
            safety,
            router,
            audit,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.pool_size == 0 {
            return Err(ConfigError::Invalid("worker pool size must be at least 1".into()));
        }
        if self.worker.lease.is_zero() {
            return Err(ConfigError::Invalid("lease must be positive".into()));
        }
        if self.worker.renew_interval.is_zero() || self.worker.renew_interval >= self.worker.lease {
            return Err(ConfigError::Invalid(format!(
                "renew interval {:?} must be positive and shorter than the lease {:?}",
                self.worker.renew_interval, self.worker.lease
            )));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".into()));
        }
        if !(self.worker.retry.multiplier.is_finite() && self.worker.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("retry multiplier must be >= 1".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker failure threshold must be at least 1".into()));
        }
        if self.breaker.trial_timeout <= self.router.timeout {
            return Err(ConfigError::Invalid(format!(
                "breaker trial timeout {:?} must be longer than the backend timeout {:?}",
                self.breaker.trial_timeout, self.router.timeout
            )));
        }
        if self.breaker.history_capacity == 0 {
            return Err(ConfigError::Invalid("breaker history capacity must be at least 1".into()));
        }
        if self.ledger.default_allocation.is_sign_negative()
            || self.ledger.allocations.values().any(|a| a.is_sign_negative())
        {
            return Err(ConfigError::Invalid("budget allocations must not be negative".into()));
        }
        if self.ledger.warn_ratio <= Decimal::ZERO || self.ledger.warn_ratio > Decimal::ONE {
            return Err(ConfigError::Invalid("budget warn ratio must be in (0, 1]".into()));
        }
        if self.router.tiers.is_empty() {
            return Err(ConfigError::Invalid("router needs at least one tier".into()));
        }
        if self.router.backend.trim().is_empty() {
            return Err(ConfigError::Invalid("router backend name is empty".into()));
        }
        Ok(())
    }
}

/// Variable lookup with the `TOLLGATE_` prefix applied.
struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(k, _)| k.starts_with(PREFIX))
                .collect(),
        }
    }

    /// Unset and blank are the same thing.
    fn optional_env(&self, key: &str) -> Option<String> {
        self.vars
            .get(&format!("{PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_optional_env<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional_env(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| invalid(&format!("{PREFIX}{key}"), e)),
            None => Ok(default),
        }
    }

    fn parse_duration_ms_env(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.optional_env(key) {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| invalid(&format!("{PREFIX}{key}"), e)),
            None => Ok(default),
        }
    }

    fn parse_decimal_env(&self, key: &str, default: Decimal) -> Result<Decimal, ConfigError> {
        match self.optional_env(key) {
            Some(raw) => parse_decimal(&format!("{PREFIX}{key}"), &raw),
            None => Ok(default),
        }
    }

    fn parse_list_env(&self, key: &str) -> Option<Vec<String>> {
        self.optional_env(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
    }

    /// `(suffix, value)` for every variable starting with `prefix`.
    fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.vars
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|s| (s, v.as_str())))
            .filter(|(s, v)| !s.is_empty() && !v.trim().is_empty())
    }
}

fn parse_decimal(key: &str, raw: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(raw.trim()).map_err(|e| invalid(key, e))
}

fn invalid(key: &str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: err.to_string(),
    }
}
