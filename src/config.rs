use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::decision::candidates::normalize_instrument;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Secret string wiped from memory on drop and never printed
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretString(***)")
    }
}

/// Bounded exponential backoff used for reconnects and lease renewal
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0.25 = up to +25%)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.25
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Renew the lease after this fraction of its validity window
    #[serde(default = "default_renew_fraction")]
    pub renew_fraction: f64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
    #[serde(default)]
    pub renewal: BackoffConfig,
    /// Capacity of the order-event channel feeding the decision loop
    #[serde(default = "default_order_channel_capacity")]
    pub order_channel_capacity: usize,
    /// Ceiling on a single renew/revoke call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_renew_fraction() -> f64 {
    0.5
}

fn default_order_channel_capacity() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl StreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            renew_fraction: default_renew_fraction(),
            reconnect: BackoffConfig::default(),
            renewal: BackoffConfig {
                initial_ms: 2_000,
                max_ms: 120_000,
                ..BackoffConfig::default()
            },
            order_channel_capacity: default_order_channel_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long an on-demand fetch may be served again
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConfig {
    /// Seconds between cycle starts
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Number of most recent trades fed back as performance
    #[serde(default = "default_performance_window")]
    pub performance_window: usize,
    /// Hard ceiling on one provider call
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// How long `stop` waits for an in-flight cycle before giving up on it
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    180
}

fn default_performance_window() -> usize {
    20
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_stop_timeout_secs() -> u64 {
    300
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            performance_window: default_performance_window(),
            provider_timeout_secs: default_provider_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl DecisionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum concurrent open positions per agent
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Leverage cap for instruments without an explicit entry
    #[serde(default = "default_leverage_cap")]
    pub default_leverage_cap: u32,
    /// Per-instrument leverage caps (e.g. BTCUSDT = 10)
    #[serde(default, deserialize_with = "instrument_keys")]
    pub leverage_caps: HashMap<String, u32>,
    /// Largest open notional as a multiple of account equity
    #[serde(default = "default_notional_cap")]
    pub default_notional_cap: Decimal,
    /// Per-instrument notional multiples (e.g. BTCUSDT = 10)
    #[serde(default, deserialize_with = "instrument_keys")]
    pub notional_caps: HashMap<String, Decimal>,
    /// Opens must carry both a stop loss and a take profit
    #[serde(default = "default_require_protection")]
    pub require_protection: bool,
}

fn default_max_open_positions() -> usize {
    3
}

fn default_leverage_cap() -> u32 {
    5
}

fn default_notional_cap() -> Decimal {
    Decimal::new(15, 1)
}

fn default_require_protection() -> bool {
    true
}

/// `config` lowercases table keys; instruments are matched upper-case.
fn instrument_keys<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: Deserialize<'de>,
{
    let raw = HashMap::<String, V>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(instrument, value)| (normalize_instrument(&instrument), value))
        .collect())
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            default_leverage_cap: default_leverage_cap(),
            leverage_caps: HashMap::new(),
            default_notional_cap: default_notional_cap(),
            notional_caps: HashMap::new(),
            require_protection: default_require_protection(),
        }
    }
}

impl RiskConfig {
    pub fn leverage_cap(&self, instrument: &str) -> u32 {
        self.leverage_caps
            .get(&normalize_instrument(instrument))
            .copied()
            .unwrap_or(self.default_leverage_cap)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Trade history and ledger files; persistence is off when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Per-cycle audit records; file auditing is off when unset
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
    /// Audit records older than this are deleted; kept forever when unset
    #[serde(default)]
    pub audit_retention_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One agent: one account, one decision provider
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub exchange: ExchangeSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub candidates: CandidateSettings,
    /// Overrides `decision.interval_secs` for this agent
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    /// binance | paper
    pub kind: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<SecretString>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Starting balance for the paper exchange
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

fn default_paper_balance() -> Decimal {
    Decimal::from(10_000)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// OpenAI-compatible base URL, e.g. https://api.deepseek.com/v1
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_provider_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_provider_http_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateSettings {
    #[serde(default)]
    pub instruments: Vec<String>,
    /// JSON endpoint returning a symbol list; `instruments` is the fallback
    #[serde(default)]
    pub pool_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overlay (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("AUTOTRADER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // AUTOTRADER_CACHE__TTL_SECS=5 etc.
            .add_source(
                Environment::with_prefix("AUTOTRADER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Agents with `enabled = true`
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(self.stream.renew_fraction > 0.0 && self.stream.renew_fraction < 1.0) {
            errors.push("stream.renew_fraction must be between 0 and 1".to_string());
        }

        for (name, backoff) in [
            ("stream.reconnect", &self.stream.reconnect),
            ("stream.renewal", &self.stream.renewal),
        ] {
            if backoff.initial_ms == 0 || backoff.max_ms < backoff.initial_ms {
                errors.push(format!("{name}: need 0 < initial_ms <= max_ms"));
            }
            if backoff.multiplier < 1.0 {
                errors.push(format!("{name}.multiplier must be >= 1"));
            }
            if !(0.0..=1.0).contains(&backoff.jitter) {
                errors.push(format!("{name}.jitter must be between 0 and 1"));
            }
        }

        if self.stream.order_channel_capacity == 0 {
            errors.push("stream.order_channel_capacity must be positive".to_string());
        }

        if self.decision.interval_secs == 0 {
            errors.push("decision.interval_secs must be positive".to_string());
        }

        if self.decision.performance_window == 0 {
            errors.push("decision.performance_window must be positive".to_string());
        }

        if self.decision.provider_timeout_secs == 0 {
            errors.push("decision.provider_timeout_secs must be positive".to_string());
        }

        if self.risk.default_leverage_cap == 0 {
            errors.push("risk.default_leverage_cap must be at least 1".to_string());
        }

        for (instrument, cap) in &self.risk.leverage_caps {
            if *cap == 0 {
                errors.push(format!("risk.leverage_caps.{instrument} must be at least 1"));
            }
        }

        if self.risk.default_notional_cap <= Decimal::ZERO {
            errors.push("risk.default_notional_cap must be positive".to_string());
        }

        for (instrument, cap) in &self.risk.notional_caps {
            if *cap <= Decimal::ZERO {
                errors.push(format!("risk.notional_caps.{instrument} must be positive"));
            }
        }

        if self.storage.audit_retention_days == Some(0) {
            errors.push("storage.audit_retention_days must be positive".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                errors.push("agent id must not be empty".to_string());
            }
            if !seen.insert(agent.id.clone()) {
                errors.push(format!("duplicate agent id '{}'", agent.id));
            }
            if agent.interval_secs == Some(0) {
                errors.push(format!("agent '{}': interval_secs must be positive", agent.id));
            }
            if crate::exchange::parse_exchange_kind(&agent.exchange.kind).is_err() {
                errors.push(format!(
                    "agent '{}': unknown exchange kind '{}'",
                    agent.id, agent.exchange.kind
                ));
            }
            if agent.provider.base_url.trim().is_empty() {
                errors.push(format!("agent '{}': provider.base_url is empty", agent.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg = parse("");
        assert_eq!(cfg.cache.ttl_secs, 10);
        assert_eq!(cfg.decision.performance_window, 20);
        assert_eq!(cfg.stream.renew_fraction, 0.5);
        assert_eq!(cfg.risk.leverage_cap("BTCUSDT"), 5);
        assert!(cfg.risk.require_protection);
        assert_eq!(cfg.storage.audit_retention_days, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn agent_section_parses_and_hides_secrets() {
        let cfg = parse(
            r#"
            [risk]
            max_open_positions = 4
            [risk.leverage_caps]
            BTCUSDT = 10
            [risk.notional_caps]
            ETHUSDT = 10

            [[agents]]
            id = "alpha"
            name = "Alpha"
            [agents.exchange]
            kind = "binance"
            api_key = "key"
            api_secret = "shh"
            [agents.provider]
            base_url = "https://api.deepseek.com/v1"
            model = "deepseek-chat"
            "#,
        );

        assert_eq!(cfg.risk.leverage_cap("BTCUSDT"), 10);
        assert_eq!(cfg.risk.leverage_cap("DOGEUSDT"), 5);
        assert_eq!(cfg.risk.notional_caps.get("ETHUSDT"), Some(&Decimal::from(10)));
        let agent = &cfg.agents[0];
        assert!(agent.enabled);
        assert_eq!(agent.display_name(), "Alpha");
        let secret = agent.exchange.api_secret.as_ref().unwrap();
        assert_eq!(secret.expose(), "shh");
        assert!(!format!("{:?}", agent.exchange).contains("shh"));
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut cfg = parse("");
        cfg.stream.renew_fraction = 1.5;
        cfg.decision.interval_secs = 0;
        cfg.risk.default_leverage_cap = 0;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
