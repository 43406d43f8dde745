//! # Settlement Configuration
//!
//! Register identity, tax defaults, reader selection and ledger policy.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                            │
//! │     MERIDIAN_REGISTER_ID=reg-02                                         │
//! │     MERIDIAN_TAX_RATE_BPS=675                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                    │
//! │     ~/.config/meridian-pos/settlement.toml (Linux)                      │
//! │     ~/Library/Application Support/com.meridian.pos/settlement.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # settlement.toml
//! [register]
//! id = "reg-01"
//! location_id = "loc-downtown"
//!
//! [tax]
//! default_rate_bps = 675   # 6.75%
//!
//! [terminal]
//! allow_reader_fallback = true
//! [terminal.default_readers]
//! loc-downtown = "tmr_front_counter"
//!
//! [gateway]
//! request_timeout_secs = 30
//! pending_ttl_secs = 1800
//!
//! [ledger]
//! free_charge_threshold_cents = 1
//! duplicate_window_secs = 0
//!
//! [outbox]
//! max_attempts = 10
//! batch_size = 50
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use meridian_core::validation::validate_tax_rate_bps;
use meridian_core::{Money, TaxRate};

use crate::error::{SettlementError, SettlementResult};

// =============================================================================
// Register
// =============================================================================

/// Identity of this register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Register code, printed in receipt numbers.
    #[serde(default = "default_register_id")]
    pub id: String,

    /// Location used when no shift supplies one (reader selection).
    #[serde(default = "default_location_id")]
    pub location_id: String,
}

fn default_register_id() -> String {
    "reg-01".to_string()
}

fn default_location_id() -> String {
    "default-location".to_string()
}

impl Default for RegisterConfig {
    fn default() -> Self {
        RegisterConfig {
            id: default_register_id(),
            location_id: default_location_id(),
        }
    }
}

// =============================================================================
// Tax
// =============================================================================

/// Flat tax applied when the caller does not pass a rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxConfig {
    #[serde(default)]
    pub default_rate_bps: u32,
}

impl TaxConfig {
    pub fn default_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.default_rate_bps)
    }
}

// =============================================================================
// Terminal
// =============================================================================

/// Card reader selection.
///
/// ## Selection Order
/// ```text
/// default_readers[location_id] ──► online? ──► use it
///          │ missing / offline
///          ▼
/// allow_reader_fallback? ──► first online reader
///          │ no / none online
///          ▼
/// NoReaderAvailable
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Location id → reader id.
    #[serde(default)]
    pub default_readers: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub allow_reader_fallback: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TerminalConfig {
    fn default() -> Self {
        TerminalConfig {
            default_readers: HashMap::new(),
            allow_reader_fallback: true,
        }
    }
}

impl TerminalConfig {
    pub fn default_reader_for(&self, location_id: &str) -> Option<&str> {
        self.default_readers.get(location_id).map(String::as_str)
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Bounds on remote calls to the gateway and terminal service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Hosted card checkouts not finalized within this many seconds are
    /// dropped by the router's expiry sweep.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pending_ttl() -> u64 {
    1800
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            request_timeout_secs: default_request_timeout(),
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

// =============================================================================
// Ledger Policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Card charges at or below this are skipped and settled as free.
    #[serde(default = "default_free_charge_threshold")]
    pub free_charge_threshold_cents: i64,

    /// Rejects a gift card redeem when the same card had a redeem of the
    /// same amount within this many seconds. 0 disables the scan; the
    /// idempotency key is the primary guard.
    #[serde(default)]
    pub duplicate_window_secs: u64,
}

fn default_free_charge_threshold() -> i64 {
    1
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            free_charge_threshold_cents: default_free_charge_threshold(),
            duplicate_window_secs: 0,
        }
    }
}

impl LedgerConfig {
    pub fn free_charge_threshold(&self) -> Money {
        Money::from_cents(self.free_charge_threshold_cents)
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Attempts before an entry is left for an operator.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Entries replayed per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    50
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
        }
    }
}

// =============================================================================
// Main Settlement Configuration
// =============================================================================

/// Complete settlement configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementConfig {
    #[serde(default)]
    pub register: RegisterConfig,

    #[serde(default)]
    pub tax: TaxConfig,

    #[serde(default)]
    pub terminal: TerminalConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl SettlementConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (settlement.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SettlementResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading settlement config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load settlement config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SettlementResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SettlementError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettlementError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SettlementError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Settlement config saved");
        Ok(())
    }

    pub fn validate(&self) -> SettlementResult<()> {
        if self.register.id.trim().is_empty() {
            return Err(SettlementError::InvalidConfig("register.id is required".into()));
        }

        validate_tax_rate_bps(self.tax.default_rate_bps)
            .map_err(|e| SettlementError::InvalidConfig(e.to_string()))?;

        if self.ledger.free_charge_threshold_cents < 0 {
            return Err(SettlementError::InvalidConfig(
                "ledger.free_charge_threshold_cents cannot be negative".into(),
            ));
        }

        if self.gateway.request_timeout_secs == 0 || self.gateway.pending_ttl_secs == 0 {
            return Err(SettlementError::InvalidConfig(
                "gateway.request_timeout_secs and gateway.pending_ttl_secs must be greater than 0".into(),
            ));
        }

        if self.outbox.batch_size == 0 || self.outbox.max_attempts == 0 {
            return Err(SettlementError::InvalidConfig(
                "outbox.batch_size and outbox.max_attempts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `MERIDIAN_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("MERIDIAN_REGISTER_ID") {
            debug!(register_id = %id, "Overriding register ID from environment");
            self.register.id = id;
        }

        if let Some(location) = lookup("MERIDIAN_LOCATION_ID") {
            self.register.location_id = location;
        }

        if let Some(bps) = lookup("MERIDIAN_TAX_RATE_BPS") {
            match bps.parse::<u32>() {
                Ok(b) => self.tax.default_rate_bps = b,
                Err(_) => warn!(value = %bps, "Ignoring unparsable MERIDIAN_TAX_RATE_BPS"),
            }
        }

        if let Some(secs) = lookup("MERIDIAN_GATEWAY_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.gateway.request_timeout_secs = s;
            }
        }

        if let Some(fallback) = lookup("MERIDIAN_READER_FALLBACK") {
            match fallback.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.terminal.allow_reader_fallback = true,
                "0" | "false" | "no" => self.terminal.allow_reader_fallback = false,
                _ => warn!(value = %fallback, "Unknown MERIDIAN_READER_FALLBACK value"),
            }
        }

        if let Some(secs) = lookup("MERIDIAN_DUPLICATE_WINDOW_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                debug!(secs = s, "Overriding duplicate window from environment");
                self.ledger.duplicate_window_secs = s;
            }
        }

        if let Some(attempts) = lookup("MERIDIAN_OUTBOX_MAX_ATTEMPTS") {
            if let Ok(a) = attempts.parse::<u32>() {
                self.outbox.max_attempts = a;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "meridian", "pos")
            .map(|dirs| dirs.config_dir().join("settlement.toml"))
    }
}
