/// config.rs — Centralised configuration loaded from .env
///
/// All parameters consumed by the trading engine are defined here.
/// Loading happens once at startup; the binary hands each section to the
/// component that owns it. `from_lookup` takes the variable source as a
/// closure so the parsing rules can be tested without touching the process
/// environment.
use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use secrecy::SecretString;

use crate::exchange::Credentials;

/// Sizing defaults: never commit more than half the equity as margin, and
/// keep a quarter of what remains in reserve.
pub const DEFAULT_MAX_TOTAL_MARGIN_RATIO: f64 = 0.5;
pub const DEFAULT_MARGIN_SAFETY_BUFFER:   f64 = 0.75;
/// AI-supplied quantity accepted within ±20% of the computed reference
pub const DEFAULT_QUANTITY_TOLERANCE:     f64 = 0.2;

pub const DEFAULT_REST_URL: &str = "https://www.okx.com";

#[derive(Debug)]
pub struct AppConfig {
    pub models:    Vec<ModelConfig>,
    pub symbols:   Vec<SymbolConfig>,
    pub sizing:    SizingConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub exchange:  ExchangeConfig,
    pub storage:   StorageConfig,
}

// ── Models ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ModelConfig {
    /// Lower-case key, e.g. `deepseek`
    pub key:         String,
    pub display:     String,
    pub credentials: Credentials,
    pub provider:    ProviderConfig,
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug)]
pub struct ProviderConfig {
    pub api_key:      SecretString,
    pub model:        String,
    pub base_url:     String,
    pub timeout_secs: u64,
    pub temperature:  f64,
}

// ── Instruments ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolConfig {
    /// Exchange instrument id, e.g. `BTC-USDT-SWAP`
    pub inst_id:          String,
    pub display:          String,
    /// Smallest base quantity worth trading
    pub min_base_amount:  f64,
    pub leverage_min:     u32,
    pub leverage_default: u32,
    pub leverage_max:     u32,
    pub timeframe:        String,
    pub candle_limit:     usize,
}

impl SymbolConfig {
    fn preset(inst_id: &str, min_base_amount: f64, leverage: (u32, u32, u32)) -> Self {
        Self {
            inst_id:          inst_id.to_owned(),
            display:          inst_id.trim_end_matches("-SWAP").to_owned(),
            min_base_amount,
            leverage_min:     leverage.0,
            leverage_default: leverage.1,
            leverage_max:     leverage.2,
            timeframe:        "5m".into(),
            candle_limit:     96,
        }
    }

    /// Built-in instrument table.
    pub fn builtin(inst_id: &str) -> Option<Self> {
        let s = match inst_id {
            "BTC-USDT-SWAP"  => Self::preset(inst_id, 0.001, (3, 10, 20)),
            "ETH-USDT-SWAP"  => Self::preset(inst_id, 0.01,  (3, 10, 20)),
            "OKB-USDT-SWAP"  => Self::preset(inst_id, 1.0,   (3, 8, 15)),
            "SOL-USDT-SWAP"  => Self::preset(inst_id, 0.1,   (3, 8, 15)),
            "DOGE-USDT-SWAP" => Self::preset(inst_id, 10.0,  (3, 5, 10)),
            "XRP-USDT-SWAP"  => Self::preset(inst_id, 10.0,  (3, 5, 10)),
            _ => return None,
        };
        Some(s)
    }

    /// Clamp a requested leverage into this instrument's band.
    pub fn clamp_leverage(&self, leverage: u32) -> u32 {
        leverage.clamp(self.leverage_min, self.leverage_max)
    }

    /// Base asset ticker, e.g. `BTC`.
    pub fn base_asset(&self) -> &str {
        self.display.split('-').next().unwrap_or(&self.display)
    }
}

// ── Engine sections ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingConfig {
    pub max_total_margin_ratio: f64,
    pub safety_buffer:          f64,
    pub quantity_tolerance:     f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_total_margin_ratio: DEFAULT_MAX_TOTAL_MARGIN_RATIO,
            safety_buffer:          DEFAULT_MARGIN_SAFETY_BUFFER,
            quantity_tolerance:     DEFAULT_QUANTITY_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Plan and check, but never send leverage changes or orders
    pub dry_run:              bool,
    pub skip_low_confidence:  bool,
    pub order_tag:            Option<String>,
    pub margin_mode:          String,
    /// Size halvings allowed by the planning-time margin check
    pub max_margin_halvings:  u32,
    /// Resends after a margin rejection (each one halves the size)
    pub margin_retries:       u32,
    pub margin_backoff_ms:    u64,
    /// Resends of the same size after a network / protocol error
    pub transient_retries:    u32,
    pub transient_backoff_ms: u64,
    /// Pause before the fresh pre-send balance read
    pub settle_delay_ms:      u64,
    pub balance_cache_ttl_ms: u64,
    pub quote_currency:       String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run:              true,
            skip_low_confidence:  false,
            order_tag:            None,
            margin_mode:          "cross".into(),
            max_margin_halvings:  2,
            margin_retries:       2,
            margin_backoff_ms:    1_000,
            transient_retries:    2,
            transient_backoff_ms: 2_000,
            settle_delay_ms:      500,
            balance_cache_ttl_ms: 5_000,
            quote_currency:       "USDT".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub interval_minutes:   u32,
    pub stagger_secs:       u64,
    pub task_timeout_secs:  u64,
    pub error_backoff_secs: u64,
    /// Skip a boundary that is closer than this
    pub min_lead_secs:      u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes:   5,
            stagger_secs:       2,
            task_timeout_secs:  180,
            error_backoff_secs: 60,
            min_lead_secs:      10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub rest_url:                String,
    pub min_request_interval_ms: u64,
    pub request_timeout_secs:    u64,
    /// Send `x-simulated-trading: 1` (demo account)
    pub simulated:               bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url:                DEFAULT_REST_URL.into(),
            min_request_interval_ms: 100,
            request_timeout_secs:    10,
            simulated:               false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub db_path:     PathBuf,
    pub archive_dir: PathBuf,
}

// ── Loading ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let model_keys: Vec<String> = var("ENABLED_MODELS")
            .unwrap_or_else(|| "deepseek".into())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if model_keys.is_empty() {
            bail!("ENABLED_MODELS names no model");
        }
        let models = model_keys
            .iter()
            .map(|key| load_model(key, &var))
            .collect::<Result<Vec<_>>>()?;

        let symbols = var("TRADING_PAIRS")
            .unwrap_or_else(|| "BTC-USDT-SWAP".into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let inst_id = s.to_uppercase();
                SymbolConfig::builtin(&inst_id).ok_or_else(|| anyhow!("unknown trading pair {inst_id}"))
            })
            .collect::<Result<Vec<_>>>()?;
        if symbols.is_empty() {
            bail!("TRADING_PAIRS names no instrument");
        }

        let sizing = SizingConfig {
            max_total_margin_ratio: parse_env(&var, "MAX_TOTAL_MARGIN_RATIO", DEFAULT_MAX_TOTAL_MARGIN_RATIO)?,
            safety_buffer:          parse_env(&var, "MARGIN_SAFETY_BUFFER",   DEFAULT_MARGIN_SAFETY_BUFFER)?,
            quantity_tolerance:     parse_env(&var, "QUANTITY_TOLERANCE",     DEFAULT_QUANTITY_TOLERANCE)?,
        };

        let d = ExecutionConfig::default();
        let execution = ExecutionConfig {
            dry_run:              parse_flag(&var, "TRADER_DRY_RUN", d.dry_run)?,
            skip_low_confidence:  parse_flag(&var, "SKIP_LOW_CONFIDENCE", d.skip_low_confidence)?,
            order_tag:            var("ORDER_TAG"),
            margin_mode:          var("MARGIN_MODE").unwrap_or(d.margin_mode),
            max_margin_halvings:  parse_env(&var, "MAX_MARGIN_HALVINGS",  d.max_margin_halvings)?,
            margin_retries:       parse_env(&var, "MARGIN_RETRIES",       d.margin_retries)?,
            margin_backoff_ms:    parse_env(&var, "MARGIN_BACKOFF_MS",    d.margin_backoff_ms)?,
            transient_retries:    parse_env(&var, "TRANSIENT_RETRIES",    d.transient_retries)?,
            transient_backoff_ms: parse_env(&var, "TRANSIENT_BACKOFF_MS", d.transient_backoff_ms)?,
            settle_delay_ms:      parse_env(&var, "SETTLE_DELAY_MS",      d.settle_delay_ms)?,
            balance_cache_ttl_ms: parse_env(&var, "BALANCE_CACHE_TTL_MS", d.balance_cache_ttl_ms)?,
            quote_currency:       var("QUOTE_CURRENCY").unwrap_or(d.quote_currency),
        };

        let d = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            interval_minutes:   parse_env(&var, "TRADE_INTERVAL_MINUTES", d.interval_minutes)?,
            stagger_secs:       parse_env(&var, "WORKER_STAGGER_SECS",    d.stagger_secs)?,
            task_timeout_secs:  parse_env(&var, "TASK_TIMEOUT_SECS",      d.task_timeout_secs)?,
            error_backoff_secs: parse_env(&var, "ERROR_BACKOFF_SECS",     d.error_backoff_secs)?,
            min_lead_secs:      d.min_lead_secs,
        };
        let m = scheduler.interval_minutes;
        if m == 0 || (60 % m != 0 && m % 60 != 0) {
            bail!("TRADE_INTERVAL_MINUTES must divide an hour or be whole hours, got {m}");
        }

        let d = ExchangeConfig::default();
        let exchange = ExchangeConfig {
            rest_url:                var("OKX_REST_URL").unwrap_or(d.rest_url),
            min_request_interval_ms: parse_env(&var, "OKX_RATE_LIMIT_MS", d.min_request_interval_ms)?,
            request_timeout_secs:    parse_env(&var, "OKX_TIMEOUT_SECS",  d.request_timeout_secs)?,
            simulated:               parse_flag(&var, "OKX_SIMULATED",    d.simulated)?,
        };

        let storage = StorageConfig {
            db_path:     var("HISTORY_DB_PATH").unwrap_or_else(|| "data/history.db".into()).into(),
            archive_dir: var("ARCHIVE_DIR").unwrap_or_else(|| "data/archives".into()).into(),
        };

        Ok(Self { models, symbols, sizing, execution, scheduler, exchange, storage })
    }
}

fn load_model<V>(key: &str, var: &V) -> Result<ModelConfig>
where
    V: Fn(&str) -> Option<String>,
{
    let suffix = key.to_uppercase();
    let scoped = |name: &str| var(&format!("{name}_{suffix}")).or_else(|| var(name));

    let (Some(api_key), Some(secret), Some(passphrase)) =
        (scoped("OKX_API_KEY"), scoped("OKX_SECRET"), scoped("OKX_PASSWORD"))
    else {
        bail!("missing exchange credentials for {key}: set OKX_API_KEY_{suffix}/OKX_SECRET_{suffix}/OKX_PASSWORD_{suffix}");
    };
    let sub_account = var(&format!("OKX_SUBACCOUNT_{suffix}"));
    let credentials = Credentials::new(&api_key, &secret, &passphrase, sub_account.as_deref());

    let (default_model, default_url) = match key {
        "deepseek" => (Some("deepseek-chat"), Some("https://api.deepseek.com")),
        _ => (None, None),
    };
    let provider_key = var(&format!("{suffix}_API_KEY"))
        .ok_or_else(|| anyhow!("missing {suffix}_API_KEY for decision provider {key}"))?;
    let model = var(&format!("{suffix}_MODEL"))
        .or_else(|| default_model.map(str::to_owned))
        .ok_or_else(|| anyhow!("missing {suffix}_MODEL for decision provider {key}"))?;
    let base_url = var(&format!("{suffix}_BASE_URL"))
        .or_else(|| default_url.map(str::to_owned))
        .ok_or_else(|| anyhow!("missing {suffix}_BASE_URL for decision provider {key}"))?;

    Ok(ModelConfig {
        key:         key.to_owned(),
        display:     var(&format!("{suffix}_DISPLAY")).unwrap_or_else(|| title_case(key)),
        credentials,
        provider: ProviderConfig {
            api_key:      SecretString::from(provider_key),
            model,
            base_url,
            timeout_secs: parse_env(var, &format!("{suffix}_TIMEOUT_SECS"), 30u64)?,
            temperature:  parse_env(var, &format!("{suffix}_TEMPERATURE"), 0.1)?,
        },
    })
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn parse_env<T, V>(var: &V, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("Config key {key}: {e}")),
        None => Ok(default),
    }
}

fn parse_flag<V>(var: &V, key: &str, default: bool) -> Result<bool>
where
    V: Fn(&str) -> Option<String>,
{
    match var(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("Config key {key}: expected a boolean, got {v}"),
    }
}
