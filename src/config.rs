use serde::{Deserialize, Serialize};
use clap::{ArgAction, Parser, ValueHint};
use dirs_next::home_dir;
use std::{fs, path::{Path, PathBuf}};
use thiserror::Error;

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// built-in defaults, applied by the accessors below
const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";
const DEFAULT_I2C_ADDRESS: u8 = 0x27;
const DEFAULT_COLS: u8 = 20; // likely 16 or 20
const DEFAULT_ROWS: u8 = 4;  // likely 2 or 4
const DEFAULT_AUTH_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const DEFAULT_POLL_SECS: u64 = 2;
// if heartbeats are too far apart the feed marks the device offline
const DEFAULT_HEARTBEAT_SECS: u64 = 300;
const DEFAULT_RETRY_SECS: u64 = 60;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
const DEFAULT_STARTUP_DELAY_SECS: u64 = 10;

/// Top-level app configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub log_level: Option<String>, // e.g., "info" | "debug"
    pub display: Option<DisplayConfig>,
    pub feed: Option<FeedConfig>,
    pub recovery: Option<RecoveryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisplayConfig {
    pub bus: Option<String>, // e.g. "/dev/i2c-1"
    pub address: Option<u8>, // 7-bit, e.g. 0x27 (use i2cdetect to find it)
    pub cols: Option<u8>,
    pub rows: Option<u8>,
}

impl DisplayConfig {
    pub fn bus(&self) -> &str {
        self.bus.as_deref().unwrap_or(DEFAULT_I2C_BUS)
    }
    pub fn address(&self) -> u8 {
        self.address.unwrap_or(DEFAULT_I2C_ADDRESS)
    }
    pub fn cols(&self) -> u8 {
        self.cols.unwrap_or(DEFAULT_COLS)
    }
    pub fn rows(&self) -> u8 {
        self.rows.unwrap_or(DEFAULT_ROWS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeedConfig {
    pub api_key: Option<String>,
    pub auth_url: Option<String>,
    pub database_url: Option<String>,
    pub email: Option<String>,    // prompted for when absent
    pub password: Option<String>, // prompted for when absent
    pub poll_secs: Option<u64>,
}

impl FeedConfig {
    pub fn auth_url(&self) -> &str {
        self.auth_url.as_deref().unwrap_or(DEFAULT_AUTH_URL)
    }
    pub fn poll_secs(&self) -> u64 {
        self.poll_secs.unwrap_or(DEFAULT_POLL_SECS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryConfig {
    pub heartbeat_secs: Option<u64>,
    pub retry_secs: Option<u64>,
    pub max_consecutive_errors: Option<u32>,
    pub startup_delay_secs: Option<u64>,
}

impl RecoveryConfig {
    pub fn heartbeat_secs(&self) -> u64 {
        self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS)
    }
    pub fn retry_secs(&self) -> u64 {
        self.retry_secs.unwrap_or(DEFAULT_RETRY_SECS)
    }
    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors.unwrap_or(DEFAULT_MAX_CONSECUTIVE_ERRORS)
    }
    pub fn startup_delay_secs(&self) -> u64 {
        self.startup_delay_secs.unwrap_or(DEFAULT_STARTUP_DELAY_SECS)
    }
}

/// CLI overrides. All fields are Options so we can layer them over YAML.
#[derive(Debug, Parser, Clone)]
#[command(name = "postbox", about = "PostBox LCD message board", version)]
pub struct Cli {
    /// Path to a YAML config file (overrides search)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// I2C bus device path (e.g. /dev/i2c-1)
    #[arg(long)]
    pub i2c_bus: Option<String>,
    /// Display address, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_address)]
    pub i2c_address: Option<u8>,
    #[arg(long)]
    pub display_cols: Option<u8>,
    #[arg(long)]
    pub display_rows: Option<u8>,
    /// dump fully merged config (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
}

fn parse_address(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|_| format!("invalid I2C address: {}", s))
}

/// Public entry point: parse CLI, read YAML, merge, validate.
pub fn load() -> Result<Config, ConfigError> {
    let cli = Cli::parse();

    // 1) defaults (from `Default` impl)
    let mut cfg = Config::default();

    // 2) YAML file (explicit path or search)
    if let Some(p) = cli.config.as_ref() {
        if p.exists() {
            let y = read_yaml(p)?;
            merge(&mut cfg, y);
        } else {
            return Err(ConfigError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
    } else if let Some(p) = find_config_file() {
        let y = read_yaml(&p)?;
        merge(&mut cfg, y);
    }

    // 3) CLI overrides (highest precedence)
    apply_cli_overrides(&mut cfg, &cli);

    // 4) Validate
    validate(&cfg)?;

    if cli.dump_config {
        // Pretty YAML of effective config (nice for debugging)
        let s = serde_yaml::to_string(&cfg)?;
        println!("{s}");
        std::process::exit(0);
    }

    Ok(cfg)
}

/// Try common locations in order (first hit wins).
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/postbox/config.yaml
    if let Some(home) = home_dir() {
        let p = home.join(".config/postbox/config.yaml");
        if p.exists() { return Some(p) }
        let p = home.join(".config/postbox.yaml");
        if p.exists() { return Some(p) }
    }
    // project local
    for candidate in &["postbox.yaml", "config.yaml", "config/postbox.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

fn read_yaml(path: &Path) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&s)?;
    Ok(cfg)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut Config, src: Config) {
    if src.log_level.is_some() { dst.log_level = src.log_level; }
    match (&mut dst.display, src.display) {
        (None, Some(c)) => dst.display = Some(c),
        (Some(d), Some(s)) => merge_display(d, s),
        _ => {}
    }
    match (&mut dst.feed, src.feed) {
        (None, Some(c)) => dst.feed = Some(c),
        (Some(d), Some(s)) => merge_feed(d, s),
        _ => {}
    }
    match (&mut dst.recovery, src.recovery) {
        (None, Some(c)) => dst.recovery = Some(c),
        (Some(d), Some(s)) => merge_recovery(d, s),
        _ => {}
    }
}

fn merge_display(dst: &mut DisplayConfig, src: DisplayConfig) {
    if src.bus.is_some()     { dst.bus = src.bus; }
    if src.address.is_some() { dst.address = src.address; }
    if src.cols.is_some()    { dst.cols = src.cols; }
    if src.rows.is_some()    { dst.rows = src.rows; }
}

fn merge_feed(dst: &mut FeedConfig, src: FeedConfig) {
    if src.api_key.is_some()      { dst.api_key = src.api_key; }
    if src.auth_url.is_some()     { dst.auth_url = src.auth_url; }
    if src.database_url.is_some() { dst.database_url = src.database_url; }
    if src.email.is_some()        { dst.email = src.email; }
    if src.password.is_some()     { dst.password = src.password; }
    if src.poll_secs.is_some()    { dst.poll_secs = src.poll_secs; }
}

fn merge_recovery(dst: &mut RecoveryConfig, src: RecoveryConfig) {
    if src.heartbeat_secs.is_some()         { dst.heartbeat_secs = src.heartbeat_secs; }
    if src.retry_secs.is_some()             { dst.retry_secs = src.retry_secs; }
    if src.max_consecutive_errors.is_some() { dst.max_consecutive_errors = src.max_consecutive_errors; }
    if src.startup_delay_secs.is_some()     { dst.startup_delay_secs = src.startup_delay_secs; }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if cli.log_level.is_some() { cfg.log_level = cli.log_level.clone(); }

    let any_display = cli.i2c_bus.is_some()
        || cli.i2c_address.is_some()
        || cli.display_cols.is_some()
        || cli.display_rows.is_some();

    if any_display && cfg.display.is_none() {
        cfg.display = Some(DisplayConfig::default());
    }
    if let Some(display) = cfg.display.as_mut() {
        if cli.i2c_bus.is_some()      { display.bus = cli.i2c_bus.clone(); }
        if cli.i2c_address.is_some()  { display.address = cli.i2c_address; }
        if cli.display_cols.is_some() { display.cols = cli.display_cols; }
        if cli.display_rows.is_some() { display.rows = cli.display_rows; }
    }
}

/// Put any invariants here (required fields, ranges, etc.)
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let display = cfg.display.clone().unwrap_or_default();
    if display.cols() == 0 {
        return Err(ConfigError::Validation("display cols must be > 0".into()));
    }
    if display.rows() == 0 || display.rows() > 4 {
        return Err(ConfigError::Validation("display rows must be 1..=4".into()));
    }
    if display.address() > 0x7F {
        return Err(ConfigError::Validation("display address must be a 7-bit value".into()));
    }

    let feed = cfg.feed.as_ref()
        .ok_or_else(|| ConfigError::Validation("feed section is required".into()))?;
    if feed.api_key.as_deref().unwrap_or("").is_empty() {
        return Err(ConfigError::Validation("feed api_key is required".into()));
    }
    if feed.database_url.as_deref().unwrap_or("").is_empty() {
        return Err(ConfigError::Validation("feed database_url is required".into()));
    }
    if feed.poll_secs() == 0 {
        return Err(ConfigError::Validation("feed poll_secs must be > 0".into()));
    }

    let recovery = cfg.recovery.clone().unwrap_or_default();
    if recovery.heartbeat_secs() == 0 || recovery.retry_secs() == 0 {
        return Err(ConfigError::Validation("recovery intervals must be > 0".into()));
    }
    if recovery.max_consecutive_errors() == 0 {
        return Err(ConfigError::Validation("recovery max_consecutive_errors must be > 0".into()));
    }
    Ok(())
}
