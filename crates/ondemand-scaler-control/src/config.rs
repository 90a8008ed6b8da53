//! Scaler configuration.
//!
//! Loaded from a TOML file; every section is optional and falls back to its
//! defaults. Durations are either integer seconds or strings with units
//! (`500ms`, `10s`, `1m30s`, `2h`).
//!
//! ```toml
//! pool_config = "/etc/ondemand-scaler/pools.yml"
//!
//! [nomad]
//! address = "http://10.0.0.2:4646"
//!
//! [gc]
//! cycles_to_gc = 3
//! cycle_period = "1m"
//! allowed_free_expr = "min(round(totalnodes * 0.1), 2)"
//!
//! [hung_prevention]
//! allow = true
//! detect_period = "10m"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ondemand_scaler_cluster::StalePolicy;
use serde::{Deserialize, Deserializer};

use crate::error::{Result, ScalerError};
use crate::expr::AllowedFreeExpr;

/// Environment variable overriding `nomad.address`.
pub const ENV_NOMAD_ADDR: &str = "ONDEMAND_SCALER_NOMAD_ADDR";
/// Environment variable overriding `nomad.token`.
pub const ENV_NOMAD_TOKEN: &str = "ONDEMAND_SCALER_NOMAD_TOKEN";
/// Environment variable overriding `pool_config`.
pub const ENV_POOL_CONFIG: &str = "ONDEMAND_SCALER_POOL_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalerConfig {
    /// Path to the YAML pool definitions.
    #[serde(default)]
    pub pool_config: Option<PathBuf>,

    /// Cluster manager connection.
    #[serde(default)]
    pub nomad: NomadConfig,

    /// Idle-node collection.
    #[serde(default)]
    pub gc: GcConfig,

    /// Stale-read tolerance.
    #[serde(default)]
    pub stale_api: StaleApiConfig,

    /// Deadline for scaling events.
    #[serde(default)]
    pub hung_prevention: HungPreventionConfig,

    /// Debouncing and update waits.
    #[serde(default)]
    pub scaling: ScalingConfig,
}

/// Cluster manager connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NomadConfig {
    /// HTTP address of the cluster manager.
    #[serde(default = "NomadConfig::default_address")]
    pub address: String,

    /// ACL token.
    #[serde(default)]
    pub token: Option<String>,

    /// Timeout of one API request (the event stream is exempt).
    #[serde(
        default = "NomadConfig::default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

impl NomadConfig {
    fn default_address() -> String {
        "http://127.0.0.1:4646".to_string()
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            token: None,
            request_timeout: Self::default_request_timeout(),
        }
    }
}

/// Idle-node collection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Consecutive idle cycles before a node is collected.
    #[serde(default = "GcConfig::default_cycles_to_gc")]
    pub cycles_to_gc: u32,

    /// Time between cycles.
    #[serde(
        default = "GcConfig::default_cycle_period",
        deserialize_with = "deserialize_duration"
    )]
    pub cycle_period: Duration,

    /// Idle nodes to keep per pool, as a function of `totalnodes` and
    /// `busynodes`.
    #[serde(default)]
    pub allowed_free_expr: AllowedFreeExpr,

    /// Bound on one warm-up wait.
    #[serde(
        default = "GcConfig::default_warmup_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub warmup_timeout: Duration,
}

impl GcConfig {
    const fn default_cycles_to_gc() -> u32 {
        3
    }

    const fn default_cycle_period() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_warmup_timeout() -> Duration {
        Duration::from_secs(10 * 60)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            cycles_to_gc: Self::default_cycles_to_gc(),
            cycle_period: Self::default_cycle_period(),
            allowed_free_expr: AllowedFreeExpr::default(),
            warmup_timeout: Self::default_warmup_timeout(),
        }
    }
}

/// Stale-read settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaleApiConfig {
    /// Let followers answer reads.
    #[serde(default)]
    pub allow: bool,

    /// Longest leader silence before a follower answer is redone.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub duration: Duration,
}

impl StaleApiConfig {
    /// The read policy these settings describe.
    #[must_use]
    pub const fn policy(&self) -> StalePolicy {
        StalePolicy {
            allow_stale: self.allow,
            max_last_contact: self.duration,
        }
    }
}

/// Scaling-event deadline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HungPreventionConfig {
    /// Give every scaling event a deadline.
    #[serde(default)]
    pub allow: bool,

    /// The deadline.
    #[serde(
        default = "HungPreventionConfig::default_detect_period",
        deserialize_with = "deserialize_duration"
    )]
    pub detect_period: Duration,
}

impl HungPreventionConfig {
    const fn default_detect_period() -> Duration {
        Duration::from_secs(10 * 60)
    }

    /// Deadline for a new scaling event, if enabled.
    #[must_use]
    pub const fn deadline(&self) -> Option<Duration> {
        if self.allow {
            Some(self.detect_period)
        } else {
            None
        }
    }
}

impl Default for HungPreventionConfig {
    fn default() -> Self {
        Self {
            allow: false,
            detect_period: Self::default_detect_period(),
        }
    }
}

/// Debouncing and update wait settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingConfig {
    /// Quiet period after the last chain change before demand is evaluated.
    #[serde(
        default = "ScalingConfig::default_settle_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub settle_delay: Duration,

    /// How long a pool update waits without progress.
    #[serde(
        default = "ScalingConfig::default_idle_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub idle_timeout: Duration,
}

impl ScalingConfig {
    const fn default_settle_delay() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_idle_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            settle_delay: Self::default_settle_delay(),
            idle_timeout: Self::default_idle_timeout(),
        }
    }
}

impl ScalerConfig {
    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, has
    /// unknown keys or carries an invalid expression.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScalerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or values.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(address) = lookup(ENV_NOMAD_ADDR) {
            self.nomad.address = address;
        }
        if let Some(token) = lookup(ENV_NOMAD_TOKEN) {
            self.nomad.token = Some(token);
        }
        if let Some(path) = lookup(ENV_POOL_CONFIG) {
            self.pool_config = Some(PathBuf::from(path));
        }
    }

    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ScalerError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.pool_config.is_none() {
            return Err(ScalerError::Config(format!(
                "pool_config is required (or set {ENV_POOL_CONFIG})"
            )));
        }
        if !(self.nomad.address.starts_with("http://") || self.nomad.address.starts_with("https://"))
        {
            return Err(ScalerError::Config(format!(
                "nomad.address must be an http(s) URL, got {:?}",
                self.nomad.address
            )));
        }
        if self.gc.cycles_to_gc == 0 {
            return Err(ScalerError::Config("gc.cycles_to_gc must be at least 1".into()));
        }
        if self.gc.cycle_period.is_zero() {
            return Err(ScalerError::Config("gc.cycle_period must be positive".into()));
        }
        if self.scaling.settle_delay.is_zero() {
            return Err(ScalerError::Config("scaling.settle_delay must be positive".into()));
        }
        if self.hung_prevention.allow && self.hung_prevention.detect_period.is_zero() {
            return Err(ScalerError::Config(
                "hung_prevention.detect_period must be positive when enabled".into(),
            ));
        }
        Ok(())
    }

    /// Path of the pool definitions.
    ///
    /// # Errors
    ///
    /// Returns [`ScalerError::Config`] if no path is configured.
    pub fn pool_config_path(&self) -> Result<&Path> {
        self.pool_config
            .as_deref()
            .ok_or_else(|| ScalerError::Config("pool_config is required".into()))
    }
}

/// Parse `1h2m3s`, `500ms` or a bare number of seconds.
///
/// # Errors
///
/// Returns a description of the first unparseable part.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("{text:?}: missing unit after {rest:?}"))?;
        if digits == 0 {
            return Err(format!("{text:?}: expected a number at {rest:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("{text:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            unit => return Err(format!("{text:?}: unknown unit {unit:?}")),
        };
        total += part;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ScalerConfig::parse("").unwrap();
        assert_eq!(config.nomad.address, "http://127.0.0.1:4646");
        assert_eq!(config.gc.cycles_to_gc, 3);
        assert_eq!(config.gc.cycle_period, Duration::from_secs(60));
        assert_eq!(config.gc.allowed_free_expr.allowed_free(100, 0), 0);
        assert_eq!(config.gc.warmup_timeout, Duration::from_secs(600));
        assert!(!config.stale_api.allow);
        assert_eq!(config.hung_prevention.deadline(), None);
        assert_eq!(config.scaling.settle_delay, Duration::from_secs(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_file() {
        let config = ScalerConfig::parse(
            r#"
            pool_config = "/etc/pools.yml"

            [nomad]
            address = "https://nomad.internal:4646"
            token = "secret"
            request_timeout = "45s"

            [gc]
            cycles_to_gc = 5
            cycle_period = 30
            allowed_free_expr = "min(round(totalnodes*0.1),2)"
            warmup_timeout = "5m"

            [stale_api]
            allow = true
            duration = "1500ms"

            [hung_prevention]
            allow = true
            detect_period = "1h30m"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.nomad.token.as_deref(), Some("secret"));
        assert_eq!(config.nomad.request_timeout, Duration::from_secs(45));
        assert_eq!(config.gc.cycle_period, Duration::from_secs(30));
        assert_eq!(config.gc.allowed_free_expr.allowed_free(20, 0), 2);
        assert_eq!(
            config.stale_api.policy(),
            StalePolicy {
                allow_stale: true,
                max_last_contact: Duration::from_millis(1500),
            }
        );
        assert_eq!(
            config.hung_prevention.deadline(),
            Some(Duration::from_secs(90 * 60))
        );
    }

    #[test]
    fn bad_expression_and_unknown_keys_are_rejected() {
        let err = ScalerConfig::parse("[gc]\nallowed_free_expr = \"idle * 2\"").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("idle"));

        assert!(ScalerConfig::parse("[gc]\ncycles = 2").is_err());
        assert!(ScalerConfig::parse("[scaling]\nsettle_delay = \"10 parsecs\"").is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = ScalerConfig::parse("[nomad]\naddress = \"http://a:4646\"").unwrap();
        config.apply_overrides(|key| match key {
            ENV_NOMAD_ADDR => Some("http://b:4646".to_string()),
            ENV_NOMAD_TOKEN => Some(String::new()),
            ENV_POOL_CONFIG => Some("/tmp/pools.yml".to_string()),
            _ => None,
        });
        assert_eq!(config.nomad.address, "http://b:4646");
        assert_eq!(config.nomad.token, None);
        assert_eq!(
            config.pool_config_path().unwrap(),
            Path::new("/tmp/pools.yml")
        );
    }

    #[test]
    fn validation() {
        let mut config = ScalerConfig::parse("pool_config = \"p.yml\"").unwrap();
        config.validate().unwrap();

        config.nomad.address = "nomad:4646".into();
        assert!(config.validate().is_err());

        config.nomad.address = "http://nomad:4646".into();
        config.gc.cycles_to_gc = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_ok());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("10s5").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler.toml");
        std::fs::write(&path, "pool_config = \"pools.yml\"\n[gc]\ncycles_to_gc = 2\n").unwrap();
        let config = ScalerConfig::load(&path).unwrap();
        assert_eq!(config.gc.cycles_to_gc, 2);

        let err = ScalerConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ScalerError::Io { .. }));
    }
}
