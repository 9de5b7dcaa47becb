//! Versioned configuration, mirroring the teacher's `config::{Version, V1,
//! Internal}` split in `main.rs`: a raw file is parsed once just to pick out
//! its `version` tag, then parsed again into the matching versioned struct,
//! then normalized into an `Internal` struct the rest of the program uses so
//! that future config versions don't ripple through every component.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Version {
    pub version: Option<i16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1 {
    pub radius_auth_port: Option<u16>,
    pub radius_acct_port: Option<u16>,
    pub coa_port: Option<u16>,
    #[serde(with = "humantime_serde", default = "default_quota_sync_interval")]
    pub quota_sync_interval: std::time::Duration,
    #[serde(default = "default_daily_reset_time")]
    pub daily_reset_time: String,
    #[serde(default = "default_archival_time")]
    pub accounting_archival_time: String,
    #[serde(default = "default_sharing_scan_time")]
    pub sharing_detection_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_retention_days")]
    pub accounting_retention_days: u32,
    #[serde(default = "default_enforcement_concurrency")]
    pub enforcement_max_concurrency: usize,
    #[serde(default = "default_nas_pool_size")]
    pub nas_pool_size: usize,
    #[serde(default = "default_cache_ttl")]
    pub subscriber_cache_ttl_sec: u64,
    #[serde(default = "default_license_grace_period")]
    pub license_grace_period_sec: u64,
    #[serde(default = "default_kick_threshold")]
    pub static_ip_conflict_kick_threshold: u32,
    #[serde(default)]
    pub sharing_detection_enabled: bool,
    #[serde(default = "default_sharing_ttl_threshold")]
    pub sharing_detection_ttl_threshold: u32,
    #[serde(default = "default_boost_stacks_on_override")]
    pub boost_stacks_on_override: bool,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    #[serde(default)]
    pub ignored_nas_addresses: Vec<String>,
    pub license_endpoint: Option<String>,
}

fn default_quota_sync_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}
fn default_daily_reset_time() -> String {
    "00:05".to_owned()
}
fn default_archival_time() -> String {
    "03:00".to_owned()
}
fn default_sharing_scan_time() -> String {
    "02:00".to_owned()
}
fn default_timezone() -> String {
    "UTC".to_owned()
}
fn default_retention_days() -> u32 {
    90
}
fn default_enforcement_concurrency() -> usize {
    16
}
fn default_nas_pool_size() -> usize {
    10
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_license_grace_period() -> u64 {
    3600
}
fn default_kick_threshold() -> u32 {
    3
}
fn default_sharing_ttl_threshold() -> u32 {
    4
}
fn default_boost_stacks_on_override() -> bool {
    true
}

/// An internal configuration structure used by the rest of the program that
/// can be updated without breaking compatibility with existing configuration
/// files, exactly as the teacher's `config::Internal` is documented to do.
#[derive(Debug, Clone)]
pub struct Internal {
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub radius_auth_port: u16,
    pub radius_acct_port: u16,
    pub coa_port: u16,
    pub quota_sync_interval: std::time::Duration,
    pub daily_reset_time: (u32, u32),
    pub accounting_archival_time: (u32, u32),
    pub sharing_detection_time: (u32, u32),
    pub timezone: chrono_tz::Tz,
    pub accounting_retention_days: u32,
    pub enforcement_max_concurrency: usize,
    pub nas_pool_size: usize,
    pub subscriber_cache_ttl: std::time::Duration,
    pub license_grace_period: std::time::Duration,
    pub static_ip_conflict_kick_threshold: u32,
    pub sharing_detection_enabled: bool,
    pub sharing_detection_ttl_threshold: u32,
    pub boost_stacks_on_override: bool,
    pub ignored_nas_addresses: HashSet<IpAddr>,
    pub license_endpoint: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config version: {0}")]
    VersionParse(serde_yaml::Error),
    #[error("failed to parse v1 config: {0}")]
    V1Parse(serde_yaml::Error),
    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(i16),
    #[error("invalid wall-clock time {0:?}, expected HH:MM")]
    BadWallClock(String),
    #[error("invalid IANA timezone {0:?}")]
    BadTimezone(String),
    #[error("invalid ignored NAS address {0:?}")]
    BadIpAddress(String),
}

fn parse_wall_clock(s: &str) -> Result<(u32, u32), ConfigError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| ConfigError::BadWallClock(s.to_owned()))?;
    let h: u32 = h.parse().map_err(|_| ConfigError::BadWallClock(s.to_owned()))?;
    let m: u32 = m.parse().map_err(|_| ConfigError::BadWallClock(s.to_owned()))?;
    if h > 23 || m > 59 {
        return Err(ConfigError::BadWallClock(s.to_owned()));
    }
    Ok((h, m))
}

pub fn load(path: &PathBuf) -> Result<Internal, ConfigError> {
    let config_string = std::fs::read_to_string(path)?;
    parse(&config_string)
}

pub fn parse(config_string: &str) -> Result<Internal, ConfigError> {
    let parsed_version: Version =
        serde_yaml::from_str(config_string).map_err(ConfigError::VersionParse)?;
    let version = parsed_version.version.unwrap_or(1);

    match version {
        1 => {
            let v1: V1 = serde_yaml::from_str(config_string).map_err(ConfigError::V1Parse)?;
            to_internal(v1)
        }
        other => Err(ConfigError::UnsupportedVersion(other)),
    }
}

fn to_internal(v1: V1) -> Result<Internal, ConfigError> {
    let timezone = v1
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::BadTimezone(v1.timezone.clone()))?;

    let mut ignored_nas_addresses = HashSet::new();
    for raw in &v1.ignored_nas_addresses {
        let addr =
            IpAddr::from_str(raw).map_err(|_| ConfigError::BadIpAddress(raw.clone()))?;
        ignored_nas_addresses.insert(addr);
    }

    Ok(Internal {
        db_host: v1.db_host,
        db_name: v1.db_name,
        db_user: v1.db_user,
        db_pass: v1.db_pass,
        radius_auth_port: v1.radius_auth_port.unwrap_or(1812),
        radius_acct_port: v1.radius_acct_port.unwrap_or(1813),
        coa_port: v1.coa_port.unwrap_or(1700),
        quota_sync_interval: v1.quota_sync_interval,
        daily_reset_time: parse_wall_clock(&v1.daily_reset_time)?,
        accounting_archival_time: parse_wall_clock(&v1.accounting_archival_time)?,
        sharing_detection_time: parse_wall_clock(&v1.sharing_detection_time)?,
        timezone,
        accounting_retention_days: v1.accounting_retention_days,
        enforcement_max_concurrency: v1.enforcement_max_concurrency,
        nas_pool_size: v1.nas_pool_size,
        subscriber_cache_ttl: std::time::Duration::from_secs(v1.subscriber_cache_ttl_sec),
        license_grace_period: std::time::Duration::from_secs(v1.license_grace_period_sec),
        static_ip_conflict_kick_threshold: v1.static_ip_conflict_kick_threshold,
        sharing_detection_enabled: v1.sharing_detection_enabled,
        sharing_detection_ttl_threshold: v1.sharing_detection_ttl_threshold,
        boost_stacks_on_override: v1.boost_stacks_on_override,
        ignored_nas_addresses,
        license_endpoint: v1.license_endpoint,
    })
}

#[derive(Debug, structopt::StructOpt)]
#[structopt(name = "radcore", about = "ISP subscriber AAA and enforcement core.")]
pub struct Opt {
    /// The path of the configuration file.
    #[structopt(short = "c", long = "config", default_value = "/etc/radcore/config.yml")]
    pub config: PathBuf,

    /// Run pending schema migrations against the configured database.
    #[structopt(long = "db-upgrade")]
    pub migrate: bool,

    /// The path of the directory containing database migration files.
    #[structopt(
        long = "db-migration-directory",
        default_value = "/usr/share/radcore/migrations"
    )]
    pub migration_directory: PathBuf,

    /// Show debug log information.
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
dbHost: localhost
dbName: radcore
dbUser: radcore
dbPass: secret
timezone: Asia/Beirut
dailyResetTime: "00:05"
"#;

    #[test]
    fn parses_defaults() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.radius_auth_port, 1812);
        assert_eq!(cfg.radius_acct_port, 1813);
        assert_eq!(cfg.coa_port, 1700);
        assert_eq!(cfg.daily_reset_time, (0, 5));
        assert_eq!(cfg.timezone, chrono_tz::Asia::Beirut);
        assert!(cfg.boost_stacks_on_override);
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = parse("version: 99\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_bad_wall_clock() {
        let bad = SAMPLE.replace("00:05", "25:99");
        assert!(parse(&bad).is_err());
    }
}
