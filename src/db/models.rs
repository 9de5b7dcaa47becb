//! Entity types for every §3 data-model record. Rows are mapped with
//! `#[derive(sqlx::FromRow)]`, the same convention the teacher uses for
//! `SubscriberBalanceInfo`/`SubscriberBridgeInfo`/`SubscriberRateLimitRow`.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

pub type NasId = i32;
pub type ServiceId = i32;
pub type SubscriberId = i32;
pub type RuleId = i32;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NasDevice {
    pub id: NasId,
    pub name: String,
    pub management_ip: IpNetwork,
    pub shared_secret: Vec<u8>,
    pub api_endpoint: String,
    pub api_username: String,
    pub api_password: String,
    pub coa_port: i32,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FupTier {
    pub threshold_bytes: i64,
    pub reduced_down_kbps: i64,
    pub reduced_up_kbps: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub download_speed_kbps: i64,
    pub upload_speed_kbps: i64,
    pub burst_download_kbps: Option<i64>,
    pub burst_upload_kbps: Option<i64>,
    /// JSON-encoded `Vec<FupTier>`, ordered non-decreasing by threshold.
    pub daily_fup_tiers: sqlx::types::Json<Vec<FupTier>>,
    pub monthly_fup_tiers: sqlx::types::Json<Vec<FupTier>>,
    pub time_based_speed_enabled: bool,
    /// Minutes since local midnight.
    pub time_window_start_min: i32,
    pub time_window_end_min: i32,
    pub time_download_boost_pct: i32,
    pub time_upload_boost_pct: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub username: String,
    /// Encrypted at rest; decrypted lazily by the RADIUS PAP path only.
    pub credential: Vec<u8>,
    pub service_id: Option<ServiceId>,
    pub nas_id: Option<NasId>,
    pub mac_binding: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub daily_bytes_down: i64,
    pub daily_bytes_up: i64,
    pub monthly_bytes_down: i64,
    pub monthly_bytes_up: i64,
    pub fup_level_daily: i16,
    pub fup_level_monthly: i16,
    pub last_daily_reset: DateTime<Utc>,
    pub last_monthly_reset: DateTime<Utc>,
    pub framed_ip: Option<IpNetwork>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Permanent,
    Windowed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriberBandwidthRule {
    pub id: RuleId,
    pub subscriber_id: SubscriberId,
    pub kind: String,
    /// Minutes since local midnight; only meaningful when `kind == "windowed"`.
    pub window_start_min: Option<i32>,
    pub window_end_min: Option<i32>,
    pub override_download_kbps: i64,
    pub override_upload_kbps: i64,
}

impl SubscriberBandwidthRule {
    pub fn kind(&self) -> RuleKind {
        match self.kind.as_str() {
            "windowed" => RuleKind::Windowed,
            _ => RuleKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BandwidthRule {
    pub id: RuleId,
    pub window_start_min: i32,
    pub window_end_min: i32,
    pub days_of_week_mask: i16,
    pub download_boost_pct: i32,
    pub upload_boost_pct: i32,
    /// JSON-encoded `Vec<ServiceId>`; empty means "all services".
    pub target_service_ids: sqlx::types::Json<Vec<ServiceId>>,
}

impl BandwidthRule {
    pub fn targets_service(&self, service_id: ServiceId) -> bool {
        self.target_service_ids.0.is_empty() || self.target_service_ids.0.contains(&service_id)
    }

    pub fn active_on_weekday(&self, weekday: chrono::Weekday) -> bool {
        let bit = 1i16 << weekday.num_days_from_monday();
        (self.days_of_week_mask & bit) != 0
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountingRecord {
    pub session_id: String,
    pub subscriber_id: SubscriberId,
    pub nas_id: NasId,
    pub framed_ip: Option<IpNetwork>,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub termination_cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MultiIp,
    SubscriberLimitExceeded,
    StaticIpConflict,
    OutdatedVersion,
    EnforcementFailed,
    SharingSuspected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub kind: String,
    pub severity: String,
    pub subscriber_id: Option<SubscriberId>,
    pub metadata: sqlx::types::Json<serde_json::Value>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Which FUP window(s) were newly crossed by a single counter update. Both
/// may be populated if one update crosses a daily and a monthly tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FupCrossing {
    pub daily_level: Option<i16>,
    pub monthly_level: Option<i16>,
}

impl FupCrossing {
    pub fn is_empty(&self) -> bool {
        self.daily_level.is_none() && self.monthly_level.is_none()
    }
}
