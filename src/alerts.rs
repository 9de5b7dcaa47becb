//! Alert raising. A thin wrapper over `Store::insert_alert` that centralizes
//! the `serde_json::Value` metadata shape for each alert kind, the same way
//! the teacher centralizes its `EnforcementError` construction rather than
//! building ad hoc variants at every call site.

use std::sync::Arc;

use serde_json::json;

use crate::db::models::{AlertKind, AlertSeverity, SubscriberId};
use crate::db::{Store, StoreError};

#[derive(Clone)]
pub struct AlertSink {
    store: Arc<Store>,
    log: slog::Logger,
}

impl AlertSink {
    pub fn new(store: Arc<Store>, log: slog::Logger) -> Self {
        Self { store, log }
    }

    async fn raise(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        subscriber_id: Option<SubscriberId>,
        metadata: serde_json::Value,
    ) {
        slog::warn!(self.log, "raising alert"; "kind" => ?kind, "severity" => ?severity,
            "subscriber_id" => ?subscriber_id);
        if let Err(e) = self
            .store
            .insert_alert(kind, severity, subscriber_id, metadata)
            .await
        {
            slog::error!(self.log, "failed to persist alert"; "err" => %e);
        }
    }

    pub async fn multi_ip(&self, subscriber_id: SubscriberId, distinct_ips: usize) {
        self.raise(
            AlertKind::MultiIp,
            AlertSeverity::Warning,
            Some(subscriber_id),
            json!({ "distinct_ips": distinct_ips }),
        )
        .await;
    }

    pub async fn static_ip_conflict(
        &self,
        subscriber_id: SubscriberId,
        conflicting_session: &str,
        kick_count: u32,
    ) {
        self.raise(
            AlertKind::StaticIpConflict,
            if kick_count >= 1 { AlertSeverity::Warning } else { AlertSeverity::Info },
            Some(subscriber_id),
            json!({ "conflicting_session": conflicting_session, "kick_count": kick_count }),
        )
        .await;
    }

    pub async fn subscriber_limit_exceeded(&self, subscriber_id: SubscriberId, limit: &str) {
        self.raise(
            AlertKind::SubscriberLimitExceeded,
            AlertSeverity::Warning,
            Some(subscriber_id),
            json!({ "limit": limit }),
        )
        .await;
    }

    pub async fn enforcement_failed(
        &self,
        subscriber_id: SubscriberId,
        tier: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.raise(
            AlertKind::EnforcementFailed,
            AlertSeverity::Critical,
            Some(subscriber_id),
            json!({ "tier": tier, "attempts": attempts }),
        )
        .await;
        Ok(())
    }

    pub async fn sharing_suspected(&self, subscriber_id: SubscriberId, session_count: u32) {
        self.raise(
            AlertKind::SharingSuspected,
            AlertSeverity::Warning,
            Some(subscriber_id),
            json!({ "concurrent_sessions": session_count }),
        )
        .await;
    }

    pub async fn outdated_nas_version(&self, nas_name: &str, version: &str) {
        self.raise(
            AlertKind::OutdatedVersion,
            AlertSeverity::Info,
            None,
            json!({ "nas": nas_name, "version": version }),
        )
        .await;
    }
}
