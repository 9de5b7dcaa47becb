use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use radcore::db::models::{
    BandwidthRule, FupTier, RuleId, Service, Subscriber, SubscriberBandwidthRule, SubscriberId,
};
use radcore::policy;

fn base_subscriber(service_id: Option<i32>) -> Subscriber {
    Subscriber {
        id: 1,
        username: "alice".into(),
        credential: vec![],
        service_id,
        nas_id: Some(1),
        mac_binding: None,
        expires_at: None,
        is_online: true,
        daily_bytes_down: 0,
        daily_bytes_up: 0,
        monthly_bytes_down: 0,
        monthly_bytes_up: 0,
        fup_level_daily: 0,
        fup_level_monthly: 0,
        last_daily_reset: Utc::now(),
        last_monthly_reset: Utc::now(),
        framed_ip: None,
    }
}

fn base_service(down: i64, up: i64) -> Service {
    Service {
        id: 1,
        name: "basic".into(),
        download_speed_kbps: down,
        upload_speed_kbps: up,
        burst_download_kbps: None,
        burst_upload_kbps: None,
        daily_fup_tiers: sqlx::types::Json(vec![]),
        monthly_fup_tiers: sqlx::types::Json(vec![]),
        time_based_speed_enabled: false,
        time_window_start_min: 0,
        time_window_end_min: 0,
        time_download_boost_pct: 0,
        time_upload_boost_pct: 0,
    }
}

fn arb_service_speed() -> impl Strategy<Value = (i64, i64)> {
    (1i64..200_000, 1i64..200_000)
}

proptest! {
    #[test]
    fn resolve_is_deterministic((down, up) in arb_service_speed()) {
        let subscriber = base_subscriber(Some(1));
        let service = base_service(down, up);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let a = policy::resolve(&subscriber, Some(&service), &[], &[], &now, true);
        let b = policy::resolve(&subscriber, Some(&service), &[], &[], &now, true);
        prop_assert_eq!(a.down_kbps, b.down_kbps);
        prop_assert_eq!(a.up_kbps, b.up_kbps);
    }

    #[test]
    fn plain_speed_never_exceeds_service_speed_without_rules((down, up) in arb_service_speed()) {
        let subscriber = base_subscriber(Some(1));
        let service = base_service(down, up);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let resolved = policy::resolve(&subscriber, Some(&service), &[], &[], &now, true);
        prop_assert_eq!(resolved.down_kbps, down);
        prop_assert_eq!(resolved.up_kbps, up);
    }

    #[test]
    fn zero_pct_boost_is_identity((down, up) in arb_service_speed(), pct in 0i32..0i32) {
        let subscriber = base_subscriber(Some(1));
        let service = base_service(down, up);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let global = BandwidthRule {
            id: 1 as RuleId,
            window_start_min: 0,
            window_end_min: 0,
            days_of_week_mask: 0b111_1111,
            download_boost_pct: pct,
            upload_boost_pct: pct,
            target_service_ids: sqlx::types::Json(vec![]),
        };

        let resolved = policy::resolve(&subscriber, Some(&service), &[], &[global], &now, true);
        prop_assert_eq!(resolved.down_kbps, down);
        prop_assert_eq!(resolved.up_kbps, up);
    }

    #[test]
    fn override_without_boost_stacking_ignores_global_rule(
        (down, up) in arb_service_speed(),
        (override_down, override_up) in arb_service_speed(),
        pct in 1i32..300i32,
    ) {
        let subscriber = base_subscriber(Some(1));
        let service = base_service(down, up);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let rule = SubscriberBandwidthRule {
            id: 1,
            subscriber_id: 1 as SubscriberId,
            kind: "permanent".into(),
            window_start_min: None,
            window_end_min: None,
            override_download_kbps: override_down,
            override_upload_kbps: override_up,
        };
        let global = BandwidthRule {
            id: 1,
            window_start_min: 0,
            window_end_min: 0,
            days_of_week_mask: 0b111_1111,
            download_boost_pct: pct,
            upload_boost_pct: pct,
            target_service_ids: sqlx::types::Json(vec![]),
        };

        let resolved = policy::resolve(
            &subscriber,
            Some(&service),
            std::slice::from_ref(&rule),
            &[global],
            &now,
            false,
        );
        prop_assert_eq!(resolved.down_kbps, override_down);
        prop_assert_eq!(resolved.up_kbps, override_up);
    }

    #[test]
    fn override_ignores_a_global_rule_targeting_a_different_service(
        (down, up) in arb_service_speed(),
        (override_down, override_up) in arb_service_speed(),
        pct in 1i32..300i32,
    ) {
        let subscriber = base_subscriber(Some(1));
        let service = base_service(down, up);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let rule = SubscriberBandwidthRule {
            id: 1,
            subscriber_id: 1 as SubscriberId,
            kind: "permanent".into(),
            window_start_min: None,
            window_end_min: None,
            override_download_kbps: override_down,
            override_upload_kbps: override_up,
        };
        // Targets service 2 only; the subscriber is on service 1, so this
        // rule must never boost them, override or not.
        let global = BandwidthRule {
            id: 1,
            window_start_min: 0,
            window_end_min: 0,
            days_of_week_mask: 0b111_1111,
            download_boost_pct: pct,
            upload_boost_pct: pct,
            target_service_ids: sqlx::types::Json(vec![2]),
        };

        let resolved = policy::resolve(
            &subscriber,
            Some(&service),
            std::slice::from_ref(&rule),
            &[global],
            &now,
            true,
        );
        prop_assert_eq!(resolved.down_kbps, override_down);
        prop_assert_eq!(resolved.up_kbps, override_up);
    }

    #[test]
    fn crossed_fup_tier_replaces_service_speed_exactly(
        (down, up) in arb_service_speed(),
        threshold in 1i64..1_000_000_000i64,
        reduced_down in 1i64..200_000i64,
        reduced_up in 1i64..200_000i64,
    ) {
        let mut subscriber = base_subscriber(Some(1));
        subscriber.fup_level_daily = 1;
        let mut service = base_service(down, up);
        service.daily_fup_tiers = sqlx::types::Json(vec![FupTier {
            threshold_bytes: threshold,
            reduced_down_kbps: reduced_down,
            reduced_up_kbps: reduced_up,
        }]);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let resolved = policy::resolve(&subscriber, Some(&service), &[], &[], &now, true);
        prop_assert_eq!(resolved.down_kbps, reduced_down);
        prop_assert_eq!(resolved.up_kbps, reduced_up);
    }
}
