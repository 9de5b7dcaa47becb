use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use radcore::db::models::{FupTier, Service, Subscriber};
use radcore::policy;

fn subscriber_at_level(level: i16) -> Subscriber {
    Subscriber {
        id: 1,
        username: "alice".into(),
        credential: vec![],
        service_id: Some(1),
        nas_id: Some(1),
        mac_binding: None,
        expires_at: None,
        is_online: true,
        daily_bytes_down: 0,
        daily_bytes_up: 0,
        monthly_bytes_down: 0,
        monthly_bytes_up: 0,
        fup_level_daily: level,
        fup_level_monthly: 0,
        last_daily_reset: Utc::now(),
        last_monthly_reset: Utc::now(),
        framed_ip: None,
    }
}

fn arb_non_increasing_tiers() -> impl Strategy<Value = Vec<FupTier>> {
    // Tiers are authored non-increasing in speed as the level advances
    // (§3 invariant: tier N+1 is never faster than tier N).
    proptest::collection::vec(1i64..=200_000i64, 1..6).prop_map(|mut speeds| {
        speeds.sort_unstable_by(|a, b| b.cmp(a));
        speeds
            .into_iter()
            .enumerate()
            .map(|(i, kbps)| FupTier {
                threshold_bytes: (i as i64 + 1) * 1_000_000_000,
                reduced_down_kbps: kbps,
                reduced_up_kbps: kbps,
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn resolved_speed_is_non_increasing_as_fup_level_advances(tiers in arb_non_increasing_tiers()) {
        let service = Service {
            id: 1,
            name: "standard".into(),
            download_speed_kbps: 1_000_000,
            upload_speed_kbps: 1_000_000,
            burst_download_kbps: None,
            burst_upload_kbps: None,
            daily_fup_tiers: sqlx::types::Json(tiers.clone()),
            monthly_fup_tiers: sqlx::types::Json(vec![]),
            time_based_speed_enabled: false,
            time_window_start_min: 0,
            time_window_end_min: 0,
            time_download_boost_pct: 0,
            time_upload_boost_pct: 0,
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let mut previous = i64::MAX;
        for level in 1..=tiers.len() as i16 {
            let sub = subscriber_at_level(level);
            let resolved = policy::resolve(&sub, Some(&service), &[], &[], &now, true);
            prop_assert!(resolved.down_kbps <= previous);
            previous = resolved.down_kbps;
        }
    }

    #[test]
    fn fup_level_zero_always_resolves_to_plain_service_speed(down in 1i64..500_000i64, up in 1i64..500_000i64) {
        let service = Service {
            id: 1,
            name: "standard".into(),
            download_speed_kbps: down,
            upload_speed_kbps: up,
            burst_download_kbps: None,
            burst_upload_kbps: None,
            daily_fup_tiers: sqlx::types::Json(vec![FupTier {
                threshold_bytes: 1,
                reduced_down_kbps: 1,
                reduced_up_kbps: 1,
            }]),
            monthly_fup_tiers: sqlx::types::Json(vec![]),
            time_based_speed_enabled: false,
            time_window_start_min: 0,
            time_window_end_min: 0,
            time_download_boost_pct: 0,
            time_upload_boost_pct: 0,
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let sub = subscriber_at_level(0);

        let resolved = policy::resolve(&sub, Some(&service), &[], &[], &now, true);
        prop_assert_eq!(resolved.down_kbps, down);
        prop_assert_eq!(resolved.up_kbps, up);
    }
}
