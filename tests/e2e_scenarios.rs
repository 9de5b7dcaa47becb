//! End-to-end scenario tests seeded directly from the acceptance scenarios:
//! normal connect, daily FUP crossing, time boost with an override, a
//! static-IP conflict, speed-string normalization, and a daily reset under
//! timezone stress. Each test drives only the wire codec and the pure
//! resolver/eviction logic (no live database or router), composing the
//! public building blocks the way a real Access-Request would exercise them.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use radcore::db::models::{BandwidthRule, FupTier, Service, Subscriber, SubscriberBandwidthRule};
use radcore::policy;
use radcore::radius::auth::{pap_decrypt, pap_encrypt, EvictionTracker};
use radcore::radius::packet::{decode_vendor_rate_limit, encode_vendor_rate_limit, AttrType, Attribute, Code, Packet};
use radcore::speed;

fn subscriber() -> Subscriber {
    Subscriber {
        id: 1,
        username: "alice@isp.net".into(),
        credential: b"hunter2".to_vec(),
        service_id: Some(1),
        nas_id: Some(1),
        mac_binding: None,
        expires_at: None,
        is_online: false,
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

fn service_with_daily_tier() -> Service {
    Service {
        id: 1,
        name: "standard".into(),
        download_speed_kbps: 4000,
        upload_speed_kbps: 1200,
        burst_download_kbps: None,
        burst_upload_kbps: None,
        daily_fup_tiers: sqlx::types::Json(vec![FupTier {
            threshold_bytes: 5_000_000_000,
            reduced_down_kbps: 1000,
            reduced_up_kbps: 500,
        }]),
        monthly_fup_tiers: sqlx::types::Json(vec![]),
        time_based_speed_enabled: false,
        time_window_start_min: 0,
        time_window_end_min: 0,
        time_download_boost_pct: 0,
        time_upload_boost_pct: 0,
    }
}

/// Scenario 1: normal connect. A PAP Access-Request decrypts to the stored
/// credential, and the resulting Access-Accept carries the unreduced
/// service speed as the rate-limit attribute.
#[test]
fn scenario_normal_connect() {
    let sub = subscriber();
    let secret = b"nas-shared-secret";
    let authenticator = [9u8; 16];

    let encrypted = pap_encrypt(&sub.credential, secret, &authenticator);
    let request = Packet {
        code: Code::AccessRequest,
        identifier: 1,
        authenticator,
        attributes: vec![
            Attribute::string(AttrType::UserName, &sub.username),
            Attribute::new(AttrType::UserPassword, encrypted),
        ],
    };

    let submitted = request.get(AttrType::UserPassword).unwrap();
    let recovered = pap_decrypt(&submitted.value, secret, &request.authenticator);
    assert_eq!(recovered, sub.credential);

    let service = service_with_daily_tier();
    let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
    let resolved = policy::resolve(&sub, Some(&service), &[], &[], &now, true);
    assert_eq!((resolved.down_kbps, resolved.up_kbps), (4000, 1200));

    let rate_limit = format!("{}k/{}k", resolved.up_kbps, resolved.down_kbps);
    let accept = Packet {
        code: Code::AccessAccept,
        identifier: request.identifier,
        authenticator: [0u8; 16],
        attributes: vec![encode_vendor_rate_limit(&rate_limit)],
    };
    let decoded = Packet::decode(&accept.encode()).unwrap();
    assert_eq!(decode_vendor_rate_limit(&decoded.attributes).unwrap(), "1200k/4000k");

    // Accounting tick: a later +200MB delta just advances the counters,
    // nowhere near the 5GB daily tier, so no FUP crossing occurs.
    let mut after_tick = sub;
    after_tick.daily_bytes_down += 200_000_000;
    let resolved_after = policy::resolve(&after_tick, Some(&service), &[], &[], &now, true);
    assert_eq!((resolved_after.down_kbps, resolved_after.up_kbps), (4000, 1200));
}

/// Scenario 2: daily FUP crossing. Once the counter update pushes the
/// subscriber past the 5GB daily tier and the level has advanced to 1, the
/// resolver must return the tier's reduced rate and tag the reason.
#[test]
fn scenario_daily_fup_crossing() {
    let mut sub = subscriber();
    sub.daily_bytes_down = 4_990_000_000;
    let service = service_with_daily_tier();
    let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();

    // Before the crossing: still at full service speed.
    let before = policy::resolve(&sub, Some(&service), &[], &[], &now, true);
    assert_eq!((before.down_kbps, before.up_kbps), (4000, 1200));

    // The quota-sync tick observes 5.20GB total and the datastore layer
    // advances fup_level_daily from 0 to 1 (tested directly in db::mod).
    sub.daily_bytes_down = 5_200_000_000;
    sub.fup_level_daily = 1;

    let after = policy::resolve(&sub, Some(&service), &[], &[], &now, true);
    assert_eq!((after.down_kbps, after.up_kbps), (1000, 500));
    assert_eq!(after.reason, policy::ReasonTag::FupDaily);
}

/// Scenario 3: a permanent override stacks with an active global boost
/// inside its window, and reverts outside it.
#[test]
fn scenario_time_boost_with_override() {
    let sub = subscriber();
    let service = service_with_daily_tier();
    let over = SubscriberBandwidthRule {
        id: 1,
        subscriber_id: sub.id,
        kind: "permanent".into(),
        window_start_min: None,
        window_end_min: None,
        override_download_kbps: 50_000,
        override_upload_kbps: 50_000,
    };
    let night = BandwidthRule {
        id: 1,
        window_start_min: 0,
        window_end_min: 360,
        days_of_week_mask: 0b111_1111,
        download_boost_pct: 100,
        upload_boost_pct: 100,
        target_service_ids: sqlx::types::Json(vec![]),
    };

    let at_3am = Utc.with_ymd_and_hms(2026, 7, 27, 3, 0, 0).unwrap();
    let r = policy::resolve(&sub, Some(&service), &[over.clone()], &[night.clone()], &at_3am, true);
    assert_eq!((r.down_kbps, r.up_kbps), (100_000, 100_000));

    let at_7am = Utc.with_ymd_and_hms(2026, 7, 27, 7, 0, 0).unwrap();
    let r2 = policy::resolve(&sub, Some(&service), &[over], &[night], &at_7am, true);
    assert_eq!((r2.down_kbps, r2.up_kbps), (50_000, 50_000));
}

/// Scenario 4: a static-IP conflict evicts the holder and increments the
/// requesting subscriber's eviction counter by exactly one per attempt.
#[test]
fn scenario_static_ip_conflict_eviction_counter() {
    let tracker = EvictionTracker::new(Duration::from_secs(60));
    let alice_id = 1;

    assert_eq!(tracker.count(alice_id), 0);
    let count = tracker.record(alice_id);
    assert_eq!(count, 1);
    assert_eq!(tracker.count(alice_id), 1);

    // A second re-auth attempt within the window increments again rather
    // than resetting, so the kick-threshold comparison in the auth path
    // sees monotonically increasing attempts.
    let count2 = tracker.record(alice_id);
    assert_eq!(count2, 2);
}

/// Scenario 5: an admin-entered "2M" speed string normalizes to kilobits
/// once, and is never rescaled again when emitted on the wire.
#[test]
fn scenario_speed_string_normalization() {
    let stored = speed::normalize("2M").unwrap();
    assert_eq!(stored, "2000k");

    let up_kbps = 1200u64;
    let down: u64 = stored.trim_end_matches('k').parse().unwrap();
    let rate_limit = speed::encode_rate_limit_attribute(up_kbps, down);
    assert_eq!(rate_limit, "1200k/2000k");
    assert_ne!(rate_limit, "1200k/2000000k");
}

/// Scenario 6: a daily reset boundary computed in a non-UTC IANA timezone
/// crosses exactly once per local day, independent of the process's own
/// timezone.
#[test]
fn scenario_daily_reset_under_timezone_stress() {
    let tz: chrono_tz::Tz = "Asia/Beirut".parse().unwrap();

    let before_reset = tz.with_ymd_and_hms(2026, 7, 27, 0, 4, 59).unwrap();
    let after_reset = tz.with_ymd_and_hms(2026, 7, 27, 0, 5, 30).unwrap();

    let reset_target = tz.with_ymd_and_hms(2026, 7, 27, 0, 5, 0).unwrap();
    assert!(before_reset < reset_target);
    assert!(after_reset >= reset_target);

    // Simulates the reset itself: counters and FUP level both clear, and a
    // previously tier-1-limited subscriber is restored to full speed.
    let mut sub = subscriber();
    sub.daily_bytes_down = 9_800_000_000;
    sub.fup_level_daily = 1;
    let service = service_with_daily_tier();

    sub.daily_bytes_down = 0;
    sub.fup_level_daily = 0;
    let resolved = policy::resolve(&sub, Some(&service), &[], &[], &after_reset.with_timezone(&Utc), true);
    assert_eq!((resolved.down_kbps, resolved.up_kbps), (4000, 1200));
}
