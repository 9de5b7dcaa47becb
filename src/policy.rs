//! Policy Resolver (§4.3). A pure function modulo a clock read, in the same
//! spirit as the teacher's `enforcer.rs` separating policy computation
//! (`RateLimitPolicy`) from the act of applying it. Nothing here touches the
//! database or the network.

use chrono::{DateTime, Datelike, TimeZone, Timelike};

use crate::db::models::{BandwidthRule, Service, Subscriber, SubscriberBandwidthRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonTag {
    Override,
    FupDaily,
    FupMonthly,
    Service,
    BoostedGlobal,
    BoostedService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub down_kbps: i64,
    pub up_kbps: i64,
    pub reason: ReasonTag,
}

/// Minutes-since-midnight window membership. `start == end` means the window
/// covers the whole day (zero-length windows are allowed per §8). `end <
/// start` means the window wraps past midnight; membership is computed
/// modulo 24h. The start boundary is inclusive, the end boundary exclusive.
fn in_window(now_min: i32, start_min: i32, end_min: i32) -> bool {
    if start_min == end_min {
        return true;
    }
    if start_min < end_min {
        now_min >= start_min && now_min < end_min
    } else {
        now_min >= start_min || now_min < end_min
    }
}

fn minute_of_day<Tz: TimeZone>(now: &DateTime<Tz>) -> i32 {
    now.hour() as i32 * 60 + now.minute() as i32
}

fn active_override<Tz: TimeZone>(
    rules: &[SubscriberBandwidthRule],
    now: &DateTime<Tz>,
) -> Option<(i64, i64)> {
    let now_min = minute_of_day(now);
    for rule in rules {
        match rule.kind() {
            crate::db::models::RuleKind::Permanent => {
                return Some((rule.override_download_kbps, rule.override_upload_kbps));
            }
            crate::db::models::RuleKind::Windowed => {
                if let (Some(start), Some(end)) = (rule.window_start_min, rule.window_end_min) {
                    if in_window(now_min, start, end) {
                        return Some((rule.override_download_kbps, rule.override_upload_kbps));
                    }
                }
            }
        }
    }
    None
}

fn fup_base(subscriber: &Subscriber, service: &Service) -> Option<(i64, i64, ReasonTag)> {
    let daily = if subscriber.fup_level_daily >= 1 {
        service
            .daily_fup_tiers
            .0
            .get(subscriber.fup_level_daily as usize - 1)
            .map(|t| (t.reduced_down_kbps, t.reduced_up_kbps))
    } else {
        None
    };

    let monthly = if subscriber.fup_level_monthly >= 1 {
        service
            .monthly_fup_tiers
            .0
            .get(subscriber.fup_level_monthly as usize - 1)
            .map(|t| (t.reduced_down_kbps, t.reduced_up_kbps))
    } else {
        None
    };

    match (daily, monthly) {
        (Some(d), Some(m)) => {
            // Tighter of the two wins; compare by download rate, the
            // dimension FUP tiers are authored against.
            if d.0 <= m.0 {
                Some((d.0, d.1, ReasonTag::FupDaily))
            } else {
                Some((m.0, m.1, ReasonTag::FupMonthly))
            }
        }
        (Some(d), None) => Some((d.0, d.1, ReasonTag::FupDaily)),
        (None, Some(m)) => Some((m.0, m.1, ReasonTag::FupMonthly)),
        (None, None) => None,
    }
}

fn apply_boost(down: i64, up: i64, down_boost_pct: i32, up_boost_pct: i32) -> (i64, i64) {
    let down = down * (100 + down_boost_pct as i64) / 100;
    let up = up * (100 + up_boost_pct as i64) / 100;
    (down, up)
}

/// §4.3's resolution algorithm, in full. `global_rules` should already be
/// filtered to rules whose day-of-week mask matches `now`; this function
/// only evaluates the time window and service targeting.
pub fn resolve<Tz: TimeZone>(
    subscriber: &Subscriber,
    service: Option<&Service>,
    subscriber_rules: &[SubscriberBandwidthRule],
    global_rules: &[BandwidthRule],
    now: &DateTime<Tz>,
    boost_stacks_on_override: bool,
) -> Resolved {
    let service = match service {
        Some(s) => s,
        None => {
            return Resolved { down_kbps: 0, up_kbps: 0, reason: ReasonTag::Service };
        }
    };

    let (base_down, base_up, reason, is_override) =
        if let Some((d, u)) = active_override(subscriber_rules, now) {
            (d, u, ReasonTag::Override, true)
        } else if let Some((d, u, r)) = fup_base(subscriber, service) {
            (d, u, r, false)
        } else {
            (service.download_speed_kbps, service.upload_speed_kbps, ReasonTag::Service, false)
        };

    if is_override && !boost_stacks_on_override {
        return Resolved { down_kbps: base_down, up_kbps: base_up, reason };
    }

    let now_min = minute_of_day(now);
    let weekday = now.weekday();

    let active_global = global_rules.iter().find(|rule| {
        rule.active_on_weekday(weekday)
            && in_window(now_min, rule.window_start_min, rule.window_end_min)
            && rule.targets_service(service.id)
    });

    if let Some(rule) = active_global {
        let (down, up) = apply_boost(base_down, base_up, rule.download_boost_pct, rule.upload_boost_pct);
        return Resolved { down_kbps: down, up_kbps: up, reason: ReasonTag::BoostedGlobal };
    }

    // Service-level time boost never applies on top of an active override;
    // only a global rule is allowed to stack (§9 Open Question resolution).
    if !is_override && service.time_based_speed_enabled {
        if in_window(now_min, service.time_window_start_min, service.time_window_end_min) {
            let (down, up) = apply_boost(
                base_down,
                base_up,
                service.time_download_boost_pct,
                service.time_upload_boost_pct,
            );
            return Resolved { down_kbps: down, up_kbps: up, reason: ReasonTag::BoostedService };
        }
    }

    Resolved { down_kbps: base_down, up_kbps: base_up, reason }
}
