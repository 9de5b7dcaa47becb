//! Access-Request handling (§4.2 steps 1-8). PAP and MS-CHAP-v2 credential
//! verification, MAC binding, static-IP conflict detection/eviction, and
//! Access-Accept/Reject construction via the Policy Resolver.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use md4::Md4;
use md5::{Digest, Md5};
use sha1::Sha1;
use thiserror::Error;

use crate::alerts::AlertSink;
use crate::db::models::{NasDevice, Subscriber};
use crate::db::{Store, StoreError};
use crate::enforcement::{Dispatcher, StrategyHint};
use crate::license::LicenseGate;
use crate::policy;

use super::packet::{encode_vendor_rate_limit, AttrType, Attribute, Code, Packet};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-subscriber static-IP eviction counter, bucketed in a rolling window
/// per §4.2 step 7. Separate from the Datastore: this is purely in-process,
/// bounded, fine-grained-locked state (§5 "Static-IP conflict counter").
pub struct EvictionTracker {
    window: Duration,
    counts: DashMap<i32, (u32, Instant)>,
}

impl EvictionTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, counts: DashMap::new() }
    }

    /// Records an eviction attempt for `subscriber_id` and returns the
    /// updated count within the rolling window.
    pub fn record(&self, subscriber_id: i32) -> u32 {
        let mut entry = self.counts.entry(subscriber_id).or_insert((0, Instant::now()));
        if entry.1.elapsed() > self.window {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
        entry.0
    }

    pub fn count(&self, subscriber_id: i32) -> u32 {
        self.counts
            .get(&subscriber_id)
            .filter(|e| e.1.elapsed() <= self.window)
            .map(|e| e.0)
            .unwrap_or(0)
    }
}

/// RFC 2865 §5.2 User-Password construction, run in reverse to recover the
/// plaintext: XOR each 16-byte ciphertext block with MD5(secret ||
/// previous-block), where the first "previous block" is the Request
/// Authenticator and subsequent ones are the preceding ciphertext block.
pub fn pap_decrypt(encrypted: &[u8], secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(encrypted.len());
    let mut prev_block = *authenticator;

    for chunk in encrypted.chunks(16) {
        let mut hasher = Md5::new();
        hasher.update(secret);
        hasher.update(prev_block);
        let hash = hasher.finalize();

        let mut block = [0u8; 16];
        for i in 0..chunk.len() {
            block[i] = chunk[i] ^ hash[i];
        }
        plaintext.extend_from_slice(&block[..chunk.len()]);

        let mut next_prev = [0u8; 16];
        next_prev[..chunk.len()].copy_from_slice(chunk);
        prev_block = next_prev;
    }

    while plaintext.last() == Some(&0) {
        plaintext.pop();
    }
    plaintext
}

/// The inverse of [`pap_decrypt`], used by tests and by any path that needs
/// to re-encrypt a credential for storage verification.
pub fn pap_encrypt(plaintext: &[u8], secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut padded = plaintext.to_vec();
    while padded.len() % 16 != 0 {
        padded.push(0);
    }

    let mut ciphertext = Vec::with_capacity(padded.len());
    let mut prev_block = *authenticator;

    for chunk in padded.chunks(16) {
        let mut hasher = Md5::new();
        hasher.update(secret);
        hasher.update(prev_block);
        let hash = hasher.finalize();

        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ hash[i];
        }
        ciphertext.extend_from_slice(&block);
        prev_block = block;
    }
    ciphertext
}

fn nt_password_hash(password_utf16le: &[u8]) -> [u8; 16] {
    let digest = Md4::digest(password_utf16le);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// Expands a 7-byte DES key to 8 bytes by inserting an odd-parity bit, per
/// RFC 2759 Appendix A.
fn des_key_from_7_bytes(key7: &[u8]) -> [u8; 8] {
    let mut key8 = [0u8; 8];
    key8[0] = key7[0];
    key8[1] = (key7[0] << 7) | (key7[1] >> 1);
    key8[2] = (key7[1] << 6) | (key7[2] >> 2);
    key8[3] = (key7[2] << 5) | (key7[3] >> 3);
    key8[4] = (key7[3] << 4) | (key7[4] >> 4);
    key8[5] = (key7[4] << 3) | (key7[5] >> 5);
    key8[6] = (key7[5] << 2) | (key7[6] >> 6);
    key8[7] = key7[6] << 1;
    key8
}

fn des_encrypt_block(key7: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let key8 = des_key_from_7_bytes(key7);
    let cipher = Des::new_from_slice(&key8).expect("8-byte DES key");
    let mut buf = des::cipher::generic_array::GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf);
    out
}

/// RFC 2759 §8.1: 24-byte NT-Response = three DES encryptions of the
/// 8-byte challenge hash, keyed by 7-byte segments of the zero-padded
/// 21-byte NT password hash.
fn challenge_response(challenge8: &[u8; 8], nt_hash: &[u8; 16]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(nt_hash);

    let mut response = [0u8; 24];
    response[0..8].copy_from_slice(&des_encrypt_block(&padded[0..7], challenge8));
    response[8..16].copy_from_slice(&des_encrypt_block(&padded[7..14], challenge8));
    response[16..24].copy_from_slice(&des_encrypt_block(&padded[14..21], challenge8));
    response
}

/// RFC 2759 §8.2: ChallengeHash = SHA1(PeerChallenge || AuthChallenge ||
/// Username)[0..8].
fn challenge_hash(peer_challenge: &[u8; 16], auth_challenge: &[u8; 16], username: &str) -> [u8; 8] {
    let mut hasher = Sha1::new();
    hasher.update(peer_challenge);
    hasher.update(auth_challenge);
    hasher.update(username.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Verifies an MS-CHAP-v2 response (§4.2 step 5) given the plaintext
/// password recovered from the decrypted credential store.
pub fn verify_ms_chap_v2(
    username: &str,
    password: &str,
    auth_challenge: &[u8; 16],
    peer_challenge: &[u8; 16],
    nt_response: &[u8; 24],
) -> bool {
    let utf16: Vec<u8> = password.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let nt_hash = nt_password_hash(&utf16);
    let chash = challenge_hash(peer_challenge, auth_challenge, username);
    let expected = challenge_response(&chash, &nt_hash);
    expected == *nt_response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accept,
    Reject,
    Drop,
}

pub struct AuthContext {
    pub store: Arc<Store>,
    pub license: Arc<LicenseGate>,
    pub dispatcher: Arc<Dispatcher>,
    pub alerts: AlertSink,
    pub eviction: Arc<EvictionTracker>,
    pub kick_threshold: u32,
    pub timezone: chrono_tz::Tz,
    pub boost_stacks_on_override: bool,
    pub log: slog::Logger,
}

/// Drives §4.2 steps 3-8 once the NAS and the Request-Authenticator have
/// already been validated by the caller (the server loop, which has access
/// to the raw datagram needed for the RFC 2865 §3 MAC).
pub async fn handle_access_request(
    ctx: &AuthContext,
    request: &Packet,
    nas: &NasDevice,
) -> Result<(Packet, AuthOutcome), AuthError> {
    let username = match request.get_string(AttrType::UserName) {
        Some(u) => u,
        None => return Ok((reject(request, "missing User-Name"), AuthOutcome::Reject)),
    };

    if ctx.license.should_reject_new_auth().await {
        return Ok((reject(request, "service temporarily unavailable"), AuthOutcome::Reject));
    }

    let (subscriber, service, _age) = match ctx.store.get_subscriber_by_username(&username).await {
        Ok(v) => v,
        Err(StoreError::SubscriberNotFound) => {
            return Ok((reject(request, "unknown subscriber"), AuthOutcome::Reject));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(expires_at) = subscriber.expires_at {
        if expires_at <= chrono::Utc::now() {
            return Ok((reject(request, "subscription expired"), AuthOutcome::Reject));
        }
    }

    if !verify_credential(request, &subscriber, &nas.shared_secret, &username) {
        return Ok((reject(request, "authentication failed"), AuthOutcome::Reject));
    }

    if let Some(expected_mac) = &subscriber.mac_binding {
        let calling = request.get_string(AttrType::CallingStationId);
        if calling.as_deref() != Some(expected_mac.as_str()) {
            return Ok((reject(request, "MAC binding mismatch"), AuthOutcome::Reject));
        }
    }

    let mut reply_ip = subscriber.framed_ip;
    if let Some(static_ip) = subscriber.framed_ip {
        reply_ip = Some(
            resolve_static_ip_conflict(ctx, &subscriber, static_ip.ip()).await?,
        );
    }

    let resolved = policy::resolve(
        &subscriber,
        service.as_ref(),
        &ctx.store.active_bandwidth_rules(subscriber.id).await?,
        &ctx.store.global_bandwidth_rules().await?,
        &chrono::Utc::now().with_timezone(&ctx.timezone),
        ctx.boost_stacks_on_override,
    );

    let mut accept = Packet {
        code: Code::AccessAccept,
        identifier: request.identifier,
        authenticator: [0u8; 16],
        attributes: vec![],
    };

    if resolved.down_kbps != 0 || resolved.up_kbps != 0 {
        accept
            .attributes
            .push(encode_vendor_rate_limit(&format!("{}k/{}k", resolved.up_kbps, resolved.down_kbps)));
    }

    if let Some(ip) = reply_ip {
        if let IpAddr::V4(v4) = ip.ip() {
            accept
                .attributes
                .push(Attribute::new(AttrType::FramedIpAddress, v4.octets().to_vec()));
        }
    }

    Ok((accept, AuthOutcome::Accept))
}

fn reject(request: &Packet, message: &str) -> Packet {
    Packet {
        code: Code::AccessReject,
        identifier: request.identifier,
        authenticator: [0u8; 16],
        attributes: vec![Attribute::string(AttrType::ReplyMessage, message)],
    }
}

fn verify_credential(request: &Packet, subscriber: &Subscriber, secret: &[u8], username: &str) -> bool {
    if let Some(encrypted) = request.get(AttrType::UserPassword) {
        let plaintext = pap_decrypt(&encrypted.value, secret, &request.authenticator);
        return plaintext == subscriber.credential;
    }

    // MS-CHAP-v2 is carried as a vendor-specific Microsoft attribute pair in
    // real deployments; this server accepts it pre-split into two private
    // attributes by the transport layer for clarity of the crypto path.
    if let (Some(challenge), Some(response)) =
        (request.get(AttrType::Other(11)), request.get(AttrType::Other(25)))
    {
        if challenge.value.len() >= 16 && response.value.len() >= 49 {
            let mut auth_challenge = [0u8; 16];
            auth_challenge.copy_from_slice(&challenge.value[..16]);
            let mut peer_challenge = [0u8; 16];
            peer_challenge.copy_from_slice(&response.value[2..18]);
            let mut nt_response = [0u8; 24];
            nt_response.copy_from_slice(&response.value[26..50]);

            let password = String::from_utf8_lossy(&subscriber.credential).into_owned();
            return verify_ms_chap_v2(username, &password, &auth_challenge, &peer_challenge, &nt_response);
        }
    }

    false
}

async fn resolve_static_ip_conflict(
    ctx: &AuthContext,
    subscriber: &Subscriber,
    static_ip: IpAddr,
) -> Result<ipnetwork::IpNetwork, AuthError> {
    let conflicts = ctx
        .store
        .active_sessions_holding_ip(ipnetwork::IpNetwork::from(static_ip), subscriber.id)
        .await?;

    if conflicts.is_empty() {
        return Ok(ipnetwork::IpNetwork::from(static_ip));
    }

    let count = ctx.eviction.record(subscriber.id);

    // §8 Testable Property 7: at most `kick_threshold` disconnects per
    // (subscriber, session) pair in any 60s window. Once the window's quota
    // is spent, stop evicting and fall through to the fallback-IP path below
    // instead of repeating the disconnect.
    if count <= ctx.kick_threshold {
        for conflict in &conflicts {
            ctx.dispatcher
                .enqueue(conflict.subscriber_id, 0, 0, StrategyHint::ForceDisconnect)
                .await;
        }
    }
    ctx.alerts
        .static_ip_conflict(subscriber.id, &conflicts[0].session_id, count)
        .await;

    if count > ctx.kick_threshold {
        if let IpAddr::V4(v4) = static_ip {
            let fallback = next_free_host_in_subnet(v4);
            return Ok(ipnetwork::IpNetwork::from(IpAddr::V4(fallback)));
        }
    }

    Ok(ipnetwork::IpNetwork::from(static_ip))
}

/// Picks the next host address in the same /24 as a fallback when repeated
/// eviction has failed to free the configured static IP (§4.2 step 7).
fn next_free_host_in_subnet(ip: Ipv4Addr) -> Ipv4Addr {
    let octets = ip.octets();
    let next_host = octets[3].wrapping_add(1).max(1);
    Ipv4Addr::new(octets[0], octets[1], octets[2], next_host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pap_round_trips() {
        let secret = b"topsecret";
        let authenticator = [7u8; 16];
        let plaintext = b"hunter2";
        let encrypted = pap_encrypt(plaintext, secret, &authenticator);
        let decrypted = pap_decrypt(&encrypted, secret, &authenticator);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ms_chap_v2_round_trips_via_manual_construction() {
        let auth_challenge = [1u8; 16];
        let peer_challenge = [2u8; 16];
        let username = "alice@isp.net";
        let password = "hunter2";

        let utf16: Vec<u8> = password.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        let nt_hash = nt_password_hash(&utf16);
        let chash = challenge_hash(&peer_challenge, &auth_challenge, username);
        let response = challenge_response(&chash, &nt_hash);

        assert!(verify_ms_chap_v2(username, password, &auth_challenge, &peer_challenge, &response));
        assert!(!verify_ms_chap_v2(username, "wrong", &auth_challenge, &peer_challenge, &response));
    }

    #[test]
    fn eviction_tracker_resets_outside_window() {
        let tracker = EvictionTracker::new(Duration::from_millis(5));
        assert_eq!(tracker.record(1), 1);
        assert_eq!(tracker.record(1), 2);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.record(1), 1);
    }

    #[test]
    fn fallback_ip_picks_next_host() {
        assert_eq!(next_free_host_in_subnet(Ipv4Addr::new(10, 0, 0, 42)), Ipv4Addr::new(10, 0, 0, 43));
    }
}
