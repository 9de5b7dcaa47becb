//! UDP listener for the auth and accounting ports (§4.2, §6). One
//! `tokio::net::UdpSocket` per port, one spawned `tokio::task` per inbound
//! datagram, mirroring the teacher's `main.rs` packet-capture loop that
//! spawns a task per captured frame with a cloned channel sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::alerts::AlertSink;
use crate::db::Store;
use crate::enforcement::Dispatcher;
use crate::license::LicenseGate;

use super::accounting::handle_accounting_request;
use super::auth::{handle_access_request, AuthContext, EvictionTracker};
use super::packet::{Code, Packet};

const REPLY_DEADLINE: Duration = Duration::from_secs(3);

pub struct RadiusServer {
    store: Arc<Store>,
    auth_ctx: Arc<AuthContext>,
    log: slog::Logger,
}

impl RadiusServer {
    pub fn new(
        store: Arc<Store>,
        license: Arc<LicenseGate>,
        dispatcher: Arc<Dispatcher>,
        alerts: AlertSink,
        kick_threshold: u32,
        timezone: chrono_tz::Tz,
        boost_stacks_on_override: bool,
        log: slog::Logger,
    ) -> Self {
        let auth_ctx = Arc::new(AuthContext {
            store: store.clone(),
            license,
            dispatcher,
            alerts,
            eviction: Arc::new(EvictionTracker::new(Duration::from_secs(60))),
            kick_threshold,
            timezone,
            boost_stacks_on_override,
            log: log.clone(),
        });
        Self { store, auth_ctx, log }
    }

    pub async fn run_auth(&self, bind_addr: SocketAddr) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        slog::info!(self.log, "RADIUS auth listener bound"; "addr" => %bind_addr);

        let mut buf = vec![0u8; 4096];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            let raw = buf[..n].to_vec();
            let socket = socket.clone();
            let store = self.store.clone();
            let ctx = self.auth_ctx.clone();
            let log = self.log.clone();

            tokio::spawn(async move {
                if let Err(e) = timeout(REPLY_DEADLINE, handle_auth_datagram(&store, &ctx, &raw, src, &socket)).await
                {
                    slog::warn!(log, "access-request reply deadline exceeded"; "src" => %src, "err" => %e);
                }
            });
        }
    }

    pub async fn run_accounting(&self, bind_addr: SocketAddr) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        slog::info!(self.log, "RADIUS accounting listener bound"; "addr" => %bind_addr);

        let mut buf = vec![0u8; 4096];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            let raw = buf[..n].to_vec();
            let socket = socket.clone();
            let store = self.store.clone();
            let log = self.log.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_acct_datagram(&store, &raw, src, &socket, &log).await {
                    slog::warn!(log, "accounting datagram handling failed"; "src" => %src, "err" => %e);
                }
            });
        }
    }
}

async fn handle_auth_datagram(
    store: &Arc<Store>,
    ctx: &Arc<AuthContext>,
    raw: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
) -> anyhow::Result<()> {
    let nas = match store.nas_by_ip(src.ip()).await? {
        Some(nas) => nas,
        None => {
            slog::debug!(ctx.log, "dropping packet from unknown NAS"; "src" => %src);
            return Ok(());
        }
    };

    let packet = match Packet::decode(raw) {
        Ok(p) => p,
        Err(e) => {
            slog::debug!(ctx.log, "dropping malformed packet"; "src" => %src, "err" => %e);
            return Ok(());
        }
    };

    if packet.code != Code::AccessRequest {
        return Ok(());
    }

    if !verify_message_authenticator(raw, &nas.shared_secret) {
        slog::debug!(ctx.log, "dropping packet failing message authenticator check"; "src" => %src);
        return Ok(());
    }

    let (mut reply, _outcome) = handle_access_request(ctx, &packet, &nas).await?;
    reply.sign_response(&packet.authenticator, &nas.shared_secret);
    socket.send_to(&reply.encode(), src).await?;
    Ok(())
}

async fn handle_acct_datagram(
    store: &Arc<Store>,
    raw: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    log: &slog::Logger,
) -> anyhow::Result<()> {
    let nas = match store.nas_by_ip(src.ip()).await? {
        Some(nas) => nas,
        None => {
            slog::debug!(log, "dropping accounting packet from unknown NAS"; "src" => %src);
            return Ok(());
        }
    };

    let packet = match Packet::decode(raw) {
        Ok(p) => p,
        Err(e) => {
            slog::debug!(log, "dropping malformed accounting packet"; "src" => %src, "err" => %e);
            return Ok(());
        }
    };

    if packet.code != Code::AccountingRequest {
        return Ok(());
    }

    if !Packet::verify_accounting_authenticator(raw, &nas.shared_secret) {
        slog::debug!(log, "dropping accounting packet failing authenticator check"; "src" => %src);
        return Ok(());
    }

    let mut reply = handle_accounting_request(store, &packet, &nas, log).await?;
    reply.sign_response(&packet.authenticator, &nas.shared_secret);
    socket.send_to(&reply.encode(), src).await?;
    Ok(())
}

type HmacMd5 = Hmac<Md5>;

/// RFC 2869 §5.14 Message-Authenticator: HMAC-MD5 over the whole packet
/// with the attribute's own value zeroed, keyed by the shared secret. A
/// request carrying no such attribute is accepted (many deployed NASes omit
/// it for PAP), but one carrying a mismatching value is dropped.
fn verify_message_authenticator(raw: &[u8], secret: &[u8]) -> bool {
    const MESSAGE_AUTHENTICATOR_TYPE: u8 = 80;
    let Some(pos) = find_attribute(raw, MESSAGE_AUTHENTICATOR_TYPE) else {
        return true;
    };
    let len = raw[pos + 1] as usize;
    if len != 18 {
        return false;
    }

    let mut zeroed = raw.to_vec();
    zeroed[pos + 2..pos + 18].fill(0);

    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&zeroed);
    let expected = mac.finalize().into_bytes();
    expected.as_slice() == &raw[pos + 2..pos + 18]
}

fn find_attribute(raw: &[u8], attr_type: u8) -> Option<usize> {
    let mut cursor = 20;
    while cursor + 2 <= raw.len() {
        let t = raw[cursor];
        let len = raw[cursor + 1] as usize;
        if len < 2 || cursor + len > raw.len() {
            return None;
        }
        if t == attr_type {
            return Some(cursor);
        }
        cursor += len;
    }
    None
}
