//! Accounting-Request handling (§4.2 "Accounting flow"): Start, Interim-
//! Update, Stop. Each event becomes a [`crate::db::PendingAccountingWrite`]
//! applied through the Datastore, falling back to the overflow buffer on a
//! database error exactly as §4.1 "Failure" specifies.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::db::models::NasDevice;
use crate::db::{AccountingEvent, PendingAccountingWrite, Store, StoreError};

use super::packet::{AttrType, Code, Packet};

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("missing Acct-Session-Id")]
    MissingSessionId,
    #[error("missing User-Name")]
    MissingUsername,
    #[error("missing or unrecognized Acct-Status-Type")]
    MissingStatusType,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acct-Status-Type values (RFC 2866 §5.1).
const STATUS_START: i32 = 1;
const STATUS_STOP: i32 = 2;
const STATUS_INTERIM: i32 = 3;

pub async fn handle_accounting_request(
    store: &Arc<Store>,
    request: &Packet,
    nas: &NasDevice,
    log: &slog::Logger,
) -> Result<Packet, AccountingError> {
    let session_id = request
        .get_string(AttrType::AcctSessionId)
        .ok_or(AccountingError::MissingSessionId)?;
    let username = request
        .get_string(AttrType::UserName)
        .ok_or(AccountingError::MissingUsername)?;

    let status_type = request
        .get(AttrType::AcctStatusType)
        .and_then(|a| a.value.get(0..4).map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        .ok_or(AccountingError::MissingStatusType)?;

    let (subscriber, _service, _age) = store.get_subscriber_by_username(&username).await?;

    let bytes_up = read_u32_attr(request, AttrType::AcctInputOctets).unwrap_or(0) as i64;
    let bytes_down = read_u32_attr(request, AttrType::AcctOutputOctets).unwrap_or(0) as i64;
    let framed_ip = request
        .get(AttrType::FramedIpAddress)
        .and_then(|a| parse_ipv4(&a.value))
        .map(IpNetwork::from);

    let event = match status_type {
        STATUS_START => AccountingEvent::Start,
        STATUS_INTERIM => AccountingEvent::Interim,
        STATUS_STOP => AccountingEvent::Stop { cause: terminate_cause(request) },
        other => {
            slog::debug!(log, "dropping accounting request with unrecognized status type";
                "status_type" => other);
            return Ok(response_for(request));
        }
    };

    let write = PendingAccountingWrite {
        session_id,
        subscriber_id: subscriber.id,
        nas_id: nas.id,
        framed_ip,
        bytes_up,
        bytes_down,
        event,
        timestamp: chrono::Utc::now(),
    };

    match store.upsert_accounting_record(&write).await {
        Ok(()) => {}
        Err(e) => {
            slog::warn!(log, "accounting write failed, queuing to overflow buffer"; "err" => %e);
            store.overflow.push(write);
        }
    }

    Ok(response_for(request))
}

fn response_for(request: &Packet) -> Packet {
    Packet {
        code: Code::AccountingResponse,
        identifier: request.identifier,
        authenticator: [0u8; 16],
        attributes: vec![],
    }
}

fn read_u32_attr(request: &Packet, attr_type: AttrType) -> Option<u32> {
    request
        .get(attr_type)
        .and_then(|a| a.value.get(0..4))
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn parse_ipv4(value: &[u8]) -> Option<IpAddr> {
    if value.len() != 4 {
        return None;
    }
    Some(IpAddr::from([value[0], value[1], value[2], value[3]]))
}

fn terminate_cause(request: &Packet) -> &'static str {
    match request.get(AttrType::AcctTerminateCause).and_then(|a| a.value.first()) {
        Some(1) => "user-request",
        Some(2) => "lost-carrier",
        Some(6) => "admin-reset",
        _ => "unknown",
    }
}
