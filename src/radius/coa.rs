//! RADIUS CoA client (§4.5 tiers B and C; RFC 5176). Sends CoA-Request
//! ("update") and Disconnect-Request to a NAS's CoA port and awaits an
//! ACK/NAK within a per-call deadline.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::db::models::NasDevice;

use super::packet::{encode_vendor_rate_limit, AttrType, Attribute, Code, Packet};

const COA_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CoaError {
    #[error("network error talking to NAS CoA port: {0}")]
    Io(#[from] std::io::Error),
    #[error("NAS did not respond within the CoA deadline")]
    Timeout,
    #[error("NAS rejected the request (NAK)")]
    Nak,
    #[error("NAS returned an unexpected response code")]
    UnexpectedResponse,
}

async fn send_and_await(nas: &NasDevice, packet: &Packet, ack: Code, nak: Code) -> Result<(), CoaError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let dest: SocketAddr = format!("{}:{}", nas.management_ip.ip(), nas.coa_port).parse()
        .map_err(|_| CoaError::UnexpectedResponse)?;

    let mut signed = packet.clone();
    signed.sign_request(&nas.shared_secret);
    socket.send_to(&signed.encode(), dest).await?;

    let mut buf = vec![0u8; 4096];
    let (n, _) = timeout(COA_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| CoaError::Timeout)??;

    let response = Packet::decode(&buf[..n]).map_err(|_| CoaError::UnexpectedResponse)?;
    if response.code == ack {
        Ok(())
    } else if response.code == nak {
        Err(CoaError::Nak)
    } else {
        Err(CoaError::UnexpectedResponse)
    }
}

/// Tier B: CoA-Request carrying the new vendor rate-limit attribute.
pub async fn update_rate(
    nas: &NasDevice,
    session_id: &str,
    down_kbps: i64,
    up_kbps: i64,
) -> Result<(), CoaError> {
    let request = Packet {
        code: Code::CoaRequest,
        identifier: 0,
        authenticator: [0u8; 16],
        attributes: vec![
            Attribute::string(AttrType::AcctSessionId, session_id),
            encode_vendor_rate_limit(&format!("{up_kbps}k/{down_kbps}k")),
        ],
    };
    send_and_await(nas, &request, Code::CoaAck, Code::CoaNak).await
}

/// Tier C: Disconnect-Request, forcing the subscriber to re-authenticate.
pub async fn disconnect(nas: &NasDevice, session_id: &str) -> Result<(), CoaError> {
    let request = Packet {
        code: Code::DisconnectRequest,
        identifier: 0,
        authenticator: [0u8; 16],
        attributes: vec![Attribute::string(AttrType::AcctSessionId, session_id)],
    };
    send_and_await(nas, &request, Code::DisconnectAck, Code::DisconnectNak).await
}
