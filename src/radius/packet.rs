//! RADIUS wire codec (RFC 2865/2866/2865bis, RFC 5176 for CoA). Binary
//! header + type-length-value attributes over `bytes::Bytes`, the same
//! buffer type the teacher threads through its packet-parsing path in
//! `src/packet_parser/mod.rs`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use thiserror::Error;

pub const PORT_AUTH: u16 = 1812;
pub const PORT_ACCT: u16 = 1813;
pub const PORT_COA: u16 = 1700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    AccessRequest,
    AccessAccept,
    AccessReject,
    AccountingRequest,
    AccountingResponse,
    AccessChallenge,
    DisconnectRequest,
    DisconnectAck,
    DisconnectNak,
    CoaRequest,
    CoaAck,
    CoaNak,
    Other(u8),
}

impl Code {
    fn as_u8(self) -> u8 {
        match self {
            Code::AccessRequest => 1,
            Code::AccessAccept => 2,
            Code::AccessReject => 3,
            Code::AccountingRequest => 4,
            Code::AccountingResponse => 5,
            Code::AccessChallenge => 11,
            Code::DisconnectRequest => 40,
            Code::DisconnectAck => 41,
            Code::DisconnectNak => 42,
            Code::CoaRequest => 43,
            Code::CoaAck => 44,
            Code::CoaNak => 45,
            Code::Other(c) => c,
        }
    }

    fn from_u8(v: u8) -> Code {
        match v {
            1 => Code::AccessRequest,
            2 => Code::AccessAccept,
            3 => Code::AccessReject,
            4 => Code::AccountingRequest,
            5 => Code::AccountingResponse,
            11 => Code::AccessChallenge,
            40 => Code::DisconnectRequest,
            41 => Code::DisconnectAck,
            42 => Code::DisconnectNak,
            43 => Code::CoaRequest,
            44 => Code::CoaAck,
            45 => Code::CoaNak,
            other => Code::Other(other),
        }
    }
}

/// Standard RFC 2865/2866/2869 attribute type numbers actually consumed or
/// emitted by this server. Vendor-specific attributes are carried through
/// `AttrType::VendorSpecific` with a nested vendor-id/sub-type pair instead
/// of being enumerated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    UserName,
    UserPassword,
    ChapPassword,
    NasIpAddress,
    FramedIpAddress,
    ReplyMessage,
    State,
    SessionTimeout,
    IdleTimeout,
    CallingStationId,
    NasIdentifier,
    VendorSpecific,
    AcctStatusType,
    AcctDelayTime,
    AcctInputOctets,
    AcctOutputOctets,
    AcctSessionId,
    AcctSessionTime,
    AcctTerminateCause,
    MessageAuthenticator,
    Other(u8),
}

impl AttrType {
    fn as_u8(self) -> u8 {
        match self {
            AttrType::UserName => 1,
            AttrType::UserPassword => 2,
            AttrType::ChapPassword => 3,
            AttrType::NasIpAddress => 4,
            AttrType::FramedIpAddress => 8,
            AttrType::ReplyMessage => 18,
            AttrType::State => 24,
            AttrType::SessionTimeout => 27,
            AttrType::IdleTimeout => 28,
            AttrType::CallingStationId => 31,
            AttrType::NasIdentifier => 32,
            AttrType::VendorSpecific => 26,
            AttrType::AcctStatusType => 40,
            AttrType::AcctDelayTime => 41,
            AttrType::AcctInputOctets => 42,
            AttrType::AcctOutputOctets => 43,
            AttrType::AcctSessionId => 44,
            AttrType::AcctSessionTime => 46,
            AttrType::AcctTerminateCause => 49,
            AttrType::MessageAuthenticator => 80,
            AttrType::Other(v) => v,
        }
    }

    fn from_u8(v: u8) -> AttrType {
        match v {
            1 => AttrType::UserName,
            2 => AttrType::UserPassword,
            3 => AttrType::ChapPassword,
            4 => AttrType::NasIpAddress,
            8 => AttrType::FramedIpAddress,
            18 => AttrType::ReplyMessage,
            24 => AttrType::State,
            27 => AttrType::SessionTimeout,
            28 => AttrType::IdleTimeout,
            31 => AttrType::CallingStationId,
            32 => AttrType::NasIdentifier,
            26 => AttrType::VendorSpecific,
            40 => AttrType::AcctStatusType,
            41 => AttrType::AcctDelayTime,
            42 => AttrType::AcctInputOctets,
            43 => AttrType::AcctOutputOctets,
            44 => AttrType::AcctSessionId,
            46 => AttrType::AcctSessionTime,
            49 => AttrType::AcctTerminateCause,
            80 => AttrType::MessageAuthenticator,
            other => AttrType::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: AttrType,
    pub value: Bytes,
}

impl Attribute {
    pub fn new(attr_type: AttrType, value: impl Into<Bytes>) -> Self {
        Self { attr_type, value: value.into() }
    }

    pub fn string(attr_type: AttrType, s: &str) -> Self {
        Self::new(attr_type, Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// The vendor rate-limit attribute (§6): a vendor-specific attribute whose
/// value is the ASCII string `"<up>k/<down>k"`. Carried as vendor-id 0
/// (site-local) sub-type 1 here since the spec does not fix a real IANA
/// enterprise number for it.
pub const RATE_LIMIT_VENDOR_ID: u32 = 0;
pub const RATE_LIMIT_VENDOR_TYPE: u8 = 1;

pub fn encode_vendor_rate_limit(value: &str) -> Attribute {
    let mut buf = BytesMut::new();
    buf.put_u32(RATE_LIMIT_VENDOR_ID);
    buf.put_u8(RATE_LIMIT_VENDOR_TYPE);
    buf.put_u8((2 + value.len()) as u8);
    buf.put_slice(value.as_bytes());
    Attribute::new(AttrType::VendorSpecific, buf.freeze())
}

pub fn decode_vendor_rate_limit(attrs: &[Attribute]) -> Option<String> {
    for attr in attrs {
        if attr.attr_type != AttrType::VendorSpecific || attr.value.len() < 6 {
            continue;
        }
        let vendor_id = u32::from_be_bytes(attr.value[0..4].try_into().ok()?);
        let sub_type = attr.value[4];
        if vendor_id == RATE_LIMIT_VENDOR_ID && sub_type == RATE_LIMIT_VENDOR_TYPE {
            let sub_len = attr.value[5] as usize;
            if attr.value.len() >= 6 + sub_len.saturating_sub(2) {
                let s = &attr.value[6..6 + sub_len.saturating_sub(2)];
                return String::from_utf8(s.to_vec()).ok();
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet shorter than the 20-byte RADIUS header")]
    TooShort,
    #[error("length field {declared} does not match buffer size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("attribute at offset {0} has a zero or truncated length")]
    MalformedAttribute(usize),
}

impl Packet {
    pub fn get(&self, attr_type: AttrType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn get_string(&self, attr_type: AttrType) -> Option<String> {
        self.get(attr_type)
            .and_then(|a| String::from_utf8(a.value.to_vec()).ok())
    }

    pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 20 {
            return Err(PacketError::TooShort);
        }
        let code = Code::from_u8(buf[0]);
        let identifier = buf[1];
        let declared_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if declared_len > buf.len() {
            return Err(PacketError::LengthMismatch { declared: declared_len, actual: buf.len() });
        }
        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&buf[4..20]);

        let mut attributes = Vec::new();
        let mut cursor = &buf[20..declared_len];
        let mut offset = 20;
        while !cursor.is_empty() {
            if cursor.len() < 2 {
                return Err(PacketError::MalformedAttribute(offset));
            }
            let attr_type = cursor[0];
            let attr_len = cursor[1] as usize;
            if attr_len < 2 || attr_len > cursor.len() {
                return Err(PacketError::MalformedAttribute(offset));
            }
            let value = Bytes::copy_from_slice(&cursor[2..attr_len]);
            attributes.push(Attribute::new(AttrType::from_u8(attr_type), value));
            cursor = &cursor[attr_len..];
            offset += attr_len;
        }

        Ok(Packet { code, identifier, authenticator, attributes })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        for attr in &self.attributes {
            body.put_u8(attr.attr_type.as_u8());
            body.put_u8((2 + attr.value.len()) as u8);
            body.put_slice(&attr.value);
        }

        let total_len = 20 + body.len();
        let mut out = BytesMut::with_capacity(total_len);
        out.put_u8(self.code.as_u8());
        out.put_u8(self.identifier);
        out.put_u16(total_len as u16);
        out.put_slice(&self.authenticator);
        out.put_slice(&body);
        out
    }

    /// Computes the response authenticator per RFC 2865 §3: MD5 over
    /// (code, id, length, request-authenticator, attributes, shared-secret).
    pub fn sign_response(&mut self, request_authenticator: &[u8; 16], secret: &[u8]) {
        self.authenticator = *request_authenticator;
        let mut encoded = self.encode();
        let len = encoded.len();
        encoded[4..20].copy_from_slice(request_authenticator);
        encoded.put_slice(secret);
        let digest = Md5::digest(&encoded[..len + secret.len()]);
        self.authenticator.copy_from_slice(&digest);
    }

    /// Computes a self-originated request authenticator (RFC 2866 §4.1,
    /// reused by RFC 5176 §3 for CoA-Request/Disconnect-Request): MD5 over
    /// (code, id, length, 16 zero bytes, attributes, secret). Unlike
    /// `sign_response`, there is no prior request authenticator to sign
    /// against -- the zero bytes are the input, not a stand-in for it.
    pub fn sign_request(&mut self, secret: &[u8]) {
        self.authenticator = [0u8; 16];
        let mut encoded = self.encode();
        encoded.put_slice(secret);
        let digest = Md5::digest(&encoded);
        self.authenticator.copy_from_slice(&digest);
    }

    /// Verifies a request authenticator carried in an Accounting-Request
    /// (RFC 2866 §4.1): MD5 over (code, id, length, 16 zero bytes,
    /// attributes, secret) must equal the authenticator on the wire.
    pub fn verify_accounting_authenticator(raw: &[u8], secret: &[u8]) -> bool {
        if raw.len() < 20 {
            return false;
        }
        let mut buf = BytesMut::from(raw);
        for b in &mut buf[4..20] {
            *b = 0;
        }
        buf.put_slice(secret);
        let digest = Md5::digest(&buf);
        digest.as_slice() == &raw[4..20]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_packet() {
        let pkt = Packet {
            code: Code::AccessRequest,
            identifier: 7,
            authenticator: [1u8; 16],
            attributes: vec![Attribute::string(AttrType::UserName, "alice@isp.net")],
        };
        let encoded = pkt.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.identifier, 7);
        assert_eq!(decoded.get_string(AttrType::UserName).unwrap(), "alice@isp.net");
    }

    #[test]
    fn rejects_undersized_buffers() {
        assert!(matches!(Packet::decode(&[0u8; 10]), Err(PacketError::TooShort)));
    }

    #[test]
    fn vendor_rate_limit_round_trips() {
        let attr = encode_vendor_rate_limit("1200k/4000k");
        let decoded = decode_vendor_rate_limit(&[attr]).unwrap();
        assert_eq!(decoded, "1200k/4000k");
    }
}
