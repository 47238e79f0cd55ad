pub mod address;
mod error;

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

pub use self::error::{ErrKind, ErrorCode};
use self::address::Addr;
use crate::Error as CodecError;

/// attribute type registry.
///
/// Types below 0x8000 are comprehension-required: a request carrying
/// one the receiver does not understand must be rejected with 420.
/// Types at or above 0x8000 are comprehension-optional and are ignored
/// (but preserved) when unknown.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum AttrKind {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    Software = 0x8022,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
}

/// dyn stun/turn message attribute.
///
/// An attribute couples a registry type with the serialization of its
/// value.  XOR'ed address attributes additionally need the transaction
/// id, which is threaded through as `token`.
pub trait Attribute<'a> {
    const TYPE: AttrKind;

    /// current attribute inner value type.
    type Item;

    /// write the current attribute to the buffer.
    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]);

    /// convert buffer to current attribute.
    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError>;
}

/// Names the credential a MESSAGE-INTEGRITY was keyed with.  A
/// connectivity check carries `<receiver-ufrag>:<sender-ufrag>`, so
/// the receiver finds its own fragment first and can look its
/// password up before touching the hmac.
pub struct UserName;

impl<'a> Attribute<'a> for UserName {
    const TYPE: AttrKind = AttrKind::UserName;

    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// Payload of Send and Data indications: the exact bytes the client
/// and the peer would have exchanged directly had no relay been on
/// the path.
pub struct Data;

impl<'a> Attribute<'a> for Data {
    const TYPE: AttrKind = AttrKind::Data;

    type Item = &'a [u8];

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(buf)
    }
}

/// The authentication domain of a long-term credential server.  Its
/// presence on a request marks the request as long-term
/// authenticated; servers advertise it in their 401 challenge.
pub struct Realm;

impl<'a> Attribute<'a> for Realm {
    const TYPE: AttrKind = AttrKind::Realm;

    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// Server-chosen opaque value echoed back on every authenticated
/// request of a long-term session.  When it goes stale the server
/// answers 438 with a replacement and the client retries.
pub struct Nonce;

impl<'a> Attribute<'a> for Nonce {
    const TYPE: AttrKind = AttrKind::Nonce;

    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// Free-form description of the sending implementation, stamped on
/// generated messages purely for debugging; receivers never act on
/// it.
pub struct Software;

impl<'a> Attribute<'a> for Software {
    const TYPE: AttrKind = AttrKind::Software;

    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// HMAC-SHA1 over the message prefix, with the header length field
/// rewritten to end just past this attribute so a trailing
/// fingerprint stays outside the digest.  The key depends on the
/// credential mechanism in use.
pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    const TYPE: AttrKind = AttrKind::MessageIntegrity;

    type Item = &'a [u8];

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(buf)
    }
}

/// The reflexive transport address in plain binary encoding, kept
/// for rfc3489-era interop only.
pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    const TYPE: AttrKind = AttrKind::MappedAddress;

    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, false)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(buf, token, false)
    }
}

/// The reflexive transport address as the responder saw it, masked
/// with the magic cookie and transaction id so address-rewriting nats
/// cannot tamper with it in flight.  This is the attribute the stun
/// and ice machinery actually read; MAPPED-ADDRESS is legacy.
pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    const TYPE: AttrKind = AttrKind::XorMappedAddress;

    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(buf, token, true)
    }
}

/// The peer a relayed payload is going to (Send indication,
/// CreatePermission) or came from (Data indication), in the masked
/// address encoding.
pub struct XorPeerAddress;

impl<'a> Attribute<'a> for XorPeerAddress {
    const TYPE: AttrKind = AttrKind::XorPeerAddress;

    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(buf, token, true)
    }
}

/// The transport address a successful Allocate reserved on the turn
/// server, in the masked address encoding; it becomes the address of
/// the relayed candidate.
pub struct XorRelayedAddress;

impl<'a> Attribute<'a> for XorRelayedAddress {
    const TYPE: AttrKind = AttrKind::XorRelayedAddress;

    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(buf, token, true)
    }
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    const TYPE: AttrKind = AttrKind::ErrorCode;

    type Item = ErrorCode<'a>;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        value.encode(buf)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        ErrorCode::try_from(buf)
    }
}

/// List of 16-bit attribute types a 420 error response did not
/// understand, so the sender knows exactly what to strip before
/// retrying.
pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    const TYPE: AttrKind = AttrKind::UnknownAttributes;

    type Item = Vec<u16>;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        for kind in value {
            buf.put_u16(kind);
        }
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if buf.len() % 2 != 0 {
            return Err(CodecError::InvalidInput);
        }

        Ok(buf
            .chunks_exact(2)
            .map(|it| u16::from_be_bytes([it[0], it[1]]))
            .collect())
    }
}

/// Seconds until the turn server forgets the allocation unless a
/// Refresh arrives first; requesting zero tears it down.
pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    const TYPE: AttrKind = AttrKind::Lifetime;

    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(u32::from_be_bytes(
            buf.get(..4).ok_or(CodecError::InvalidInput)?.try_into()?,
        ))
    }
}

/// Transport protocol requested for an allocation, as an ip protocol
/// number.  Only udp (17) is meaningful here; the three trailing
/// bytes are reserved and sent as zero.
pub struct RequestedTransport;

impl<'a> Attribute<'a> for RequestedTransport {
    const TYPE: AttrKind = AttrKind::RequestedTransport;

    type Item = u8;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(value);
        buf.put(&[0u8; 3][..]);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::InvalidInput);
        }

        Ok(buf[0])
    }
}

/// Asks the turn server for an even relayed port, with the high bit
/// additionally reserving the next odd port for a companion
/// allocation.  Only that reserve bit is modeled.
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    const TYPE: AttrKind = AttrKind::EvenPort;

    type Item = bool;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(if value { 0x80 } else { 0 });
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::InvalidInput);
        }

        Ok(buf[0] & 0x80 != 0)
    }
}

/// The candidate priority the sender would assign to a peer
/// reflexive candidate discovered through this check; the receiver
/// uses it when it learns a new remote address from the request.
pub struct Priority;

impl<'a> Attribute<'a> for Priority {
    const TYPE: AttrKind = AttrKind::Priority;

    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(u32::from_be_bytes(
            buf.get(..4).ok_or(CodecError::InvalidInput)?.try_into()?,
        ))
    }
}

/// Nomination marker on a check from the controlling agent: the pair
/// this check probes becomes the selected pair once it succeeds.
/// Empty on the wire, presence is the whole signal.
pub struct UseCandidate;

impl<'a> Attribute<'a> for UseCandidate {
    const TYPE: AttrKind = AttrKind::UseCandidate;

    type Item = ();

    fn serialize(_: Self::Item, _: &mut BytesMut, _: &[u8]) {}

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(())
    }
}

/// Claim of the controlling role on a connectivity check, carrying
/// the sender's 64-bit tie-breaker so a double claim can be settled
/// deterministically (the larger value keeps the role).
pub struct IceControlling;

impl<'a> Attribute<'a> for IceControlling {
    const TYPE: AttrKind = AttrKind::IceControlling;

    type Item = u64;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(u64::from_be_bytes(
            buf.get(..8).ok_or(CodecError::InvalidInput)?.try_into()?,
        ))
    }
}

/// Claim of the controlled role on a connectivity check, with the
/// same tie-breaker content as its controlling counterpart.
pub struct IceControlled;

impl<'a> Attribute<'a> for IceControlled {
    const TYPE: AttrKind = AttrKind::IceControlled;

    type Item = u64;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(u64::from_be_bytes(
            buf.get(..8).ok_or(CodecError::InvalidInput)?.try_into()?,
        ))
    }
}

/// CRC-32 of the message up to this attribute, xor'ed with
/// 0x5354554e.  Always the last attribute when present; demultiplexers
/// use it to tell stun apart from other traffic on a shared port.
pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    const TYPE: AttrKind = AttrKind::Fingerprint;

    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value)
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(u32::from_be_bytes(
            buf.get(..4).ok_or(CodecError::InvalidInput)?.try_into()?,
        ))
    }
}
