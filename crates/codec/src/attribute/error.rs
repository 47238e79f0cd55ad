use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error as CodecError;

/// Error codes the ice core sends or reacts to, by their decimal
/// value.
///
/// The ones that drive control flow here:
///
/// * 401 makes a client retry with credentials (or give up when it
///   already had them);
/// * 420 is the answer to a request carrying a comprehension-required
///   attribute the receiver does not know, together with an
///   UNKNOWN-ATTRIBUTES list;
/// * 438 tells a long-term session to pick up the fresh nonce and
///   retry;
/// * 486 and 508 mean the turn server cannot host the allocation, the
///   harvester falls back to a plain reflexive mapping;
/// * 487 is the role conflict signal of the connectivity checker: the
///   agent with the higher tie-breaker answers it, the other one
///   switches roles.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrKind {
    TryAlternate = 300,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    UnknownAttribute = 420,
    AllocationMismatch = 437,
    StaleNonce = 438,
    AddressFamilyNotSupported = 440,
    WrongCredentials = 441,
    UnsupportedTransportAddress = 442,
    AllocationQuotaReached = 486,
    RoleConflict = 487,
    ServerError = 500,
    InsufficientCapacity = 508,
}

impl ErrKind {
    /// the recommended reason phrase.
    #[rustfmt::skip]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TryAlternate => "Try Alternate",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::UnknownAttribute => "Unknown Attribute",
            Self::AllocationMismatch => "Allocation Mismatch",
            Self::StaleNonce => "Stale Nonce",
            Self::AddressFamilyNotSupported => "Address Family Not Supported",
            Self::WrongCredentials => "Wrong Credentials",
            Self::UnsupportedTransportAddress => "Unsupported Transport Address",
            Self::AllocationQuotaReached => "Allocation Quota Reached",
            Self::RoleConflict => "Role Conflict",
            Self::ServerError => "Server Error",
            Self::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}

/// ERROR-CODE attribute value.
///
/// On the wire the decimal code is split into its hundreds digit (the
/// class) and the remainder, with two leading alignment bytes that
/// receivers ignore:
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The reason phrase is utf-8 and purely diagnostic; equality of two
/// values looks at the code alone.
#[derive(Clone, Debug)]
pub struct ErrorCode<'a> {
    /// decimal code, e.g. 487.
    pub code: u16,
    pub reason: &'a str,
}

impl ErrorCode<'_> {
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::attribute::{ErrKind, ErrorCode};
    ///
    /// let error = ErrorCode::from(ErrKind::RoleConflict);
    /// assert_eq!(error.code, 487);
    /// assert_eq!(error.reason, "Role Conflict");
    /// ```
    pub fn from(kind: ErrKind) -> Self {
        Self {
            code: kind as u16,
            reason: kind.reason(),
        }
    }

    /// the known kind behind the code, if it is one this crate
    /// understands.
    pub fn kind(&self) -> Option<ErrKind> {
        ErrKind::try_from(self.code).ok()
    }

    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::attribute::{ErrKind, ErrorCode};
    /// use bytes::BytesMut;
    ///
    /// let mut buf = BytesMut::with_capacity(64);
    /// ErrorCode::from(ErrKind::RoleConflict).encode(&mut buf);
    ///
    /// // class 4, number 87, then the reason phrase.
    /// assert_eq!(&buf[..4], &[0x00, 0x00, 0x04, 0x57]);
    /// assert_eq!(&buf[4..], b"Role Conflict".as_slice());
    /// ```
    pub fn encode(self, buf: &mut BytesMut) {
        buf.put_u16(0);
        buf.put_u8((self.code / 100) as u8);
        buf.put_u8((self.code % 100) as u8);
        buf.put(self.reason.as_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ErrorCode<'a> {
    type Error = CodecError;

    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::attribute::{ErrKind, ErrorCode};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x04, 0x26, 0x53, 0x74, 0x61, 0x6c, 0x65, 0x20, 0x4e,
    ///     0x6f, 0x6e, 0x63, 0x65,
    /// ];
    ///
    /// let error = ErrorCode::try_from(&buffer[..]).unwrap();
    /// assert_eq!(error.kind(), Some(ErrKind::StaleNonce));
    /// assert_eq!(error.code, 438);
    /// assert_eq!(error.reason, "Stale Nonce");
    /// ```
    fn try_from(packet: &'a [u8]) -> Result<Self, CodecError> {
        if packet.len() < 4 {
            return Err(CodecError::InvalidInput);
        }

        // the reserved bytes are ignored per the rfc; the number part
        // is the code modulo 100 and cannot reach it.
        let (class, number) = (packet[2] as u16, packet[3] as u16);
        if number >= 100 {
            return Err(CodecError::InvalidInput);
        }

        Ok(Self {
            code: class * 100 + number,
            reason: std::str::from_utf8(&packet[4..])?,
        })
    }
}

impl Eq for ErrorCode<'_> {}
impl PartialEq for ErrorCode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
