//! ## STUN wire codec
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//! [RFC5245]: https://tools.ietf.org/html/rfc5245
//!
//! Everything the ice core puts on the wire is a STUN message
//! ([RFC5389]): plain binding exchanges, the TURN extension methods
//! ([RFC5766]) and the connectivity checks of ICE itself ([RFC5245])
//! all share one 20-byte header, one attribute layout and one
//! integrity scheme, differing only in which methods and attributes
//! they use.  This crate is that shared layer: the method and
//! attribute registries, zero-copy decoding, append-style encoding,
//! XOR address masking, MESSAGE-INTEGRITY and FINGERPRINT.  Nothing
//! here owns a socket or a timer; the transaction machinery lives a
//! crate above.

pub mod attribute;
pub mod crypto;
pub mod message;
pub mod method;

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

use crate::{attribute::AttrKind, message::MessageReader, method::Method};

/// The magic cookie field MUST contain the fixed value 0x2112A442 in
/// network byte order.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// The transaction ID is a 96-bit identifier, used to uniquely identify
/// STUN transactions.
pub type Token = [u8; 12];

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    TruncatedHeader,
    NotFoundMagicCookie,
    UnalignedLength,
    UnknownMethod,
    MisplacedIntegrity,
    NotFoundIntegrity,
    IntegrityFailed,
    SummaryFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// A cache of the list of attributes, this is for internal use only.
///
/// Attribute types are stored raw so that attributes this crate does
/// not understand survive a decode untouched and can still be walked
/// by the validation layer.
#[derive(Debug, Clone)]
pub struct Attributes(Vec<(u16, Range<usize>)>);

impl Default for Attributes {
    fn default() -> Self {
        Self(Vec::with_capacity(20))
    }
}

impl Attributes {
    /// Adds an attribute to the list.
    pub fn append(&mut self, kind: u16, range: Range<usize>) {
        self.0.push((kind, range));
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching
    /// attribute in the list and return it.
    pub fn get(&self, kind: AttrKind) -> Option<Range<usize>> {
        self.0
            .iter()
            .find(|(k, _)| *k == kind as u16)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from the list.
    ///
    /// A stun message can carry multiple attributes of the same type,
    /// this function returns all of them in order of appearance.
    pub fn get_all<'a>(&'a self, kind: AttrKind) -> impl Iterator<Item = &'a Range<usize>> {
        self.0
            .iter()
            .filter(move |(k, _)| *k == kind as u16)
            .map(|(_, v)| v)
    }

    /// Comprehension-required attribute types (< 0x8000) that are not
    /// part of the known registry.  A request carrying any of these
    /// must be answered with 420 Unknown Attribute.
    pub fn unknown_required(&self) -> Vec<u16> {
        self.0
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| *k < 0x8000 && AttrKind::try_from(*k).is_err())
            .collect()
    }

    pub fn clear(&mut self) {
        if !self.0.is_empty() {
            self.0.clear();
        }
    }
}

/// Reusable message decoder.
///
/// Holds the attribute cache so that decoding successive datagrams on
/// one worker does not allocate.
#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    /// try decoder bytes as message.
    ///
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::Decoder;
    /// use ice_agent_codec::method::{Kind, Method};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a,
    ///     0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let message = decoder.decode(&buffer).unwrap();
    ///
    /// assert_eq!(message.method(), Method::Binding(Kind::Request));
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<MessageReader<'a>, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        self.0.clear();
        MessageReader::decode(bytes, &mut self.0)
    }

    /// Whether a buffer starts with a plausible stun header.  Used by
    /// packet filters to siphon stun traffic off a shared socket
    /// without running a full decode.
    pub fn is_message(bytes: &[u8]) -> bool {
        bytes.len() >= 20
            && bytes[0] >> 6 == 0
            && bytes[4..8] == MAGIC_COOKIE.to_be_bytes()
            && Method::try_from(u16::from_be_bytes([bytes[0], bytes[1]])).is_ok()
    }

    /// get the message size.
    ///
    /// The stream transport needs this to reassemble a complete
    /// message from a byte stream before handing it to `decode`.
    ///
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::Decoder;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a,
    ///     0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// assert_eq!(Decoder::message_size(&buffer).unwrap(), 20);
    /// ```
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes([bytes[2], bytes[3]]) as usize + 20)
    }
}

/// compute padding size.
///
/// RFC5389 stipulates that attribute content is padded to a multiple
/// of 4.
///
/// # Test
///
/// ```
/// use ice_agent_codec::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}
