use bytes::{BufMut, BytesMut};

use crate::{
    Attributes, Error, MAGIC_COOKIE, Token, alignment_32,
    attribute::{AttrKind, Attribute},
    crypto::{fingerprint, hmac_sha1},
    method::Method,
};

/// STUN message encoder.
///
/// Appends a header and typed attributes into an external `BytesMut`,
/// then fixes up the header length (and optionally MESSAGE-INTEGRITY +
/// FINGERPRINT) on `flush`.
pub struct MessageWriter<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageWriter<'a> {
    pub fn new(method: Method, token: &'a Token, bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_COOKIE);
        bytes.put(token.as_slice());

        Self { bytes, token }
    }

    /// rely on old message to create new message.
    ///
    /// The response to a request reuses the transaction id of the
    /// request, this is how the two are correlated.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use ice_agent_codec::Decoder;
    /// use ice_agent_codec::message::MessageWriter;
    /// use ice_agent_codec::method::{Kind, Method};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a,
    ///     0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let mut buf = BytesMut::new();
    /// let old = decoder.decode(&buffer[..]).unwrap();
    /// MessageWriter::extend(Method::Binding(Kind::Request), &old, &mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &MessageReader<'a>, bytes: &'a mut BytesMut) -> Self {
        let token = reader.token();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_COOKIE);
        bytes.put(token);
        Self { bytes, token }
    }

    /// append attribute.
    ///
    /// append attribute to message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use ice_agent_codec::Decoder;
    /// use ice_agent_codec::attribute::UserName;
    /// use ice_agent_codec::message::MessageWriter;
    /// use ice_agent_codec::method::{Kind, Method};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a,
    ///     0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// // USERNAME is 9 bytes long here, so three padding bytes close
    /// // the attribute.
    /// let new_buf = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a,
    ///     0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95, 0x00, 0x06, 0x00,
    ///     0x09, 0x6d, 0x4a, 0x77, 0x39, 0x3a, 0x62, 0x45, 0x74, 0x37, 0x00, 0x00,
    ///     0x00,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let mut buf = BytesMut::new();
    /// let old = decoder.decode(&buffer[..]).unwrap();
    /// let mut message =
    ///     MessageWriter::extend(Method::Binding(Kind::Request), &old, &mut buf);
    ///
    /// message.append::<UserName>("mJw9:bEt7");
    ///
    /// assert_eq!(&new_buf[..], &buf[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // reserve the attribute length field, the real size is known
        // only after the value has been serialized.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.token);

        let size = self.bytes.len() - os - 2;
        self.bytes[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());

        // if you need to padding, padding in the zero bytes.
        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put(&[0u8; 10][0..psize]);
        }
    }

    /// write the header length field, then optionally seal the message
    /// with MESSAGE-INTEGRITY and FINGERPRINT.
    pub fn flush(&mut self, key: Option<&[u8]>) -> Result<(), Error> {
        self.set_len(self.bytes.len() - 20);

        if let Some(key) = key {
            self.integrity(key)?;
        }

        Ok(())
    }

    /// append MessageIntegrity attribute.
    ///
    /// The header length field is rewritten to include the integrity
    /// attribute before the digest is computed, and rewritten again for
    /// the trailing fingerprint.
    fn integrity(&mut self, key: &[u8]) -> Result<(), Error> {
        debug_assert!(self.bytes.len() >= 20);
        let len = self.bytes.len();

        // compute new size, new size include the MessageIntegrity
        // attribute size.
        self.set_len(len + 4);

        let hmac = hmac_sha1(key, &[self.bytes])?;
        self.bytes.put_u16(AttrKind::MessageIntegrity as u16);
        self.bytes.put_u16(20);
        self.bytes.put(hmac.as_slice());

        // compute new size, new size include the Fingerprint attribute
        // size.
        self.set_len(len + 4 + 8);

        let crc = fingerprint(self.bytes);
        self.bytes.put_u16(AttrKind::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(crc);

        Ok(())
    }

    // set stun message header size.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

/// Zero-copy view over a decoded STUN message.
///
/// Attribute values are read lazily out of the source buffer through
/// the external attribute cache filled in by `decode`.
pub struct MessageReader<'a> {
    /// message method.
    method: Method,
    /// message source bytes.
    bytes: &'a [u8],
    /// offset of the MessageIntegrity attribute, zero when the message
    /// does not carry one.
    size: u16,
    // message attribute list.
    attributes: &'a Attributes,
}

impl<'a> MessageReader<'a> {
    /// message method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// message source bytes, as they arrived on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// get attribute.
    ///
    /// get attribute from message attribute list.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(T::TYPE)?;
        T::deserialize(&self.bytes[range], self.token()).ok()
    }

    /// Gets all the values of an attribute from the list.
    pub fn get_all<T: Attribute<'a> + 'a>(&self) -> impl Iterator<Item = T::Item> + 'a {
        let (bytes, token) = (self.bytes, self.token());
        self.attributes
            .get_all(T::TYPE)
            .map(move |it| T::deserialize(&bytes[it.clone()], token))
            .filter_map(|it| it.ok())
    }

    /// comprehension-required attribute types this decoder does not
    /// understand; a non-empty list on a request mandates a 420 error
    /// response listing them.
    pub fn unknown_required(&self) -> Vec<u16> {
        self.attributes.unknown_required()
    }

    /// check MessageIntegrity attribute.
    ///
    /// The digest covers the message up to the integrity attribute
    /// with the header length field rewritten to end just past it,
    /// which excludes the trailing fingerprint.
    pub fn integrity(&self, key: &[u8]) -> Result<(), Error> {
        if self.bytes.is_empty() || self.size < 20 {
            return Err(Error::NotFoundIntegrity);
        }

        let integrity = self
            .get::<crate::attribute::MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        // create multiple submit.
        let size_buf = (self.size + 4).to_be_bytes();
        let body = [
            &self.bytes[0..2],
            &size_buf,
            &self.bytes[4..self.size as usize],
        ];

        if integrity != hmac_sha1(key, &body)?.as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::Attributes;
    /// use ice_agent_codec::attribute::UserName;
    /// use ice_agent_codec::message::MessageReader;
    /// use ice_agent_codec::method::{Kind, Method};
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a, 0x33,
    ///     0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), Method::Binding(Kind::Request));
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        // There must be at least a complete header.
        if len < 20 {
            return Err(Error::TruncatedHeader);
        }

        let method = Method::try_from(u16::from_be_bytes([bytes[0], bytes[1]]))?;

        // The length field does not include the 20 byte header, and is
        // always a multiple of 4 because attributes are padded.
        let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if size % 4 != 0 {
            return Err(Error::UnalignedLength);
        }

        let end = size + 20;
        if len < end {
            return Err(Error::TruncatedHeader);
        }

        // Check whether the magic cookie is the same.
        if bytes[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(Error::NotFoundMagicCookie);
        }

        let mut integrity_offset = 0;
        let mut offset = 20;

        while offset + 4 <= end {
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            // Once the integrity attribute has been seen, only the
            // fingerprint may follow it.
            if integrity_offset > 0 && key != AttrKind::Fingerprint as u16 {
                return Err(Error::MisplacedIntegrity);
            }

            if key == AttrKind::MessageIntegrity as u16 {
                integrity_offset = offset;
            }

            // check if the attribute length has overflowed.
            offset += 4;
            if end - offset < size {
                return Err(Error::InvalidInput);
            }

            // body range, padding skipped.
            let range = offset..(offset + size);
            offset += size + alignment_32(size);

            // insert attribute to attributes list, raw unknown types
            // included so they survive a re-encode.
            attributes.append(key, range);
        }

        Ok(Self {
            size: integrity_offset as u16,
            attributes,
            method,
            bytes,
        })
    }

    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::message::MessageReader;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a, 0x33,
    ///     0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
    /// ];
    ///
    /// assert_eq!(MessageReader::message_size(&buffer[..]).unwrap(), 20);
    /// ```
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes([bytes[2], bytes[3]]) as usize + 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::*;
    use crate::crypto::long_term_key;
    use crate::method::{Kind, Method};

    // A connectivity check from a controlled agent: USERNAME
    // "mJw9:bEt7", PRIORITY, ICE-CONTROLLED, sealed with the
    // short-term password below and a trailing fingerprint.
    const CHECK_PASSWORD: &[u8] = b"x7K2mQ9pLwZ4vT8rB3nYdFhj";

    const BINDING_CHECK: [u8; 88] = [
        0x00, 0x01, 0x00, 0x44, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a, 0x33, 0x47, 0xc2, 0x09,
        0x6b, 0xf0, 0x74, 0x2b, 0x95, 0x00, 0x06, 0x00, 0x09, 0x6d, 0x4a, 0x77, 0x39, 0x3a, 0x62,
        0x45, 0x74, 0x37, 0x00, 0x00, 0x00, 0x00, 0x24, 0x00, 0x04, 0x6e, 0x7f, 0x1e, 0xff, 0x80,
        0x29, 0x00, 0x08, 0x4a, 0x7d, 0xb6, 0xe3, 0x09, 0x0b, 0xfa, 0x41, 0x00, 0x08, 0x00, 0x14,
        0x3e, 0x02, 0xb1, 0xf3, 0x37, 0xe3, 0x1a, 0xfd, 0x4e, 0x77, 0xa5, 0x64, 0xf5, 0x7c, 0x86,
        0xb4, 0xa8, 0xee, 0x4d, 0x2a, 0x80, 0x28, 0x00, 0x04, 0x92, 0x89, 0x5d, 0x87,
    ];

    #[test]
    fn decode_binding_check() {
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&BINDING_CHECK, &mut attributes).unwrap();

        assert_eq!(message.method(), Method::Binding(Kind::Request));
        assert_eq!(message.get::<UserName>(), Some("mJw9:bEt7"));
        assert_eq!(message.get::<Priority>(), Some(0x6e7f1eff));
        assert_eq!(message.get::<IceControlled>(), Some(0x4a7db6e3090bfa41));
        assert_eq!(message.get::<Fingerprint>(), Some(0x92895d87));
        assert!(message.unknown_required().is_empty());
    }

    #[test]
    fn verify_integrity() {
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&BINDING_CHECK, &mut attributes).unwrap();

        assert!(message.integrity(CHECK_PASSWORD).is_ok());
        assert!(message.integrity(b"some other password").is_err());
    }

    #[test]
    fn writer_reproduces_fixture() {
        let token: Token = BINDING_CHECK[8..20].try_into().unwrap();
        let mut buf = BytesMut::with_capacity(128);

        let mut writer = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);
        writer.append::<UserName>("mJw9:bEt7");
        writer.append::<Priority>(0x6e7f1eff);
        writer.append::<IceControlled>(0x4a7db6e3090bfa41);
        writer.flush(Some(CHECK_PASSWORD)).unwrap();

        assert_eq!(&buf[..], &BINDING_CHECK[..]);
    }

    #[test]
    fn seal_and_verify_roundtrip() {
        let token = [0x5bu8; 12];
        let key = long_term_key("marmot", "meadow.example", "alpine");

        let mut buf = BytesMut::with_capacity(1280);
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Request), &token, &mut buf);

        writer.append::<RequestedTransport>(0x11);
        writer.append::<UserName>("marmot");
        writer.append::<Realm>("meadow.example");
        writer.append::<Nonce>("8f0c2e5d90ab4711");
        writer.flush(Some(&key)).unwrap();

        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&buf, &mut attributes).unwrap();

        assert_eq!(message.get::<UserName>(), Some("marmot"));
        assert_eq!(message.get::<Realm>(), Some("meadow.example"));
        assert_eq!(message.get::<Nonce>(), Some("8f0c2e5d90ab4711"));
        assert!(message.get::<Fingerprint>().is_some());
        assert!(message.integrity(&key).is_ok());
    }

    #[test]
    fn unknown_comprehension_required() {
        let token = [0x21u8; 12];
        let mut buf = BytesMut::with_capacity(128);

        {
            let mut writer =
                MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);
            writer.flush(None).unwrap();
        }

        // splice in an unassigned comprehension-required attribute.
        buf.put_u16(0x7f00);
        buf.put_u16(4);
        buf.put_u32(0);
        let len = (buf.len() - 20) as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());

        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&buf, &mut attributes).unwrap();
        assert_eq!(message.unknown_required(), vec![0x7f00]);
    }

    #[test]
    fn reject_attribute_after_integrity() {
        let token = [0x31u8; 12];
        let mut buf = BytesMut::with_capacity(128);

        {
            let mut writer =
                MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);
            writer.flush(Some(b"secret".as_slice())).unwrap();
        }

        // a priority attribute after message integrity is malformed,
        // only the fingerprint may trail it.
        buf.put_u16(AttrKind::Priority as u16);
        buf.put_u16(4);
        buf.put_u32(1);
        let len = (buf.len() - 20) as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());

        let mut attributes = Attributes::default();
        assert!(matches!(
            MessageReader::decode(&buf, &mut attributes),
            Err(Error::MisplacedIntegrity)
        ));
    }
}
