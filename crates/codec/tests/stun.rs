use anyhow::Result;
use bytes::BytesMut;
use ice_agent_codec::{
    Decoder,
    attribute::{
        ErrKind, ErrorCode, IceControlling, Lifetime, Nonce, Priority, Realm, RequestedTransport,
        Software, UseCandidate, UserName, XorMappedAddress, XorPeerAddress, XorRelayedAddress,
    },
    crypto::long_term_key,
    message::MessageWriter,
    method::{Kind, Method},
};

const TOKEN: [u8; 12] = [
    0x8e, 0x1d, 0x5a, 0x33, 0x47, 0xc2, 0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
];

#[test]
fn binding_request_with_short_term_credentials() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer = MessageWriter::new(Method::Binding(Kind::Request), &TOKEN, &mut bytes);
        writer.append::<UserName>("mJw9:bEt7");
        writer.append::<Priority>(0x6e7f1eff);
        writer.append::<IceControlling>(0x4a7db6e3090bfa41);
        writer.append::<UseCandidate>(());
        writer.flush(Some(b"x7K2mQ9pLwZ4vT8rB3nYdFhj".as_slice()))?;
    }

    let mut decoder = Decoder::default();
    let message = decoder.decode(&bytes)?;

    assert_eq!(message.method(), Method::Binding(Kind::Request));
    assert_eq!(message.token(), &TOKEN);
    assert_eq!(message.get::<UserName>(), Some("mJw9:bEt7"));
    assert_eq!(message.get::<Priority>(), Some(0x6e7f1eff));
    assert_eq!(message.get::<IceControlling>(), Some(0x4a7db6e3090bfa41));
    assert_eq!(message.get::<UseCandidate>(), Some(()));
    assert!(message.integrity(b"x7K2mQ9pLwZ4vT8rB3nYdFhj").is_ok());
    assert!(message.integrity(b"wrong").is_err());
    Ok(())
}

#[test]
fn unauthorized_allocate_challenge() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Error), &TOKEN, &mut bytes);
        writer.append::<ErrorCode>(ErrorCode::from(ErrKind::Unauthorized));
        writer.append::<Realm>("meadow.example");
        writer.append::<Nonce>("8f0c2e5d90ab4711");
        writer.append::<Software>("test-server");
        writer.flush(None)?;
    }

    let mut decoder = Decoder::default();
    let message = decoder.decode(&bytes)?;

    assert_eq!(message.method(), Method::Allocate(Kind::Error));
    assert_eq!(
        message.get::<ErrorCode>().map(|it| it.code),
        Some(ErrKind::Unauthorized as u16)
    );
    assert_eq!(message.get::<Realm>(), Some("meadow.example"));
    assert_eq!(message.get::<Nonce>(), Some("8f0c2e5d90ab4711"));
    Ok(())
}

#[test]
fn authenticated_allocate_round_trip() -> Result<()> {
    let key = long_term_key("marmot", "meadow.example", "alpine");
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Request), &TOKEN, &mut bytes);
        writer.append::<RequestedTransport>(0x11);
        writer.append::<UserName>("marmot");
        writer.append::<Realm>("meadow.example");
        writer.append::<Nonce>("8f0c2e5d90ab4711");
        writer.flush(Some(&key))?;
    }

    let mut decoder = Decoder::default();
    let message = decoder.decode(&bytes)?;

    assert_eq!(message.method(), Method::Allocate(Kind::Request));
    assert_eq!(message.get::<RequestedTransport>(), Some(0x11));
    assert!(message.integrity(&key).is_ok());
    Ok(())
}

#[test]
fn allocate_response_addresses() -> Result<()> {
    let relayed = "94.23.17.59:49152".parse()?;
    let mapped = "203.0.113.4:40000".parse()?;
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Response), &TOKEN, &mut bytes);
        writer.append::<XorRelayedAddress>(relayed);
        writer.append::<XorMappedAddress>(mapped);
        writer.append::<Lifetime>(600);
        writer.flush(None)?;
    }

    let mut decoder = Decoder::default();
    let message = decoder.decode(&bytes)?;

    assert_eq!(message.get::<XorRelayedAddress>(), Some(relayed));
    assert_eq!(message.get::<XorMappedAddress>(), Some(mapped));
    assert_eq!(message.get::<Lifetime>(), Some(600));
    Ok(())
}

#[test]
fn send_indication_payload() -> Result<()> {
    use ice_agent_codec::attribute::Data;

    let peer = "192.0.2.77:7000".parse()?;
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer = MessageWriter::new(Method::SendIndication, &TOKEN, &mut bytes);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(b"hello from the other side");
        writer.flush(None)?;
    }

    let mut decoder = Decoder::default();
    let message = decoder.decode(&bytes)?;

    assert_eq!(message.method(), Method::SendIndication);
    assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
    assert_eq!(
        message.get::<Data>(),
        Some(b"hello from the other side".as_slice())
    );
    Ok(())
}

/// Deterministic encoders produce byte-identical messages, which is
/// what the server transaction response cache relies on.
#[test]
fn encoding_is_deterministic() -> Result<()> {
    let build = || -> Result<BytesMut> {
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Response), &TOKEN, &mut bytes);
        writer.append::<XorMappedAddress>("203.0.113.4:40000".parse()?);
        writer.append::<Software>("ice-agent.test");
        writer.flush(Some(b"x7K2mQ9pLwZ4vT8rB3nYdFhj".as_slice()))?;
        Ok(bytes)
    };

    assert_eq!(&build()?[..], &build()?[..]);
    Ok(())
}
