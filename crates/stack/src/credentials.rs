//! Credential mechanisms.
//!
//! Short-term: connectivity checks carry USERNAME of the form
//! `<receiver-ufrag>:<sender-ufrag>` and a MESSAGE-INTEGRITY keyed
//! with the receiver's password.  Components register an authority
//! that maps their local ufrag to that key; validation walks the
//! registered authorities.
//!
//! Long-term: a turn allocation starts unauthenticated, absorbs the
//! 401 challenge (REALM + NONCE) and retries every request with
//! USERNAME, REALM, NONCE and an integrity keyed with
//! MD5(username:realm:password).  A 438 stale nonce restarts the
//! challenge with the fresh nonce.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use codec::{
    attribute::{ErrKind, ErrorCode, MessageIntegrity, Nonce, Realm, UserName},
    crypto::long_term_key,
    message::{MessageReader, MessageWriter},
};
use parking_lot::RwLock;

/// Resolves short-term keys for local user fragments.
///
/// An authority answers only for the ufrags of the component that
/// registered it; `None` lets validation fall through to the next
/// authority.
pub trait CredentialsAuthority: Send + Sync {
    fn key(&self, ufrag: &str) -> Option<Vec<u8>>;
}

/// Validation verdict for an inbound request, mapped to an error
/// response by the stack.
#[derive(Debug)]
pub enum Rejection {
    Unauthorized {
        realm: Option<String>,
        nonce: Option<String>,
    },
    UnknownAttributes(Vec<u16>),
}

#[derive(Default)]
pub struct CredentialsManager {
    authorities: RwLock<Vec<(u64, Arc<dyn CredentialsAuthority>)>>,
    ids: AtomicU64,
}

impl CredentialsManager {
    pub fn register(&self, authority: Arc<dyn CredentialsAuthority>) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.authorities.write().push((id, authority));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.authorities.write().retain(|(i, _)| *i != id);
    }

    /// short-term key lookup across every registered authority.
    pub fn key(&self, ufrag: &str) -> Option<Vec<u8>> {
        self.authorities
            .read()
            .iter()
            .find_map(|(_, authority)| authority.key(ufrag))
    }

    /// Request admission checks, in order:
    ///
    /// 1. a USERNAME whose local fragment no registered authority
    ///    recognises is rejected with 401;
    /// 2. a MESSAGE-INTEGRITY that does not verify against the stored
    ///    key is rejected with 401;
    /// 3. a missing MESSAGE-INTEGRITY is rejected with 401 when the
    ///    stack is configured to require it;
    /// 4. any unknown comprehension-required attribute is rejected
    ///    with 420 listing the offending types.
    pub(crate) fn validate(
        &self,
        message: &MessageReader,
        require_integrity: bool,
    ) -> Result<(), Rejection> {
        let mut key = None;

        if let Some(username) = message.get::<UserName>() {
            let local = username.split(':').next().unwrap_or(username);
            key = self.key(local);

            if key.is_none() {
                return Err(Rejection::Unauthorized {
                    realm: None,
                    nonce: None,
                });
            }
        }

        if message.get::<MessageIntegrity>().is_some() {
            match &key {
                Some(key) if message.integrity(key).is_ok() => {}
                _ => {
                    return Err(Rejection::Unauthorized {
                        realm: None,
                        nonce: None,
                    });
                }
            }
        } else if require_integrity {
            return Err(Rejection::Unauthorized {
                realm: None,
                nonce: None,
            });
        }

        let unknown = message.unknown_required();
        if !unknown.is_empty() {
            return Err(Rejection::UnknownAttributes(unknown));
        }

        Ok(())
    }
}

/// Client-side long-term credential state for one server.
///
/// Remembers the `(realm, nonce)` pair of the last challenge so every
/// subsequent request on the session can be authenticated without a
/// fresh round-trip.
#[derive(Debug, Clone)]
pub struct LongTermSession {
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
}

impl LongTermSession {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
            nonce: None,
        }
    }

    /// Whether the session has absorbed a challenge and can sign
    /// requests.
    pub fn is_ready(&self) -> bool {
        self.realm.is_some() && self.nonce.is_some()
    }

    /// The integrity key, once a realm is known.
    pub fn key(&self) -> Option<[u8; 16]> {
        let realm = self.realm.as_deref()?;
        Some(long_term_key(&self.username, realm, &self.password))
    }

    /// Digest a 401 or 438 error response.  Returns true when the
    /// challenge supplied usable material and the request should be
    /// retried; a 401 on an already-authenticated session means the
    /// credentials themselves are wrong and retrying is pointless.
    pub fn challenge(&mut self, message: &MessageReader) -> bool {
        let Some(error) = message.get::<ErrorCode>() else {
            return false;
        };

        let stale = error.kind() == Some(ErrKind::StaleNonce);
        let unauthorized = error.kind() == Some(ErrKind::Unauthorized);
        if !stale && !unauthorized {
            return false;
        }

        if unauthorized && self.is_ready() {
            return false;
        }

        let (Some(realm), Some(nonce)) = (message.get::<Realm>(), message.get::<Nonce>()) else {
            return false;
        };

        self.realm = Some(realm.to_string());
        self.nonce = Some(nonce.to_string());
        true
    }

    /// Stamp USERNAME, REALM and NONCE onto an outbound request.  The
    /// caller seals the message with `flush(self.key())`.
    pub fn apply(&self, writer: &mut MessageWriter) {
        if let (Some(realm), Some(nonce)) = (self.realm.as_deref(), self.nonce.as_deref()) {
            writer.append::<UserName>(&self.username);
            writer.append::<Realm>(realm);
            writer.append::<Nonce>(nonce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use codec::{
        Attributes,
        attribute::{IceControlled, Priority},
        method::{Kind, Method},
    };

    struct StaticAuthority;

    impl CredentialsAuthority for StaticAuthority {
        fn key(&self, ufrag: &str) -> Option<Vec<u8>> {
            (ufrag == "abcd").then(|| b"local-password".to_vec())
        }
    }

    fn binding_request(username: Option<&str>, key: Option<&[u8]>) -> BytesMut {
        let token = [7u8; 12];
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut bytes);

        if let Some(username) = username {
            writer.append::<UserName>(username);
        }

        writer.append::<Priority>(12345);
        writer.append::<IceControlled>(99);
        writer.flush(key).unwrap();
        bytes
    }

    #[test]
    fn validation_order() {
        let manager = CredentialsManager::default();
        manager.register(Arc::new(StaticAuthority));

        let mut attributes = Attributes::default();

        // unknown local fragment
        let bytes = binding_request(Some("wxyz:peer"), Some(&b"local-password"[..]));
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(matches!(
            manager.validate(&message, false),
            Err(Rejection::Unauthorized { .. })
        ));

        // wrong key
        let bytes = binding_request(Some("abcd:peer"), Some(&b"bad-password"[..]));
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(matches!(
            manager.validate(&message, false),
            Err(Rejection::Unauthorized { .. })
        ));

        // good key
        let bytes = binding_request(Some("abcd:peer"), Some(&b"local-password"[..]));
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(manager.validate(&message, false).is_ok());

        // integrity required but absent
        let bytes = binding_request(None, None);
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(matches!(
            manager.validate(&message, true),
            Err(Rejection::Unauthorized { .. })
        ));
        assert!(manager.validate(&message, false).is_ok());
    }

    #[test]
    fn long_term_challenge_flow() {
        let mut session = LongTermSession::new("marmot", "alpine");
        assert!(!session.is_ready());
        assert!(session.key().is_none());

        let token = [1u8; 12];
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Error), &token, &mut bytes);
        writer.append::<ErrorCode>(ErrorCode::from(ErrKind::Unauthorized));
        writer.append::<Realm>("meadow.example");
        writer.append::<Nonce>("8f0c2e5d90ab4711");
        writer.flush(None).unwrap();

        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(session.challenge(&message));
        assert!(session.is_ready());

        let key = session.key().unwrap();
        assert_eq!(key, long_term_key("marmot", "meadow.example", "alpine"));

        // a second 401 on a ready session is a credential failure,
        // not a retry hint.
        assert!(!session.challenge(&message));

        // a stale nonce rotates the nonce and allows a retry.
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Allocate(Kind::Error), &token, &mut bytes);
        writer.append::<ErrorCode>(ErrorCode::from(ErrKind::StaleNonce));
        writer.append::<Realm>("meadow.example");
        writer.append::<Nonce>("fresh");
        writer.flush(None).unwrap();

        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&bytes, &mut attributes).unwrap();
        assert!(session.challenge(&message));
        assert_eq!(session.nonce.as_deref(), Some("fresh"));
    }
}
