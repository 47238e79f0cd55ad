pub mod client;
pub mod server;

use rand::RngCore;

/// 96-bit transaction identifier.
///
/// Cryptographically random, chosen by the request sender, echoed by
/// the responder.  The id is the correlation key for both transaction
/// tables, and connectivity checks additionally use it to find the
/// candidate pair a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl TryFrom<&[u8]> for TransactionId {
    type Error = codec::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(value.try_into().map_err(codec::Error::from)?))
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(value: [u8; 12]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}
