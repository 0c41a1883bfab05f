use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Token value in atomic units.
pub type TokenAmount = u128;

/// Chain height.
pub type ChainEpoch = i64;

/// Identifier of a lane within a flow channel.
pub type LaneId = u64;

/// Opaque account identifier on the chain.
///
/// Addresses are compared by their canonical string form only; no ordering
/// between addresses carries any meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create an address from its canonical string form.
    pub fn new(addr: impl Into<String>) -> Result<Self, CoreError> {
        let addr = addr.into();
        if addr.is_empty() {
            return Err(CoreError::InvalidAddress("address must not be empty".into()));
        }
        if addr.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidAddress(format!(
                "address must not contain whitespace: {:?}",
                addr
            )));
        }
        Ok(Self(addr))
    }

    /// Decode an address from its UTF-8 byte form (as returned in receipts).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| CoreError::InvalidAddress(format!("address is not UTF-8: {}", e)))?;
        Self::new(s)
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The byte form used inside encoded payloads and receipts.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a chain message (32-byte content hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(pub [u8; 32]);

impl MsgId {
    /// Derive a message id from the message's encoded bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)
            .map_err(|e| CoreError::ValidationError(format!("invalid message id hex: {}", e)))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CoreError::ValidationError(format!(
                "message id must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Which side of a channel the local node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Local node is the payee (`to`); it receives vouchers.
    Inbound,
    /// Local node is the payer (`from`); it funds the channel and issues vouchers.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "Inbound"),
            Self::Outbound => write!(f, "Outbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_rejects_empty() {
        assert!(matches!(Address::new(""), Err(CoreError::InvalidAddress(_))));
        assert!(matches!(Address::new("f1 abc"), Err(CoreError::InvalidAddress(_))));
    }

    #[test]
    fn test_address_bytes_and_parse() {
        let addr: Address = "f1alice".parse().unwrap();
        assert_eq!(addr.as_str(), "f1alice");
        assert_eq!(Address::from_bytes(&addr.to_bytes()).unwrap(), addr);
        assert_eq!(format!("{}", addr), "f1alice");
    }

    #[test]
    fn test_address_from_invalid_utf8() {
        assert!(Address::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_msg_id_hex_roundtrip() {
        let id = MsgId::digest(b"message");
        let parsed = MsgId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 64);
        assert!(MsgId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_msg_id_digest_is_deterministic() {
        assert_eq!(MsgId::digest(b"a"), MsgId::digest(b"a"));
        assert_ne!(MsgId::digest(b"a"), MsgId::digest(b"b"));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(format!("{}", Direction::Inbound), "Inbound");
        assert_eq!(format!("{}", Direction::Outbound), "Outbound");
    }
}
