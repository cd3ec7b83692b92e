//! Overlay and chunk addresses.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A fixed-width address in the swarm's key space.
///
/// The same type identifies nodes (overlay addresses) and chunks. Width is
/// not enforced at construction; metric functions reject mixed widths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address(Vec<u8>);

impl Address {
    /// Create an address from owned bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Create an address by copying a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// The all-zero address of the given width.
    pub fn zero(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check for a zero-width address.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Width in bits. Also the proximity of an address to itself.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Value of bit `index`, counting from the most significant bit.
    ///
    /// `None` when `index` is not below [`bit_len`](Self::bit_len).
    pub fn bit(&self, index: usize) -> Option<bool> {
        self.0
            .get(index / 8)
            .map(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    /// Copy of this address with bit `index` inverted.
    ///
    /// Flipping bit `po` yields an address at exactly proximity `po`.
    /// `None` when `index` is out of range.
    pub fn with_flipped_bit(&self, index: usize) -> Option<Self> {
        let mut bytes = self.0.clone();
        *bytes.get_mut(index / 8)? ^= 0x80 >> (index % 8);
        Some(Self(bytes))
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Hex encoding of the first `bytes` bytes, used as a routing target hint.
    pub fn prefix_hex(&self, bytes: usize) -> String {
        hex::encode(&self.0[..bytes.min(self.0.len())])
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s.trim_start_matches("0x"))
            .map(Self)
            .map_err(|e| Error::InvalidAddress(format!("{s:?}: {e}")))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        if hex.len() > 16 {
            write!(f, "{}...", &hex[..16])
        } else {
            f.write_str(&hex)
        }
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_hex()
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}
