//! XOR distance and proximity order.
//!
//! Both are pure functions of two addresses and safe to call from any
//! number of tasks at once.

use std::cmp::Ordering;

use crate::{Address, Error, Result};

/// XOR distance between two addresses, as a big-endian unsigned integer.
///
/// Equality, hashing and ordering are numeric: leading zero bytes are
/// insignificant, so distances of different widths still compare by value.
#[derive(Debug, Clone)]
pub struct Distance(Vec<u8>);

impl Distance {
    /// Big-endian bytes, as wide as the addresses it was computed from.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True only for the distance of an address to itself.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, which equals the proximity order.
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn significant(&self) -> &[u8] {
        let start = self.0.iter().position(|b| *b != 0).unwrap_or(self.0.len());
        &self.0[start..]
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for Distance {}

impl std::hash::Hash for Distance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(self.significant(), state);
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.significant(), other.significant());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// XOR distance between `x` and `y`.
///
/// Fails with [`Error::LengthMismatch`] when the widths differ.
pub fn distance(x: &Address, y: &Address) -> Result<Distance> {
    if x.len() != y.len() {
        return Err(Error::LengthMismatch {
            left: x.len(),
            right: y.len(),
        });
    }
    Ok(Distance(
        x.as_bytes()
            .iter()
            .zip(y.as_bytes())
            .map(|(a, b)| a ^ b)
            .collect(),
    ))
}

/// Number of leading bits shared by `x` and `y`.
///
/// Identical addresses return their full bit length. Mixed widths are
/// compared over the common prefix only.
pub fn proximity(x: &Address, y: &Address) -> usize {
    let (a, b) = (x.as_bytes(), y.as_bytes());
    for (i, (p, q)) in a.iter().zip(b).enumerate() {
        let xor = p ^ q;
        if xor != 0 {
            return i * 8 + xor.leading_zeros() as usize;
        }
    }
    a.len().min(b.len()) * 8
}

/// Compare how close `a` and `b` are to `target`.
///
/// `Ordering::Less` means `a` is closer.
pub fn distance_cmp(target: &Address, a: &Address, b: &Address) -> Result<Ordering> {
    Ok(distance(target, a)?.cmp(&distance(target, b)?))
}
