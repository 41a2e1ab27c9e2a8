//! Block identifiers.
//!
//! Staged blocks are identified by their sequence index rendered as a fixed-width, zero-padded decimal string.
//! Such a string only uses characters from the base64 alphabet and its length is a multiple of 4, so it is already
//! a canonical base64 token as required by block staging protocols, and it keeps lexicographic order equal to
//! numeric order. Encoding the digits once more (as it is often done) would break that order.

use std::fmt;

use crate::Error;

/// Number of digits of an encoded block index.
pub const INDEX_WIDTH: usize = 16;

/// Greatest index that fits [`INDEX_WIDTH`] digits.
pub const MAX_INDEX: u64 = 10_u64.pow(INDEX_WIDTH as u32) - 1;

/// A fixed-width, order-preserving block identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(String);

impl BlockId {
    /// Encode a sequence index.
    ///
    /// # Errors
    /// Fails with [`Error::IndexOverflow`] rather than truncating when `index > MAX_INDEX`.
    pub fn new(index: u64) -> Result<Self, Error> {
        if index > MAX_INDEX {
            return Err(Error::IndexOverflow(index));
        }

        Ok(Self(format!("{index:0width$}", width = INDEX_WIDTH)))
    }

    /// Decode the sequence index back.
    pub fn index(&self) -> u64 {
        self.0.parse().unwrap_or_default() // only built from `BlockId::new`
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlockId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::*;

    #[test]
    fn test_fixed_width() {
        for index in [0, 1, 42, 9_999, MAX_INDEX] {
            assert_eq!(BlockId::new(index).unwrap().as_str().len(), INDEX_WIDTH);
        }
        assert_eq!(BlockId::new(7).unwrap().as_str(), "0000000000000007");
    }

    #[test]
    fn test_order_preserving() {
        let indexes = [0, 1, 2, 3, 4, 9, 10, 11, 99, 100, 1_000, 123_456_789, MAX_INDEX - 1, MAX_INDEX];

        let ids: Vec<_> = indexes.iter().map(|&i| BlockId::new(i).unwrap()).collect();

        assert!(ids.windows(2).all(|w| w[0].as_str() < w[1].as_str()));
    }

    #[test]
    fn test_index_roundtrip() {
        assert_eq!(BlockId::new(0).unwrap().index(), 0);
        assert_eq!(BlockId::new(31_337).unwrap().index(), 31_337);
        assert_eq!(BlockId::new(MAX_INDEX).unwrap().index(), MAX_INDEX);
    }

    #[test]
    fn test_valid_base64() {
        let id = BlockId::new(123).unwrap();
        let decoded = STANDARD.decode(id.as_str()).unwrap();

        assert_eq!(decoded.len(), INDEX_WIDTH / 4 * 3);
        assert_eq!(STANDARD.encode(decoded), id.as_str());
    }

    #[test]
    fn test_overflow() {
        assert!(matches!(BlockId::new(MAX_INDEX + 1), Err(Error::IndexOverflow(i)) if i == MAX_INDEX + 1));
        assert!(matches!(BlockId::new(u64::MAX), Err(Error::IndexOverflow(_))));
    }
}
