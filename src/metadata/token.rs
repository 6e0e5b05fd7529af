//! Metadata tokens.
//!
//! A token packs a metadata table id into its high byte and a 1-based row index into the
//! low 24 bits. Only the type tables matter to the heap walker.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// Metadata table id of `TypeDef` rows.
pub const TABLE_TYPE_DEF: u8 = 0x02;

/// Metadata table id of `TypeRef` rows.
pub const TABLE_TYPE_REF: u8 = 0x01;

/// Metadata table id of `TypeSpec` rows.
pub const TABLE_TYPE_SPEC: u8 = 0x1B;

/// A metadata token identifying a type within its defining module.
///
/// Method tables in the runtime carry the `TypeDef` token of the type they were loaded
/// from; together with the owning module this is the stable identity of a type across
/// processes and dumps. The token is a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
///
/// Runtime-synthesized method tables (free objects, some arrays) have a null token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a `TypeDef` token for the given row
    #[must_use]
    pub fn type_def(row: u32) -> Self {
        Token((u32::from(TABLE_TYPE_DEF) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token points into the `TypeDef`, `TypeRef` or `TypeSpec` table
    /// with a non-zero row.
    #[must_use]
    pub fn is_type(&self) -> bool {
        matches!(
            self.table(),
            TABLE_TYPE_DEF | TABLE_TYPE_REF | TABLE_TYPE_SPEC
        ) && self.row() != 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_type_def() {
        let token = Token::type_def(5);
        assert_eq!(token.value(), 0x0200_0005);
        assert_eq!(token.table(), TABLE_TYPE_DEF);
        assert_eq!(token.row(), 5);
        assert!(token.is_type());
    }

    #[test]
    fn test_token_is_type() {
        assert!(Token(0x0100_0001).is_type());
        assert!(Token(0x1B00_0010).is_type());
        assert!(!Token(0x0600_0001).is_type());
        assert!(!Token(0x0200_0000).is_type());
        assert!(!Token::default().is_type());
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token(0).is_null());
        assert!(!Token::type_def(1).is_null());
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", Token(0x0200_0001)), "0x02000001");
        let debug = format!("{:?}", Token(0x0200_0001));
        assert!(debug.contains("table: 0x02"));
        assert!(debug.contains("row: 1"));
    }
}
