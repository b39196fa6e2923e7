//! Validated primitive types for the indexing domain.
//!
//! Newtypes keep block heights, addresses and token amounts from being
//! confused in signatures, and centralize the parsing rules the storage
//! layer relies on (hex addresses, decimal amounts).

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, U256};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK NUMBER
// ═══════════════════════════════════════════════════════════════════════════════

/// Block height on the indexed chain.
///
/// RPC providers model heights as `u64`; database columns keep the full
/// `NUMERIC(78,0)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockNumber(u64);

impl BlockNumber {
    /// Create a new block number.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The next height (saturating).
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous height (saturating at 0).
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Distance to `other` when this height is ahead, otherwise 0.
    #[must_use]
    pub const fn distance_from(&self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl From<u64> for BlockNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl From<BlockNumber> for u64 {
    fn from(b: BlockNumber) -> Self {
        b.0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ETHEREUM ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Validated 20-byte address.
///
/// [`EthAddress::ZERO`] marks native value transfers in the transfer
/// store. Persisted as lowercase `0x`-prefixed hex (`CHAR(42)`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EthAddress([u8; 20]);

impl EthAddress {
    /// The zero address, used for native value transfers.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Create from a fixed-size array (infallible).
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse from hex, with or without the `0x` prefix.
    ///
    /// # Errors
    /// Returns [`InvalidAddress`] on bad length or non-hex characters.
    pub fn from_hex(s: &str) -> Result<Self, InvalidAddress> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 40 {
            return Err(InvalidAddress::WrongLength(s.len() / 2));
        }
        let bytes = hex::decode(s).map_err(|_| InvalidAddress::InvalidHex)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| InvalidAddress::WrongLength(0))?;
        Ok(Self(arr))
    }

    /// Lowercase hex with `0x` prefix, the persisted representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Whether this is the zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Debug for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthAddress({})", self.to_hex())
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Address> for EthAddress {
    fn from(addr: Address) -> Self {
        Self(addr.0.0)
    }
}

impl From<EthAddress> for Address {
    fn from(addr: EthAddress) -> Self {
        Self::from(addr.0)
    }
}

impl From<EthAddress> for String {
    fn from(addr: EthAddress) -> Self {
        addr.to_hex()
    }
}

impl TryFrom<String> for EthAddress {
    type Error = InvalidAddress;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl FromStr for EthAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Error for invalid addresses.
#[derive(Debug, Clone, Error)]
pub enum InvalidAddress {
    /// Wrong byte length.
    #[error("wrong length: expected 20 bytes, got {0}")]
    WrongLength(usize),
    /// Non-hex characters.
    #[error("invalid hex encoding")]
    InvalidHex,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN AMOUNT
// ═══════════════════════════════════════════════════════════════════════════════

/// Non-negative token amount with full 256-bit range.
///
/// Backed by `BigDecimal` so values round-trip the `NUMERIC(78,0)`
/// columns exactly. Accepts scientific notation at system boundaries
/// (`"1e18"` from simulators and test fixtures) but always renders as a
/// plain decimal string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAmount(BigDecimal);

impl TokenAmount {
    /// Zero amount.
    #[must_use]
    pub fn zero() -> Self {
        Self(BigDecimal::from(0))
    }

    /// Parse a decimal or scientific-notation string.
    ///
    /// # Errors
    /// Returns [`InvalidAmount`] when parsing fails or the value is
    /// negative.
    pub fn parse(s: &str) -> Result<Self, InvalidAmount> {
        let value = BigDecimal::from_str(s.trim()).map_err(|_| InvalidAmount::Unparseable)?;
        if value.sign() == bigdecimal::num_bigint::Sign::Minus {
            return Err(InvalidAmount::Negative);
        }
        // Normalize so "1e18" and "1000000000000000000" compare and
        // persist identically.
        Ok(Self(value.normalized()))
    }

    /// Convert from an on-chain `U256` word.
    #[must_use]
    pub fn from_u256(value: U256) -> Self {
        // U256 renders as plain decimal, which BigDecimal always accepts.
        Self(BigDecimal::from_str(&value.to_string()).unwrap_or_default())
    }

    /// Plain decimal string (never scientific notation).
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        self.0.to_plain_string()
    }

    /// Whether the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.sign() == bigdecimal::num_bigint::Sign::NoSign
    }

    /// Convert to `sqlx::types::BigDecimal` for database binding.
    #[must_use]
    pub fn to_sql(&self) -> sqlx::types::BigDecimal {
        // Versions may differ between sqlx and our bigdecimal; strings are
        // the stable interchange.
        self.to_plain_string().parse().unwrap_or_default()
    }

    /// Create from a database `BigDecimal`.
    #[must_use]
    pub fn from_sql(value: &sqlx::types::BigDecimal) -> Self {
        Self::parse(&value.to_string()).unwrap_or_else(|_| Self::zero())
    }
}

impl fmt::Debug for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenAmount({})", self.to_plain_string())
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

impl Default for TokenAmount {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<TokenAmount> for String {
    fn from(amount: TokenAmount) -> Self {
        amount.to_plain_string()
    }
}

impl TryFrom<String> for TokenAmount {
    type Error = InvalidAmount;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// Error for invalid token amounts.
#[derive(Debug, Clone, Error)]
pub enum InvalidAmount {
    /// Amounts are unsigned.
    #[error("amount cannot be negative")]
    Negative,
    /// Not a decimal number.
    #[error("failed to parse amount")]
    Unparseable,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
