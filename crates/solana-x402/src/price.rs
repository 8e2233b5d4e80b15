//! Prices and currencies.
//!
//! Amounts are held in base units (lamports for SOL, the token's smallest unit
//! for SPL tokens). Parsing is integer-only: no `f64` anywhere in the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{SOL_DECIMALS, USDC_DECIMALS, USDC_MINT};
use crate::error::X402Error;

/// What a price is denominated in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Currency {
    /// Native SOL.
    Sol,
    /// SPL token identified by its mint.
    Token {
        symbol: String,
        mint: String,
        decimals: u8,
    },
}

impl Currency {
    pub fn usdc() -> Self {
        Currency::Token {
            symbol: "USDC".to_string(),
            mint: USDC_MINT.to_string(),
            decimals: USDC_DECIMALS,
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            Currency::Sol => SOL_DECIMALS,
            Currency::Token { decimals, .. } => *decimals,
        }
    }

    /// Short code shown to payers ("SOL", "USDC").
    pub fn code(&self) -> &str {
        match self {
            Currency::Sol => "SOL",
            Currency::Token { symbol, .. } => symbol,
        }
    }

    /// Mint address, `None` for native SOL.
    pub fn mint(&self) -> Option<&str> {
        match self {
            Currency::Sol => None,
            Currency::Token { mint, .. } => Some(mint),
        }
    }
}

impl FromStr for Currency {
    type Err = X402Error;

    /// Accepts `SOL`, `USDC`, or `SYMBOL:mint:decimals`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("SOL") {
            return Ok(Currency::Sol);
        }
        if s.eq_ignore_ascii_case("USDC") {
            return Ok(Currency::usdc());
        }
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [symbol, mint, decimals] => {
                crate::reference::validate_address(mint)?;
                let decimals: u8 = decimals.parse().map_err(|_| {
                    X402Error::InvalidPrice(format!("invalid token decimals in '{s}'"))
                })?;
                Ok(Currency::Token {
                    symbol: symbol.to_string(),
                    mint: mint.to_string(),
                    decimals,
                })
            }
            _ => Err(X402Error::InvalidPrice(format!("unknown currency '{s}'"))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An amount in base units plus its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: u64,
    pub currency: Currency,
}

impl Price {
    pub fn new(amount: u64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Parse a human-readable decimal (e.g. "0.01") in the given currency.
    pub fn parse(value: &str, currency: Currency) -> Result<Self, X402Error> {
        let amount = parse_decimal_amount(value, currency.decimals())?;
        Ok(Self { amount, currency })
    }

    /// Anything that would not move funds is not a price.
    pub fn is_payable(&self) -> bool {
        self.amount > 0
    }

    /// Decimal rendering with trailing zeros trimmed ("0.01", "1").
    pub fn display_amount(&self) -> String {
        format_decimal_amount(self.amount, self.currency.decimals())
    }
}

/// Parse a decimal string into base units.
///
/// Accepts an optional leading `$` and an optional trailing currency code
/// separated by whitespace ("$0.01", "0.01 SOL"); anything else that is not a
/// digit or a single decimal point is rejected.
/// Negative values parse to zero, which callers treat as "no payment".
/// Digits beyond `decimals` are truncated.
pub fn parse_decimal_amount(value: &str, decimals: u8) -> Result<u64, X402Error> {
    let invalid = |why: &str| X402Error::InvalidPrice(format!("invalid price '{value}': {why}"));

    let mut tokens = value.split_whitespace();
    let number = tokens.next().ok_or_else(|| invalid("no numeric content"))?;
    if let Some(code) = tokens.next() {
        if !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid("unexpected trailing content"));
        }
    }
    if tokens.next().is_some() {
        return Err(invalid("unexpected trailing content"));
    }

    let number = number.strip_prefix('$').unwrap_or(number);
    let (negative, cleaned) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number),
    };
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid("no numeric content"));
    }
    if let Some(bad) = cleaned.chars().find(|c| !c.is_ascii_digit() && *c != '.') {
        return Err(invalid(&format!("unexpected character '{bad}'")));
    }
    if negative {
        return Ok(0);
    }

    let overflow = || X402Error::InvalidPrice(format!("invalid price '{value}': overflow"));
    let multiplier = 10u64.checked_pow(u32::from(decimals)).ok_or_else(overflow)?;

    let (integer_part, fractional_part) = cleaned.split_once('.').unwrap_or((cleaned, ""));
    if fractional_part.contains('.') {
        return Err(X402Error::InvalidPrice(format!(
            "invalid price '{value}': more than one decimal point"
        )));
    }

    let integer: u64 = if integer_part.is_empty() {
        0
    } else {
        integer_part.parse().map_err(|e| {
            X402Error::InvalidPrice(format!("invalid price '{value}': integer part: {e}"))
        })?
    };

    let decimals = usize::from(decimals);
    let frac_str = if fractional_part.len() > decimals {
        &fractional_part[..decimals]
    } else {
        fractional_part
    };
    let fractional: u64 = if frac_str.is_empty() {
        0
    } else {
        frac_str.parse().map_err(|e| {
            X402Error::InvalidPrice(format!("invalid price '{value}': fractional part: {e}"))
        })?
    };
    let scale = 10u64
        .checked_pow((decimals - frac_str.len()) as u32)
        .ok_or_else(overflow)?;

    integer
        .checked_mul(multiplier)
        .and_then(|i| fractional.checked_mul(scale).and_then(|f| i.checked_add(f)))
        .ok_or_else(overflow)
}

/// Render base units as a decimal string without trailing zeros.
pub fn format_decimal_amount(amount: u64, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let divisor = 10u128.pow(u32::from(decimals));
    let amount = u128::from(amount);
    let integer = amount / divisor;
    let fraction = amount % divisor;
    if fraction == 0 {
        return integer.to_string();
    }
    let frac = format!("{fraction:0width$}", width = usize::from(decimals));
    format!("{integer}.{}", frac.trim_end_matches('0'))
}
