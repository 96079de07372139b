//! Numeric conversions between the canonical 256-bit values and the narrower
//! representations some destination chains use.

use alloy::primitives::U256;

/// Explicit narrowing failure; values are never truncated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("{field} value {value} does not fit in {target}")]
    Overflow {
        field: &'static str,
        value: U256,
        target: &'static str,
    },
}

/// Narrow a U256 into any primitive unsigned integer that `U256` converts into.
pub fn narrow<T>(field: &'static str, value: U256) -> Result<T, ConversionError>
where
    T: TryFrom<U256>,
{
    T::try_from(value).map_err(|_| ConversionError::Overflow {
        field,
        value,
        target: std::any::type_name::<T>(),
    })
}

/// Parse a decimal or `0x`-prefixed hex string.
pub fn parse_u256(raw: &str) -> Result<U256, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty numeric string".to_string());
    }
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(raw, 10),
    };
    parsed.map_err(|e| format!("invalid 256-bit integer {:?}: {}", raw, e))
}

/// Serde adapter: U256 is written as a decimal string and read from a JSON
/// number, a decimal string, or a hex string.
pub mod u256_dec {
    use super::parse_u256;
    use alloy::primitives::U256;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct U256Visitor;

        impl<'de> Visitor<'de> for U256Visitor {
            type Value = U256;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative integer, decimal string, or 0x hex string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<U256, E> {
                Ok(U256::from(v))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<U256, E> {
                Ok(U256::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<U256, E> {
                u64::try_from(v)
                    .map(U256::from)
                    .map_err(|_| E::custom(format!("negative value {}", v)))
            }

            // Large JSON numbers arrive as floats and have already lost precision
            fn visit_f64<E: de::Error>(self, v: f64) -> Result<U256, E> {
                Err(E::custom(format!(
                    "number {} is not exactly representable; send it as a string",
                    v
                )))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<U256, E> {
                parse_u256(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(U256Visitor)
    }
}
