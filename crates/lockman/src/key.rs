//! Store key and lock token construction

use rand::RngCore;

use crate::config::LockConfig;
use crate::error::{LockError, Result};

/// Joins sub-key parts, and the key with its sub-key.
pub const SEPARATOR: &str = "-";

/// Optional qualifier of a logical lock key.
///
/// A sub-key may be a single string, a number, or an ordered sequence of
/// those; sequences are joined with [`SEPARATOR`], so `["x", "1"]` and
/// `"x-1"` name the same lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubKey(Vec<String>);

impl SubKey {
    pub fn joined(&self) -> String {
        self.0.join(SEPARATOR)
    }
}

impl From<&str> for SubKey {
    fn from(value: &str) -> Self {
        SubKey(vec![value.to_string()])
    }
}

impl From<String> for SubKey {
    fn from(value: String) -> Self {
        SubKey(vec![value])
    }
}

impl From<&String> for SubKey {
    fn from(value: &String) -> Self {
        SubKey(vec![value.clone()])
    }
}

macro_rules! sub_key_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for SubKey {
                fn from(value: $ty) -> Self {
                    SubKey(vec![value.to_string()])
                }
            }
        )*
    };
}

sub_key_from_number!(i32, i64, u32, u64, usize);

impl<T: ToString> From<Vec<T>> for SubKey {
    fn from(value: Vec<T>) -> Self {
        SubKey(value.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString> From<&[T]> for SubKey {
    fn from(value: &[T]) -> Self {
        SubKey(value.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString, const N: usize> From<[T; N]> for SubKey {
    fn from(value: [T; N]) -> Self {
        SubKey(value.iter().map(ToString::to_string).collect())
    }
}

/// Builds store keys and ownership tokens from the configured prefixes.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    key_prefix: String,
    value_prefix: Option<String>,
    value_length: usize,
}

impl KeyCodec {
    pub fn new(key_prefix: &str, value_prefix: Option<&str>, value_length: usize) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            value_prefix: value_prefix.map(str::to_string),
            value_length,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(
            &config.key_prefix,
            config.value_prefix.as_deref(),
            config.value_length,
        )
    }

    /// `prefix + key [+ "-" + sub_key]`. An empty sub-key counts as absent.
    pub fn build_key(&self, key: &str, sub_key: Option<&SubKey>) -> Result<String> {
        if key.is_empty() {
            return Err(LockError::InvalidArgument(
                "lock key must not be empty".to_string(),
            ));
        }

        let mut store_key = format!("{}{}", self.key_prefix, key);
        if let Some(sub_key) = sub_key {
            let joined = sub_key.joined();
            if !joined.is_empty() {
                store_key.push_str(SEPARATOR);
                store_key.push_str(&joined);
            }
        }
        Ok(store_key)
    }

    /// Fresh random token: `value_length` hex chars after the optional prefix.
    pub fn build_token(&self) -> String {
        let mut bytes = vec![0u8; self.value_length.div_ceil(2)];
        rand::rng().fill_bytes(&mut bytes);
        let mut hex = const_hex::encode(&bytes);
        hex.truncate(self.value_length);

        match &self.value_prefix {
            Some(prefix) => format!("{}{}", prefix, hex),
            None => hex,
        }
    }
}
