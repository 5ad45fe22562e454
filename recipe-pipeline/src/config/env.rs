//! Typed access to environment-style key/value sources.

use std::collections::HashMap;
use std::str::FromStr;

use crate::{Error, Result};

/// A source of `KEY=value` settings.
///
/// The process environment in production, a map in tests.
pub enum EnvSource {
    Process,
    Map(HashMap<String, String>),
}

impl EnvSource {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Raw value; blank values count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self {
            Self::Process => std::env::var(key).ok(),
            Self::Map(map) => map.get(key).cloned(),
        }?;
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Parse `key` if set. A value that fails to parse is a configuration error.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::config(format!("{}={:?}: {}", key, raw, e)))
            })
            .transpose()
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Boolean flag accepting `1/0`, `true/false`, `yes/no`, `on/off`.
    pub fn flag_or(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::config(format!("{}={:?}: expected a boolean", key, raw))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_values_are_unset() {
        let env = EnvSource::from_pairs([("A", "  "), ("B", " x ")]);
        assert_eq!(env.get("A"), None);
        assert_eq!(env.get("B").as_deref(), Some("x"));
    }

    #[test]
    fn test_parse_errors_name_the_key() {
        let env = EnvSource::from_pairs([("PORT", "eighty")]);
        let err = env.parse::<u16>("PORT").unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert_eq!(env.parse_or::<u16>("MISSING", 7).unwrap(), 7);
    }

    #[test]
    fn test_flags() {
        let env = EnvSource::from_pairs([("ON", "Yes"), ("BAD", "maybe")]);
        assert!(env.flag_or("ON", false).unwrap());
        assert!(!env.flag_or("UNSET", false).unwrap());
        assert!(env.flag_or("BAD", false).is_err());
    }
}
