use std::{fmt, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::WardenError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An environment variable passed into a server or installer container.
///
/// The panel hands variables over in `KEY=VALUE` form; this type keeps the
/// two sides apart and renders them back the same way.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct EnvPair {
    /// The environment variable name.
    var: String,

    /// The value of the environment variable.
    value: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvPair {
    /// Creates a new `EnvPair` with the given variable name and value.
    pub fn new<S: Into<String>>(var: S, value: S) -> Self {
        Self {
            var: var.into(),
            value: value.into(),
        }
    }

    /// Whether this pair may be injected into a container.
    ///
    /// Pairs with an empty name or an empty value are silently dropped when
    /// building container environments.
    pub fn is_injectable(&self) -> bool {
        !self.var.is_empty() && !self.value.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for EnvPair {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (var, value) = s
            .split_once('=')
            .ok_or_else(|| WardenError::InvalidEnvPair(s.to_string()))?;

        if var.is_empty() {
            return Err(WardenError::InvalidEnvPair(s.to_string()));
        }

        Ok(Self::new(var, value))
    }
}

impl fmt::Display for EnvPair {
    /// Formats the environment variable pair following the format "<var>=<value>".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.var, self.value)
    }
}

impl Serialize for EnvPair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EnvPair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
