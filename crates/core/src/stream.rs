//! Stream identity, positions and optimistic-concurrency expectations.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Name of one append-only, strictly ordered log.
///
/// Stream names are never empty. Names starting with `$` are reserved for
/// system streams by convention; the type does not forbid them because
/// readers still need to address those streams.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    /// Create a stream name, rejecting empty or whitespace-only values.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::invalid_stream_name("stream name must not be empty"));
        }
        Ok(Self(name))
    }

    /// Conventional `{category}-{id}` stream name.
    pub fn for_entity(category: &str, id: impl fmt::Display) -> Result<Self, CoreError> {
        Self::new(format!("{category}-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category prefix (everything before the first `-`).
    pub fn category(&self) -> &str {
        self.0.split_once('-').map(|(c, _)| c).unwrap_or(&self.0)
    }

    /// Whether the stream follows the `$`-prefixed system naming convention.
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for StreamName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StreamName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for StreamName {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(value: StreamName) -> Self {
        value.0
    }
}

/// Optimistic concurrency expectation for an append (or truncate/delete).
///
/// Stream versions are the 0-based position of the last event in the stream,
/// so a stream holding `n` events is at version `n - 1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum ExpectedStreamVersion {
    /// Skip version checking.
    Any,
    /// Require that the stream does not exist yet.
    NoStream,
    /// Require the stream to be at exactly this version.
    Exact(u64),
}

impl ExpectedStreamVersion {
    /// Check the expectation against the current version (`None` = no stream).
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedStreamVersion::Any => true,
            ExpectedStreamVersion::NoStream => current.is_none(),
            ExpectedStreamVersion::Exact(v) => current == Some(v),
        }
    }

    /// Expectation that pins an append to the given observed version.
    pub fn from_current(current: Option<u64>) -> Self {
        match current {
            Some(v) => ExpectedStreamVersion::Exact(v),
            None => ExpectedStreamVersion::NoStream,
        }
    }
}

impl fmt::Display for ExpectedStreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedStreamVersion::Any => f.write_str("any"),
            ExpectedStreamVersion::NoStream => f.write_str("no stream"),
            ExpectedStreamVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Inclusive start offset for forward reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamReadPosition(pub u64);

impl StreamReadPosition {
    pub const START: StreamReadPosition = StreamReadPosition(0);

    pub fn value(self) -> u64 {
        self.0
    }

    /// Position right after a processed checkpoint (or the start when absent).
    pub fn after(checkpoint: Option<u64>) -> Self {
        match checkpoint {
            Some(p) => StreamReadPosition(p.saturating_add(1)),
            None => StreamReadPosition::START,
        }
    }
}

impl From<u64> for StreamReadPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Events before this position are no longer readable after a truncate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamTruncatePosition(pub u64);

impl StreamTruncatePosition {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamTruncatePosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
